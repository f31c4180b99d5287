//! Prompt templates and the composer that fills them.
//!
//! Every prompt the system sends to a generation provider comes from a
//! named [`PromptTemplate`] in a [`PromptRegistry`]. Templates declare the
//! variables they need; placeholders are written `{name}` and literal
//! braces are doubled (`{{`, `}}`).
//!
//! Validation happens in three places:
//!
//! | When | Check | Error |
//! |------|-------|-------|
//! | registration | every placeholder is declared | [`RagError::TemplateMismatch`] |
//! | composer construction | declared set equals what the composer supplies | [`RagError::TemplateMismatch`] |
//! | render | every declared variable is supplied | [`RagError::PromptVariableMissing`] |
//!
//! All three are programming errors and are returned, never swallowed.
//!
//! # Built-in templates
//!
//! | Name | Variables |
//! |------|-----------|
//! | `rag_query` | question, context_text |
//! | `rag_query_with_persona` | persona_context, question, context_text |
//! | `persona_context` | first_name, sender, email_count_text, topics_text, labels_text |
//! | `fallback_response` | question, context_summary |
//! | `persona_traits` | persona_name, sample_text |
//! | `persona_first_person_response` | persona_name, persona_traits, question, context_text |
//! | `email_summary` | sender, subject, date, content |
//! | `topic_extraction` | subject, content |
//! | `sentiment_analysis` | subject, content |

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::models::{Document, Persona};

pub const RAG_QUERY: &str = "rag_query";
pub const RAG_QUERY_WITH_PERSONA: &str = "rag_query_with_persona";
pub const PERSONA_CONTEXT: &str = "persona_context";
pub const FALLBACK_RESPONSE: &str = "fallback_response";
pub const PERSONA_TRAITS: &str = "persona_traits";
pub const PERSONA_FIRST_PERSON_RESPONSE: &str = "persona_first_person_response";
pub const EMAIL_SUMMARY: &str = "email_summary";
pub const TOPIC_EXTRACTION: &str = "topic_extraction";
pub const SENTIMENT_ANALYSIS: &str = "sentiment_analysis";

/// Sources listed in a fallback answer.
pub const FALLBACK_SOURCE_LIMIT: usize = 3;

/// Samples fed to the trait-derivation prompt.
pub const TRAIT_SAMPLE_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub title: String,
    pub template: String,
    pub description: String,
    pub variables: Vec<String>,
    pub version: String,
}

/// Template metadata without the body, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub title: String,
    pub description: String,
    pub variables: Vec<String>,
    pub version: String,
}

/// A user-supplied replacement for a built-in template's text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptOverride {
    pub template: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// If given, must equal the built-in variable set.
    #[serde(default)]
    pub variables: Option<Vec<String>>,
}

enum Segment<'a> {
    Text(&'a str),
    Brace(char),
    Var(&'a str),
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split a template into literal text, escaped braces and placeholders.
/// Braces that do not enclose an identifier are kept as text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let bytes = template.as_bytes();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'}' if bytes.get(i + 1) == Some(&bytes[i]) => {
                out.push(Segment::Text(&template[text_start..i]));
                out.push(Segment::Brace(bytes[i] as char));
                i += 2;
                text_start = i;
            }
            b'{' => match template[i + 1..].find('}') {
                Some(len) if is_identifier(&template[i + 1..i + 1 + len]) => {
                    out.push(Segment::Text(&template[text_start..i]));
                    out.push(Segment::Var(&template[i + 1..i + 1 + len]));
                    i += len + 2;
                    text_start = i;
                }
                _ => i += 1,
            },
            _ => i += 1,
        }
    }
    out.push(Segment::Text(&template[text_start..]));
    out
}

/// Placeholder names used in `template`.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    segments(template)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Var(name) => Some(name.to_string()),
            _ => None,
        })
        .collect()
}

impl PromptTemplate {
    pub fn new(
        name: &str,
        title: &str,
        template: &str,
        description: &str,
        variables: &[&str],
        version: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            template: template.to_string(),
            description: description.to_string(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
            version: version.to_string(),
        }
    }

    /// Every placeholder must be a declared variable.
    pub fn validate(&self) -> Result<()> {
        let declared: BTreeSet<&str> = self.variables.iter().map(String::as_str).collect();
        let undeclared: Vec<String> = placeholders(&self.template)
            .into_iter()
            .filter(|p| !declared.contains(p.as_str()))
            .collect();
        if undeclared.is_empty() {
            Ok(())
        } else {
            Err(RagError::TemplateMismatch {
                template: self.name.clone(),
                detail: format!("references undeclared variables: {}", undeclared.join(", ")),
            })
        }
    }

    /// Substitute `vars` into the template.
    ///
    /// # Errors
    ///
    /// [`RagError::PromptVariableMissing`] if any declared variable is not
    /// supplied. Extra variables are ignored.
    pub fn render(&self, vars: &[(&str, &str)]) -> Result<String> {
        let supplied: HashMap<&str, &str> = vars.iter().copied().collect();
        let missing: Vec<String> = self
            .variables
            .iter()
            .filter(|v| !supplied.contains_key(v.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RagError::PromptVariableMissing {
                template: self.name.clone(),
                missing,
            });
        }

        let mut out = String::with_capacity(self.template.len());
        for segment in segments(&self.template) {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Brace(c) => out.push(c),
                Segment::Var(name) => match supplied.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(RagError::PromptVariableMissing {
                            template: self.name.clone(),
                            missing: vec![name.to_string()],
                        })
                    }
                },
            }
        }
        Ok(out)
    }

    pub fn info(&self) -> TemplateInfo {
        TemplateInfo {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            variables: self.variables.clone(),
            version: self.version.clone(),
        }
    }
}

/// Named template store.
#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    templates: BTreeMap<String, PromptTemplate>,
}

impl PromptRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every built-in template.
    pub fn builtin() -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        Self { templates }
    }

    /// Add or replace a template after validating its placeholders.
    pub fn register(&mut self, template: PromptTemplate) -> Result<()> {
        template.validate()?;
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| RagError::UnknownTemplate(name.to_string()))
    }

    /// Fetch a template whose declared variables are exactly `variables`.
    pub fn expect(&self, name: &str, variables: &[&str]) -> Result<&PromptTemplate> {
        let template = self.get(name)?;
        let declared: BTreeSet<&str> = template.variables.iter().map(String::as_str).collect();
        let supplied: BTreeSet<&str> = variables.iter().copied().collect();
        if declared != supplied {
            return Err(RagError::TemplateMismatch {
                template: name.to_string(),
                detail: format!("declares {:?}, composer supplies {:?}", declared, supplied),
            });
        }
        Ok(template)
    }

    /// Replace the text of an existing template.
    ///
    /// The variable set cannot change: an override that declares different
    /// variables, or whose text uses an undeclared one, is rejected.
    pub fn apply_override(&mut self, name: &str, patch: PromptOverride) -> Result<()> {
        let current = self.get(name)?.clone();
        if let Some(vars) = &patch.variables {
            let wanted: BTreeSet<&str> = vars.iter().map(String::as_str).collect();
            let declared: BTreeSet<&str> = current.variables.iter().map(String::as_str).collect();
            if wanted != declared {
                return Err(RagError::TemplateMismatch {
                    template: name.to_string(),
                    detail: format!(
                        "override declares {:?}, expected {:?}",
                        wanted, declared
                    ),
                });
            }
        }
        let updated = PromptTemplate {
            template: patch.template,
            description: patch.description.unwrap_or(current.description),
            version: patch.version.unwrap_or(current.version),
            ..current
        };
        self.register(updated)
    }

    pub fn list(&self) -> Vec<TemplateInfo> {
        self.templates.values().map(PromptTemplate::info).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate::new(
            RAG_QUERY,
            "Grounded answer",
            "You are an email assistant. Answer the question using only the emails below.\n\
             \n\
             Rules:\n\
             - Use only information found in the emails.\n\
             - Cite the email behind every claim as [Source N], using the numbers shown.\n\
             - If the emails do not answer the question, say \"I don't have information about that\".\n\
             \n\
             Question: {question}\n\
             \n\
             Emails:\n\
             {context_text}\n\
             \n\
             Answer:",
            "Answer a question from retrieved emails with numbered citations",
            &["question", "context_text"],
            "2.0",
        ),
        PromptTemplate::new(
            RAG_QUERY_WITH_PERSONA,
            "Grounded answer in the sender's voice",
            "About the sender:\n\
             {persona_context}\n\
             \n\
             You are this sender. Answer in the first person, in their voice, using only the emails below.\n\
             \n\
             Rules:\n\
             - Use only information found in the emails.\n\
             - Cite the email behind every claim as [Source N], using the numbers shown.\n\
             - If the emails do not answer the question, say \"I don't have information about that\".\n\
             \n\
             Question: {question}\n\
             \n\
             Emails:\n\
             {context_text}\n\
             \n\
             Answer:",
            "Grounded answer with a sender profile block and first-person instructions",
            &["persona_context", "question", "context_text"],
            "2.0",
        ),
        PromptTemplate::new(
            PERSONA_CONTEXT,
            "Sender profile",
            "This email is from {first_name} ({sender}). {email_count_text} {topics_text} {labels_text}",
            "Short profile of a sender built from their persona record",
            &["first_name", "sender", "email_count_text", "topics_text", "labels_text"],
            "1.0",
        ),
        PromptTemplate::new(
            FALLBACK_RESPONSE,
            "Offline answer",
            "I couldn't generate a full answer to your question: \"{question}\".\n\
             \n\
             {context_summary}",
            "Deterministic answer used when no generation provider responds",
            &["question", "context_summary"],
            "1.0",
        ),
        PromptTemplate::new(
            PERSONA_TRAITS,
            "Writing style summary",
            "Here are emails written by {persona_name}.\n\
             Summarize their writing style, tone, and recurring phrases in two or three sentences.\n\
             \n\
             Samples:\n\
             {sample_text}\n\
             \n\
             Style:",
            "Derive a short voice description from a sender's own emails",
            &["persona_name", "sample_text"],
            "1.0",
        ),
        PromptTemplate::new(
            PERSONA_FIRST_PERSON_RESPONSE,
            "First-person answer",
            "You are {persona_name}. Reply to the question below in your own voice, as if talking \
             with the person who asked.\n\
             \n\
             Your usual style: {persona_traits}\n\
             \n\
             Rules:\n\
             - Use only what you wrote in the emails below.\n\
             - Cite the email behind every claim as [Source N], using the numbers shown.\n\
             - If your emails do not cover it, say \"I don't have information about that in my emails\".\n\
             \n\
             Question: {question}\n\
             \n\
             Your emails:\n\
             {context_text}\n\
             \n\
             Your reply:",
            "Answer as the addressed sender, grounded in their emails",
            &["persona_name", "persona_traits", "question", "context_text"],
            "2.0",
        ),
        PromptTemplate::new(
            EMAIL_SUMMARY,
            "Email summary",
            "Summarize this email in a few sentences.\n\
             \n\
             From: {sender}\n\
             Subject: {subject}\n\
             Date: {date}\n\
             \n\
             {content}\n\
             \n\
             Summary:",
            "Concise summary of one email",
            &["sender", "subject", "date", "content"],
            "1.0",
        ),
        PromptTemplate::new(
            TOPIC_EXTRACTION,
            "Topic extraction",
            "List the main topics of this email as a comma-separated list.\n\
             Prefer these labels when they fit: AI, Tech, Business, Finance, Health, News, Education, Marketing.\n\
             \n\
             Subject: {subject}\n\
             {content}\n\
             \n\
             Topics:",
            "Comma-separated topics for one email",
            &["subject", "content"],
            "1.0",
        ),
        PromptTemplate::new(
            SENTIMENT_ANALYSIS,
            "Sentiment",
            "Classify the sentiment of this email as positive, neutral, or negative, then explain \
             in one sentence.\n\
             \n\
             Subject: {subject}\n\
             {content}\n\
             \n\
             Sentiment:",
            "Sentiment label plus a one-line explanation",
            &["subject", "content"],
            "1.0",
        ),
    ]
}

/// Builds every prompt text from the registry's templates.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    registry: PromptRegistry,
}

/// Templates the composer fills, with the variables it supplies.
const COMPOSER_CONTRACT: &[(&str, &[&str])] = &[
    (RAG_QUERY, &["question", "context_text"]),
    (RAG_QUERY_WITH_PERSONA, &["persona_context", "question", "context_text"]),
    (
        PERSONA_CONTEXT,
        &["first_name", "sender", "email_count_text", "topics_text", "labels_text"],
    ),
    (FALLBACK_RESPONSE, &["question", "context_summary"]),
    (PERSONA_TRAITS, &["persona_name", "sample_text"]),
    (
        PERSONA_FIRST_PERSON_RESPONSE,
        &["persona_name", "persona_traits", "question", "context_text"],
    ),
    (EMAIL_SUMMARY, &["sender", "subject", "date", "content"]),
    (TOPIC_EXTRACTION, &["subject", "content"]),
    (SENTIMENT_ANALYSIS, &["subject", "content"]),
];

impl PromptComposer {
    /// Wrap `registry`, failing if any template the composer fills is
    /// missing or declares different variables.
    pub fn new(registry: PromptRegistry) -> Result<Self> {
        for (name, vars) in COMPOSER_CONTRACT {
            registry.expect(name, vars)?;
        }
        Ok(Self { registry })
    }

    pub fn registry(&self) -> &PromptRegistry {
        &self.registry
    }

    fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        self.registry.get(name)?.render(vars)
    }

    /// Numbered source listing: a `Source i: Email from <sender> — <subject>`
    /// line followed by the document's content, for every document.
    pub fn context_text(docs: &[Document]) -> String {
        if docs.is_empty() {
            return "(no matching emails were found)".to_string();
        }
        docs.iter()
            .enumerate()
            .map(|(i, doc)| {
                format!(
                    "Source {}: Email from {} — {}\n{}",
                    i + 1,
                    doc.sender().unwrap_or("Unknown sender"),
                    doc.subject().unwrap_or("No subject"),
                    doc.content.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The grounded-answer prompt, with an optional sender profile block.
    pub fn build(
        &self,
        question: &str,
        docs: &[Document],
        persona_context: Option<&str>,
    ) -> Result<String> {
        let context_text = Self::context_text(docs);
        match persona_context {
            Some(persona) => self.render(
                RAG_QUERY_WITH_PERSONA,
                &[
                    ("persona_context", persona),
                    ("question", question),
                    ("context_text", &context_text),
                ],
            ),
            None => self.render(
                RAG_QUERY,
                &[("question", question), ("context_text", &context_text)],
            ),
        }
    }

    /// Profile text for a stored persona.
    pub fn persona_context(&self, persona: &Persona) -> Result<String> {
        let email_count_text = if persona.email_count > 1 {
            format!("They have sent {} emails before.", persona.email_count)
        } else {
            "This is their first email.".to_string()
        };
        let topics_text = if persona.topics.is_empty() {
            String::new()
        } else {
            format!(
                "They typically write about: {}.",
                persona.topics.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };
        let labels_text = if persona.labels.is_empty() {
            String::new()
        } else {
            format!(
                "Common labels: {}.",
                persona.labels.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };
        let rendered = self.render(
            PERSONA_CONTEXT,
            &[
                ("first_name", &persona.first_name),
                ("sender", &persona.sender),
                ("email_count_text", &email_count_text),
                ("topics_text", &topics_text),
                ("labels_text", &labels_text),
            ],
        )?;
        Ok(rendered.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    /// Style-summary prompt over at most three samples.
    pub fn persona_traits(&self, persona_name: &str, samples: &[Document]) -> Result<String> {
        let sample_text = samples
            .iter()
            .filter(|d| !d.content.trim().is_empty())
            .take(TRAIT_SAMPLE_LIMIT)
            .map(|d| d.content.trim())
            .collect::<Vec<_>>()
            .join("\n---\n");
        self.render(
            PERSONA_TRAITS,
            &[("persona_name", persona_name), ("sample_text", &sample_text)],
        )
    }

    /// First-person answer prompt for an addressed persona.
    pub fn first_person(
        &self,
        persona_name: &str,
        traits: &str,
        question: &str,
        docs: &[Document],
    ) -> Result<String> {
        let context_text = Self::context_text(docs);
        self.render(
            PERSONA_FIRST_PERSON_RESPONSE,
            &[
                ("persona_name", persona_name),
                ("persona_traits", traits),
                ("question", question),
                ("context_text", &context_text),
            ],
        )
    }

    /// Deterministic answer listing up to three retrieved sources.
    pub fn fallback_answer(&self, question: &str, docs: &[Document]) -> Result<String> {
        let context_summary = if docs.is_empty() {
            "No related emails were found. Try rephrasing the question.".to_string()
        } else {
            let lines: Vec<String> = docs
                .iter()
                .take(FALLBACK_SOURCE_LIMIT)
                .map(|d| {
                    format!(
                        "- Email from {}: {}",
                        d.sender().unwrap_or("Unknown sender"),
                        d.subject().unwrap_or("No subject")
                    )
                })
                .collect();
            format!("Related emails:\n{}", lines.join("\n"))
        };
        self.render(
            FALLBACK_RESPONSE,
            &[("question", question), ("context_summary", &context_summary)],
        )
    }

    pub fn email_summary(&self, doc: &Document) -> Result<String> {
        self.render(
            EMAIL_SUMMARY,
            &[
                ("sender", doc.sender().unwrap_or("Unknown sender")),
                ("subject", doc.subject().unwrap_or("No subject")),
                ("date", doc.date_str().unwrap_or("unknown")),
                ("content", &doc.content),
            ],
        )
    }

    pub fn topic_extraction(&self, doc: &Document) -> Result<String> {
        self.render(
            TOPIC_EXTRACTION,
            &[
                ("subject", doc.subject().unwrap_or("No subject")),
                ("content", &doc.content),
            ],
        )
    }

    pub fn sentiment_analysis(&self, doc: &Document) -> Result<String> {
        self.render(
            SENTIMENT_ANALYSIS,
            &[
                ("subject", doc.subject().unwrap_or("No subject")),
                ("content", &doc.content),
            ],
        )
    }
}
