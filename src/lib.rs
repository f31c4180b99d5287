//! # Letterbox
//!
//! Retrieval-augmented question answering over a mailbox of parsed emails.
//!
//! The algorithms (chunking, the vector index, persona profiles, prompt
//! composition and the provider fallback chains) live in
//! [`letterbox_core`]. This crate supplies the concrete pieces around them:
//! configuration, HTTP-backed embedding and generation providers, the
//! filesystem email loader, the JSON persona store, and the [`pipeline`]
//! that wires everything together behind the `lbx` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Email files  │──▶│   Pipeline   │──▶│ Vector index  │
//! │ JSON / .txt  │   │ chunk+embed  │   │ exact/cluster │
//! └──────────────┘   └──────┬───────┘   └───────┬───────┘
//!                           │                   │
//!                           ▼                   ▼
//!                    ┌──────────────┐   ┌───────────────┐
//!                    │   Personas   │   │  Generation   │
//!                    │ (JSON file)  │   │ chain + cache │
//!                    └──────────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`documents`] | Filesystem email loader |
//! | [`embedding`] | Remote and local embedding providers |
//! | [`generation`] | Remote text-generation providers |
//! | [`http`] | Shared JSON-over-HTTP client with retries |
//! | [`personas`] | JSON-file persona store |
//! | [`prompts`] | Prompt-template overrides |
//! | [`pipeline`] | The orchestrator |
//! | [`commands`] | `lbx` subcommands |
//! | [`logging`] | `tracing` subscriber setup |

pub mod commands;
pub mod config;
pub mod documents;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod logging;
pub mod personas;
pub mod pipeline;
pub mod prompts;
