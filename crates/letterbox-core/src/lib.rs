//! # Letterbox Core
//!
//! Runtime-agnostic retrieval-augmented generation logic for Letterbox:
//! data models, chunking, embedding and generation provider chains, the
//! vector index with its text-search fallback, prompt templates and
//! persona handling.
//!
//! This crate contains no HTTP client and no async runtime. Concrete
//! providers and stores live in the `letterbox` app crate and plug in
//! through the traits defined here.
//!
//! ```text
//! documents ─▶ chunk ─▶ EmbeddingChain ─▶ VectorIndex (flat | clustered)
//!                                              │
//! question ─▶ persona::detect ─▶ search ◀──────┘
//!                                   │
//!                                   ▼
//!                         PromptComposer ─▶ GenerationChain ─▶ answer
//! ```

pub mod analysis;
pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod models;
pub mod persona;
pub mod prompt;
pub mod search;
pub mod store;

pub use error::{RagError, Result};
