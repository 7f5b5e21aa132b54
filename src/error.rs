//! Typed errors for the retrieval core.
//!
//! Each retrieval mode fails with its own error kind so callers can tell
//! "could not understand the question" ([`TranslationError`]) apart from
//! "understood it but the query failed" ([`ExecutionError`]), and a broken
//! index instance ([`IndexError`]) apart from an ordinary empty result.
//! A cache miss is not an error anywhere in this crate; lookups return
//! `Option`.

use std::path::PathBuf;
use thiserror::Error;

/// The persisted vector index is unusable. Fatal to that index instance;
/// the only recovery is a rebuild from the source documents.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index file at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("embedding dimension mismatch: index holds {expected}-dim vectors, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The question could not be grounded to the tables available in the
/// target schema. Reported to callers as "cannot answer from available
/// tables"; the generated query (if any) is never executed.
#[derive(Debug, Error)]
#[error("cannot answer from available tables: {reason}")]
pub struct TranslationError {
    pub reason: String,
}

impl TranslationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A grounded query failed at runtime. Carries the offending SQL so the
/// failure can be diagnosed.
#[derive(Debug, Error)]
#[error("query execution failed: {reason} (query: {query})")]
pub struct ExecutionError {
    pub query: String,
    pub reason: String,
}

/// Umbrella error for a single routed question. One mode's failure is
/// isolated to its own `ask` call and never poisons the router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// No retrieval candidates were found. Propagated instead of calling
    /// the answer generator with empty context.
    #[error("no retrieval candidates found for this question")]
    RetrievalEmpty,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}
