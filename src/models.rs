//! Core data models used throughout trisource.
//!
//! These types represent the documents, chunks, tabular schemas, and cached
//! answers that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Normalized document stored in SQLite. One per ingested source; chunks
/// are replaced wholesale when the same source is ingested again.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub title: Option<String>,
    pub ingested_at: i64,
}

/// A chunk of a document's body text, the unit of indexing.
///
/// Chunk ids are deterministic (`"{document_id}:{ordinal}"`) so reingesting
/// identical content produces identical index keys. Ordinals are contiguous
/// starting at 0 and follow original text order.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub hash: String,
}

/// Retrieval mode for one routed question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Document,
    Tabular,
    Web,
}

impl SourceMode {
    /// Stable tag used in cache fingerprints and log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            SourceMode::Document => "document",
            SourceMode::Tabular => "tabular",
            SourceMode::Web => "web",
        }
    }
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A cached answer payload.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub answer: String,
    pub citations: Vec<String>,
    /// Generated SQL, present for tabular answers.
    pub sql: Option<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

/// SQL column type inferred from worksheet cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

/// A column of an ingested table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

/// An ingested table: one per worksheet, grouped under a schema name.
///
/// `physical_name` is the actual SQLite table (`"{schema}__{table}"`) so
/// several schemas can share the single backing store.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    pub physical_name: String,
    pub columns: Vec<ColumnDef>,
    pub row_count: i64,
}

/// A named grouping of tables, the unit of NL-to-SQL translation scope.
#[derive(Debug, Clone)]
pub struct SchemaDef {
    pub name: String,
    pub tables: Vec<TableDef>,
}

/// Text passages plus source URLs returned by the web-fetch collaborator.
#[derive(Debug, Clone, Default)]
pub struct WebContent {
    pub passages: Vec<String>,
    pub sources: Vec<String>,
}
