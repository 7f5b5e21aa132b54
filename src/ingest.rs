//! Document ingestion pipeline.
//!
//! Coordinates the write path: upsert document → chunk → embed → replace
//! chunk rows → swap index entries → persist index. Reingesting the same
//! source replaces its chunks and index entries wholesale, so ingestion is
//! idempotent and never leaves duplicates behind.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingProvider;
use crate::index::VectorIndex;
use crate::models::Chunk;

/// Summary of one ingestion run.
#[derive(Debug)]
pub struct IngestOutcome {
    pub document_id: String,
    pub chunks: usize,
}

/// Ingest plain text extracted from a document, replacing any previous
/// content for the same `source`.
pub async fn ingest_text(
    pool: &SqlitePool,
    index: &VectorIndex,
    embedder: &dyn EmbeddingProvider,
    source: &str,
    title: Option<&str>,
    text: &str,
    chunking: &ChunkingConfig,
) -> Result<IngestOutcome> {
    let document_id = upsert_document(pool, source, title).await?;

    let chunks = chunk_text(&document_id, text, chunking.max_chars, chunking.overlap_chars);
    if chunks.is_empty() {
        warn!(source, "no text to chunk; clearing previous content");
        replace_chunks(pool, &document_id, &[]).await?;
        index.replace_document(&document_id, Vec::new())?;
        index.save()?;
        return Ok(IngestOutcome {
            document_id,
            chunks: 0,
        });
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != chunks.len() {
        anyhow::bail!(
            "embedding provider returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        );
    }

    replace_chunks(pool, &document_id, &chunks).await?;

    let entries: Vec<(String, Vec<f32>)> = chunks
        .iter()
        .map(|c| c.id.clone())
        .zip(vectors.into_iter())
        .collect();
    index.replace_document(&document_id, entries)?;
    index.save()?;

    info!(
        source,
        document_id = %document_id,
        chunks = chunks.len(),
        "ingested document"
    );

    Ok(IngestOutcome {
        document_id,
        chunks: chunks.len(),
    })
}

/// Remove a document (by source) from the store and the index. Returns
/// false if no such document exists.
pub async fn remove_document(
    pool: &SqlitePool,
    index: &VectorIndex,
    source: &str,
) -> Result<bool> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE source = ?")
        .bind(source)
        .fetch_optional(pool)
        .await?;

    let Some(document_id) = existing else {
        return Ok(false);
    };

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(&document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(&document_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let removed = index.remove_document(&document_id);
    index.save()?;

    info!(source, entries = removed, "removed document");
    Ok(true)
}

async fn upsert_document(pool: &SqlitePool, source: &str, title: Option<&str>) -> Result<String> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE source = ?")
        .bind(source)
        .fetch_optional(pool)
        .await?;

    let document_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"
        INSERT INTO documents (id, source, title, ingested_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET
            title = excluded.title,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(&document_id)
    .bind(source)
    .bind(title)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(document_id)
}

async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, ordinal, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.ordinal)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
