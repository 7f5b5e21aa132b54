//! Retrieval routing across the three source modes.
//!
//! One handler per mode, selected by an explicit request or inferred from
//! the request shape. A dispatch table, not a workflow graph, since only
//! three terminal paths exist:
//!
//! - **DOCUMENT**: cache → embed query → vector search → lexical rerank →
//!   top-k context → generate.
//! - **TABULAR**: cache → NL-to-SQL against the schema registry → execute →
//!   row context → generate.
//! - **WEB**: cache → web fetch → passage context → generate.
//!
//! All three converge on an assembled context handed to the chat
//! collaborator, and every path consults and populates the response cache
//! under a fingerprint of (question, mode, sources consulted). The router
//! owns nothing global: index, cache, pool, and providers are injected at
//! construction, so independent instances are cheap (one per test, or one
//! per tenant).

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{fingerprint, ResponseCache};
use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::RouterError;
use crate::index::VectorIndex;
use crate::llm::{self, ChatProvider};
use crate::models::{CacheRecord, SourceMode};
use crate::rerank::{self, Candidate};
use crate::tabular;
use crate::web::WebFetcher;

/// How a question was asked: an explicit mode, or hints for inference.
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub mode: Option<SourceMode>,
    /// Target schema for tabular questions.
    pub schema: Option<String>,
    /// Route to web search when no mode is given.
    pub web: bool,
}

/// Retrieval tuning parameters.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// Vector candidates fetched before reranking.
    pub candidate_k: usize,
    /// Chunks kept after reranking.
    pub final_k: usize,
}

/// A routed, answered question.
#[derive(Debug, Clone)]
pub struct RouterResponse {
    pub answer: String,
    pub citations: Vec<String>,
    /// Generated SQL, present for tabular answers.
    pub sql: Option<String>,
    pub mode: SourceMode,
    /// True when the answer came from the response cache.
    pub cached: bool,
}

impl RouterResponse {
    fn from_record(record: CacheRecord, mode: SourceMode, cached: bool) -> Self {
        Self {
            answer: record.answer,
            citations: record.citations,
            sql: record.sql,
            mode,
            cached,
        }
    }
}

/// Pick the retrieval mode: explicit wins, then a schema name implies
/// TABULAR, a web flag implies WEB, else DOCUMENT.
pub fn infer_mode(options: &AskOptions) -> SourceMode {
    if let Some(mode) = options.mode {
        return mode;
    }
    if options.schema.is_some() {
        return SourceMode::Tabular;
    }
    if options.web {
        return SourceMode::Web;
    }
    SourceMode::Document
}

/// Coordinator over the three retrieval paths.
pub struct RetrievalRouter {
    pool: SqlitePool,
    index: Arc<VectorIndex>,
    cache: Arc<ResponseCache>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    web: Arc<dyn WebFetcher>,
    params: RetrievalParams,
}

impl RetrievalRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        index: Arc<VectorIndex>,
        cache: Arc<ResponseCache>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        web: Arc<dyn WebFetcher>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            pool,
            index,
            cache,
            embedder,
            chat,
            web,
            params,
        }
    }

    /// Answer a question via the selected (or inferred) retrieval path.
    pub async fn ask(
        &self,
        question: &str,
        options: &AskOptions,
    ) -> Result<RouterResponse, RouterError> {
        let mode = infer_mode(options);
        info!(mode = %mode, "routing question");

        match mode {
            SourceMode::Document => self.ask_document(question).await,
            SourceMode::Tabular => {
                let schema = options.schema.as_deref().ok_or_else(|| {
                    crate::error::TranslationError::new("no schema selected for tabular question")
                })?;
                self.ask_tabular(question, schema).await
            }
            SourceMode::Web => self.ask_web(question).await,
        }
    }

    async fn ask_document(&self, question: &str) -> Result<RouterResponse, RouterError> {
        let source_ids = self.index.document_ids();
        let fp = fingerprint(question, SourceMode::Document, &source_ids);

        if let Some(record) = self.cache.get(&fp) {
            debug!("document answer served from cache");
            return Ok(RouterResponse::from_record(record, SourceMode::Document, true));
        }

        let query_vec = embed_one(self.embedder.as_ref(), question)
            .await
            .map_err(RouterError::Collaborator)?;

        let hits = self.index.search(&query_vec, self.params.candidate_k);
        if hits.is_empty() {
            return Err(RouterError::RetrievalEmpty);
        }

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in &hits {
            let row = sqlx::query("SELECT document_id, ordinal, text FROM chunks WHERE id = ?")
                .bind(&hit.chunk_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                candidates.push(Candidate {
                    chunk_id: hit.chunk_id.clone(),
                    document_id: row.get("document_id"),
                    ordinal: row.get("ordinal"),
                    text: row.get("text"),
                    vector_score: hit.score,
                });
            }
        }
        if candidates.is_empty() {
            return Err(RouterError::RetrievalEmpty);
        }

        let mut ranked = rerank::rerank(question, candidates);
        ranked.truncate(self.params.final_k);

        let citations = self.document_citations(&ranked).await?;
        let context = ranked
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");

        let prompt = llm::document_prompt(question, &context);
        let answer = self
            .chat
            .complete(&prompt)
            .await
            .map_err(RouterError::Collaborator)?;

        let record = CacheRecord {
            answer,
            citations,
            sql: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.cache.put(&fp, record.clone());

        Ok(RouterResponse::from_record(record, SourceMode::Document, false))
    }

    async fn ask_tabular(
        &self,
        question: &str,
        schema_name: &str,
    ) -> Result<RouterResponse, RouterError> {
        let schema = tabular::load_schema(&self.pool, schema_name)
            .await?
            .ok_or_else(|| {
                crate::error::TranslationError::new(format!("unknown schema '{}'", schema_name))
            })?;

        let fp = fingerprint(
            question,
            SourceMode::Tabular,
            &[schema_name.to_string()],
        );
        if let Some(record) = self.cache.get(&fp) {
            debug!("tabular answer served from cache");
            return Ok(RouterResponse::from_record(record, SourceMode::Tabular, true));
        }

        let result =
            tabular::translate_and_execute(&self.pool, self.chat.as_ref(), &schema, question)
                .await?;

        let shown: Vec<&serde_json::Value> = result.rows.iter().take(5).collect();
        let rows_json = serde_json::to_string_pretty(&shown)
            .map_err(|e| RouterError::Collaborator(e.into()))?;

        let prompt = llm::tabular_prompt(question, &result.sql, &rows_json, result.row_count);
        let answer = self
            .chat
            .complete(&prompt)
            .await
            .map_err(RouterError::Collaborator)?;

        let record = CacheRecord {
            answer,
            citations: vec![format!("schema {}: {}", schema_name, result.sql)],
            sql: Some(result.sql),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.cache.put(&fp, record.clone());

        Ok(RouterResponse::from_record(record, SourceMode::Tabular, false))
    }

    async fn ask_web(&self, question: &str) -> Result<RouterResponse, RouterError> {
        let fp = fingerprint(question, SourceMode::Web, &["web".to_string()]);
        if let Some(record) = self.cache.get(&fp) {
            debug!("web answer served from cache");
            return Ok(RouterResponse::from_record(record, SourceMode::Web, true));
        }

        let content = self
            .web
            .fetch(question)
            .await
            .map_err(RouterError::Collaborator)?;
        if content.passages.is_empty() {
            return Err(RouterError::RetrievalEmpty);
        }

        let combined = content.passages.join("\n");
        let prompt = llm::web_prompt(question, &combined);
        let answer = self
            .chat
            .complete(&prompt)
            .await
            .map_err(RouterError::Collaborator)?;

        let record = CacheRecord {
            answer,
            citations: content.sources,
            sql: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.cache.put(&fp, record.clone());

        Ok(RouterResponse::from_record(record, SourceMode::Web, false))
    }

    /// Build `"{source} (chunk {ordinal})"` citations, memoizing the
    /// per-document source lookup.
    async fn document_citations(
        &self,
        ranked: &[Candidate],
    ) -> Result<Vec<String>, RouterError> {
        let mut sources: HashMap<String, String> = HashMap::new();
        let mut citations = Vec::with_capacity(ranked.len());

        for candidate in ranked {
            if !sources.contains_key(&candidate.document_id) {
                let source: Option<String> =
                    sqlx::query_scalar("SELECT source FROM documents WHERE id = ?")
                        .bind(&candidate.document_id)
                        .fetch_optional(&self.pool)
                        .await?;
                sources.insert(
                    candidate.document_id.clone(),
                    source.unwrap_or_else(|| candidate.document_id.clone()),
                );
            }
            let source = &sources[&candidate.document_id];
            citations.push(format!("{} (chunk {})", source, candidate.ordinal));
        }

        Ok(citations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_mode_wins() {
        let options = AskOptions {
            mode: Some(SourceMode::Web),
            schema: Some("sales".to_string()),
            web: false,
        };
        assert_eq!(infer_mode(&options), SourceMode::Web);
    }

    #[test]
    fn test_schema_implies_tabular() {
        let options = AskOptions {
            mode: None,
            schema: Some("sales".to_string()),
            web: false,
        };
        assert_eq!(infer_mode(&options), SourceMode::Tabular);
    }

    #[test]
    fn test_web_flag_implies_web() {
        let options = AskOptions {
            mode: None,
            schema: None,
            web: true,
        };
        assert_eq!(infer_mode(&options), SourceMode::Web);
    }

    #[test]
    fn test_default_is_document() {
        assert_eq!(infer_mode(&AskOptions::default()), SourceMode::Document);
    }
}
