//! Chat completion provider and answer prompts.
//!
//! One [`ChatProvider`] serves both jobs that need a language model: SQL
//! generation in the tabular path and answer generation in all three
//! paths. Answer generation is treated as a pure function of its inputs,
//! which is what makes cached answers valid.
//!
//! The HTTP implementation speaks the OpenAI-compatible
//! `/chat/completions` shape with a configurable base URL, so hosted
//! Groq-style endpoints work unchanged. Retry strategy matches the
//! embedding provider: 429/5xx and network errors back off and retry,
//! other 4xx fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;
    /// Complete a single-user-message prompt and return the reply text.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// A no-op chat provider that always returns errors.
pub struct DisabledChatProvider;

#[async_trait]
impl ChatProvider for DisabledChatProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("LLM provider is disabled. Set [llm] provider in config.")
    }
}

/// Chat provider for OpenAI-compatible APIs.
pub struct OpenAiChatProvider {
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiChatProvider {
    /// Create a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config or the API key
    /// environment variable is missing.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Chat API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Chat completion failed after retries")))
    }
}

/// Extract `choices[0].message.content` from a chat completions response.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing message content"))
}

/// Create the appropriate [`ChatProvider`] based on configuration.
pub fn create_chat_provider(config: &LlmConfig) -> Result<Arc<dyn ChatProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatProvider)),
        "openai" => Ok(Arc::new(OpenAiChatProvider::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ Answer prompts ============

/// Prompt for answering from retrieved document chunks.
pub fn document_prompt(question: &str, context: &str) -> String {
    format!(
        "You are an AI assistant specialized in answering questions from structured and \
         unstructured documents, including research papers, safety data sheets, and documents \
         containing tables or lists.\n\n\
         Follow these rules:\n\
         - If the answer is explicitly found in the provided documents, provide it with relevant context.\n\
         - If the answer is in tabular format, summarize key values and structure them in a readable way.\n\
         - If there are multiple conflicting sources, mention them with reasoning.\n\
         - If the answer is not found, say: 'The answer is not present in the given documents.'\n\
         - Do not generate answers beyond the given data.\n\n\
         Context:\n{context}\n\n\
         User Query: {question}\n\n\
         Answer:"
    )
}

/// Prompt for answering from web search content.
pub fn web_prompt(question: &str, content: &str) -> String {
    format!(
        "You are an AI assistant tasked with answering questions based on web search results.\n\n\
         Follow these rules:\n\
         - Summarize the relevant information from the provided web content.\n\
         - If the answer is not found, say: 'I couldn't find a definitive answer based on available web information.'\n\
         - Provide a concise and accurate response based only on the given web content.\n\
         - Do not make up information beyond what is provided.\n\n\
         Web Content:\n{content}\n\n\
         User Query: {question}\n\n\
         Answer:"
    )
}

/// Prompt for turning executed SQL results into a natural-language answer.
pub fn tabular_prompt(question: &str, sql: &str, rows_json: &str, total_rows: usize) -> String {
    if total_rows == 0 {
        format!(
            "You are a helpful AI assistant with SQL expertise.\n\n\
             User's question: {question}\n\n\
             I converted this to SQL: {sql}\n\n\
             The query executed successfully but returned no results.\n\n\
             Please explain this in a natural way to the user."
        )
    } else {
        format!(
            "You are a helpful AI assistant with SQL expertise.\n\n\
             User's question: {question}\n\n\
             I converted this to SQL: {sql}\n\n\
             The query returned {total_rows} results. Here are the first few:\n{rows_json}\n\n\
             Please answer the user's original question in a natural way based on these results. \
             Include key insights, numbers, and trends if applicable. \
             If there are more than 5 results, mention the total count. \
             Ensure your response is helpful and directly addresses the user's question."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "  hello there  " } }]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "hello there");
    }

    #[test]
    fn test_parse_chat_response_malformed() {
        let json = serde_json::json!({ "choices": [] });
        assert!(parse_chat_response(&json).is_err());
    }

    #[test]
    fn test_tabular_prompt_empty_results_variant() {
        let p = tabular_prompt("how many?", "SELECT 1", "[]", 0);
        assert!(p.contains("returned no results"));
    }
}
