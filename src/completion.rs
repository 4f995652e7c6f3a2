//! Answer generation from a question and retrieved passages.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::CompletionConfig;
use crate::models::RelevantPassage;

/// Instruction prepended to the retrieved passages so the model stays
/// grounded in them.
pub const GROUNDING_INSTRUCTION: &str = "You are a helpful assistant. \
Answer the user's question concisely and exactly, using only the following \
information. Reference the given sources at the end of the answer. Say you \
don't know if you cannot answer.";

/// Generates an answer to a question from a prompt context.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Assemble the prompt context: the grounding instruction followed by
    /// the passage texts in their given order, joined by blank lines.
    /// Reproducible for identical inputs.
    fn generate_context(&self, _question: &str, passages: &[RelevantPassage]) -> String {
        let mut parts = Vec::with_capacity(passages.len() + 1);
        parts.push(GROUNDING_INSTRUCTION);
        for passage in passages {
            parts.push(passage.text.as_str());
        }
        parts.join("\n\n")
    }

    /// Generate an answer. Empty string when the question or context is
    /// empty (no request is made) and on request failure.
    async fn answer(&self, question: &str, context: &str) -> String;
}

/// Completion provider for OpenAI-compatible chat endpoints.
///
/// If `OPENAI_API_KEY` is set in the environment it is sent as a bearer
/// token.
pub struct OpenAiCompletion {
    plugin_id: String,
    endpoint: String,
    model: String,
    max_tokens: usize,
    client: reqwest::Client,
}

impl OpenAiCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            plugin_id: config.plugin_id.clone(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client,
        })
    }

    async fn request_answer(&self, question: &str, context: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": context },
                { "role": "user", "content": question },
            ],
            "temperature": 0,
            "max_tokens": self.max_tokens,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Completion request failed with {status}: {body}"));
        }

        let json: serde_json::Value = response.json().await?;
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|content| content.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletion {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    async fn answer(&self, question: &str, context: &str) -> String {
        if question.trim().is_empty() || context.trim().is_empty() {
            return String::new();
        }

        match self.request_answer(question, context).await {
            Ok(answer) => answer,
            Err(error) => {
                warn!(%error, "completion request failed");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PassageSource;

    struct ContextOnly;

    #[async_trait]
    impl CompletionProvider for ContextOnly {
        fn plugin_id(&self) -> &str {
            "test"
        }
        async fn answer(&self, _question: &str, _context: &str) -> String {
            String::new()
        }
    }

    fn passage(text: &str) -> RelevantPassage {
        RelevantPassage {
            text: text.to_string(),
            score: 1.0,
            source: PassageSource {
                id: "doc".to_string(),
                title: "Report".to_string(),
                url: "https://example.org".to_string(),
                page: None,
            },
            embedding: Vec::new(),
        }
    }

    #[test]
    fn test_generate_context_order_and_separator() {
        let provider = ContextOnly;
        let passages = vec![passage("First passage."), passage("Second passage.")];
        let context = provider.generate_context("ignored", &passages);

        let expected = format!(
            "{GROUNDING_INSTRUCTION}\n\nFirst passage.\n\nSecond passage."
        );
        assert_eq!(context, expected);
        // Reproducible.
        assert_eq!(context, provider.generate_context("ignored", &passages));
    }

    #[test]
    fn test_generate_context_no_passages() {
        let provider = ContextOnly;
        assert_eq!(provider.generate_context("q", &[]), GROUNDING_INSTRUCTION);
    }

    #[tokio::test]
    async fn test_empty_question_or_context_short_circuits() {
        let config = CompletionConfig {
            plugin_id: "openai".to_string(),
            // Unroutable; must not be contacted.
            endpoint: "http://192.0.2.1/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            timeout_secs: 1,
        };
        let provider = OpenAiCompletion::new(&config).unwrap();
        assert_eq!(provider.answer("", "context").await, "");
        assert_eq!(provider.answer("question", "  ").await, "");
    }
}
