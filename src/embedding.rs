//! Embedding provider abstraction and the OpenAI-compatible implementation.
//!
//! Failures at the provider boundary are not errors: a failed request
//! yields empty vectors so callers can drop the affected passages and
//! keep going. Batching keeps each request under both the configured
//! batch size and the model's token budget (minus a safety margin).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;

/// Safety margin subtracted from the model's token budget, since the
/// token estimate is approximate.
const TOKEN_MARGIN: usize = 30;

/// Generates embedding vectors for texts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Width of the vectors this provider produces.
    fn dimensions(&self) -> usize;

    /// Embed a single text. Empty vector on failure or empty input.
    async fn embed_one(&self, text: &str) -> Vec<f32>;

    /// Embed many texts, batched. The result always has the same length
    /// and order as the input; texts whose batch failed get an empty
    /// vector.
    async fn embed_many(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

/// Estimate the number of model tokens in a text.
///
/// Counts words (runs of Unicode letters, digits and apostrophes) and
/// scales by 0.75, floored.
pub fn estimate_tokens(word_re: &Regex, text: &str) -> usize {
    let word_count = word_re.find_iter(text).count();
    (word_count as f64 * 0.75).floor() as usize
}

/// Plan request batches over per-text token estimates.
///
/// Texts are accumulated in input order while the batch stays below
/// `batch_size` texts and below the token budget (`max_tokens` minus the
/// safety margin). Every input index appears in exactly one batch, and
/// batches preserve input order.
pub fn plan_batches(token_counts: &[usize], batch_size: usize, max_tokens: usize) -> Vec<Vec<usize>> {
    let budget = max_tokens.saturating_sub(TOKEN_MARGIN);
    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for (index, &tokens) in token_counts.iter().enumerate() {
        if !current.is_empty()
            && (current.len() >= batch_size || current_tokens + tokens >= budget)
        {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(index);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Parse an OpenAI-style embeddings response, returning the vectors in
/// response order.
pub fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|data| data.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|embedding| embedding.as_array())
            .ok_or_else(|| anyhow!("Invalid embedding response: missing embedding"))?;
        let vector: Vec<f32> = embedding
            .iter()
            .map(|value| value.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vector);
    }
    Ok(embeddings)
}

/// Embedding provider for OpenAI-compatible `/embeddings` endpoints.
///
/// If `OPENAI_API_KEY` is set in the environment it is sent as a bearer
/// token; endpoints that do their own authentication (gateways, local
/// servers) work without it.
pub struct OpenAiEmbedding {
    plugin_id: String,
    endpoint: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
    max_tokens: usize,
    client: reqwest::Client,
    word_re: Regex,
}

impl OpenAiEmbedding {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            plugin_id: config.plugin_id.clone(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size,
            max_tokens: config.max_tokens,
            client,
            word_re: Regex::new(r"[\p{L}\p{N}']+")?,
        })
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::json!({
            "input": texts,
            "model": self.model,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Embedding request failed with {status}: {body}"));
        }

        let json: serde_json::Value = response.json().await?;
        parse_embedding_response(&json)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_one(&self, text: &str) -> Vec<f32> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        match self.request_embeddings(&[text.to_string()]).await {
            Ok(mut embeddings) if !embeddings.is_empty() => embeddings.swap_remove(0),
            Ok(_) => Vec::new(),
            Err(error) => {
                warn!(%error, "embedding request failed");
                Vec::new()
            }
        }
    }

    async fn embed_many(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let token_counts: Vec<usize> = texts
            .iter()
            .map(|text| estimate_tokens(&self.word_re, text))
            .collect();
        let batches = plan_batches(&token_counts, self.batch_size, self.max_tokens);

        let mut embeddings = vec![Vec::new(); texts.len()];
        for batch in batches {
            let batch_texts: Vec<String> =
                batch.iter().map(|&index| texts[index].clone()).collect();
            match self.request_embeddings(&batch_texts).await {
                Ok(vectors) => {
                    for (&index, vector) in batch.iter().zip(vectors.into_iter()) {
                        embeddings[index] = vector;
                    }
                }
                Err(error) => {
                    // Leave empty vectors in place so positions still line up.
                    warn!(%error, batch_len = batch.len(), "embedding batch failed");
                }
            }
        }
        embeddings
    }
}
