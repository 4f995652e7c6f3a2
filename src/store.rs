//! Vector store abstraction and the Elasticsearch implementation.
//!
//! Documents are indexed whole under a nested `contents` → `pages` →
//! `passages` mapping; similarity search runs server-side with a
//! script-score query over the passage embeddings. Store failures are
//! fail-soft: callers get `false` or an empty result, never an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::VectorStoreConfig;
use crate::models::{Document, RelevantPassage};

/// Persistent vector index over processed documents.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Create the index if it does not exist. Idempotent.
    async fn create_index(&self, index: &str, dimensions: usize) -> bool;

    async fn index_exists(&self, index: &str) -> bool;

    async fn delete_index(&self, index: &str) -> bool;

    /// Fetch selected fields of the given documents, keyed by document id.
    /// Used for change detection before re-indexing.
    async fn get_documents(
        &self,
        index: &str,
        ids: &[String],
        fields: &[&str],
    ) -> BTreeMap<String, serde_json::Value>;

    /// Upsert a single document, replacing any previous version.
    async fn index_document(&self, index: &str, document: &Document, dimensions: usize) -> bool;

    /// Bulk upsert documents. Creates the index on demand and submits the
    /// documents in indexing-batch-size chunks, draining the map as
    /// chunks are sent.
    async fn index_documents(
        &self,
        index: &str,
        documents: &mut BTreeMap<String, Document>,
        dimensions: usize,
    ) -> bool;

    /// Retrieve the passages most similar to the query embedding, scoped
    /// to the given document ids. Sorted by score descending, deduplicated
    /// by text, at most `topk` results.
    async fn get_relevant_passages(
        &self,
        index: &str,
        ids: &[String],
        query_text: &str,
        query_embedding: &[f32],
    ) -> Vec<RelevantPassage>;
}

/// Compose the index name for one embedding model, source and resource.
///
/// Vectors from different embedding models cannot be compared, so the
/// embedding plugin id is part of the name and keeps them apart.
pub fn build_index_name(embedding_plugin_id: &str, source_plugin_id: &str, resource: &str) -> String {
    format!("{embedding_plugin_id}__{source_plugin_id}__{resource}")
}

/// Build the index settings and nested mapping for the given vector width.
///
/// Passage text and embeddings are stored but not indexed: scoring runs
/// through the script-score query, not through an inverted index.
pub fn build_index_mapping(dimensions: usize) -> serde_json::Value {
    serde_json::json!({
        "settings": {
            "index.mapping.nested_objects.limit": 100000,
            "number_of_shards": 1,
            "number_of_replicas": 1,
        },
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "title": { "type": "text" },
                "url": { "type": "keyword" },
                "source": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "text" },
                        "shortname": { "type": "text" },
                    },
                },
                "date": {
                    "type": "object",
                    "properties": {
                        "original": { "type": "date" },
                        "changed": { "type": "date" },
                        "created": { "type": "date" },
                    },
                },
                "contents": {
                    "type": "nested",
                    "properties": {
                        "type": { "type": "text", "index": false },
                        "url": { "type": "text", "index": false },
                        "pages": {
                            "type": "nested",
                            "properties": {
                                "page": { "type": "integer", "index": false },
                                "passages": {
                                    "type": "nested",
                                    "properties": {
                                        "text": { "type": "text", "index": false },
                                        "embedding": {
                                            "type": "dense_vector",
                                            "dims": dimensions,
                                            "index": false,
                                        },
                                    },
                                },
                            },
                        },
                    },
                },
            },
        },
    })
}

/// Build the id-scoped similarity search query.
///
/// Candidates are limited to the given document ids, scored server-side
/// with `cosineSimilarity + 1.0` (so scores stay positive), and each hit
/// carries up to `topk` best passages as inner hits. Inner hits include
/// the passage embeddings so answers can be reranked client-side.
pub fn build_search_query(ids: &[String], query_embedding: &[f32], topk: usize) -> serde_json::Value {
    serde_json::json!({
        "_source": [
            "id",
            "url",
            "title",
            "source",
            "date",
            "contents.url",
            "contents.type",
        ],
        "size": topk * ids.len(),
        "query": {
            "bool": {
                "filter": {
                    "ids": { "values": ids },
                },
                "must": {
                    "nested": {
                        "path": "contents.pages.passages",
                        "query": {
                            "script_score": {
                                "query": { "match_all": {} },
                                "script": {
                                    "source": "cosineSimilarity(params.queryVector, \"contents.pages.passages.embedding\") + 1.0",
                                    "params": { "queryVector": query_embedding },
                                },
                            },
                        },
                        "inner_hits": {
                            "_source": [
                                "contents.pages.passages.text",
                                "contents.pages.passages.embedding",
                            ],
                            "size": topk,
                        },
                    },
                },
            },
        },
    })
}

/// Serialize documents into an NDJSON `_bulk` payload.
pub fn build_bulk_payload(documents: &[&Document]) -> String {
    let mut lines = Vec::with_capacity(documents.len() * 2);
    for document in documents {
        lines.push(serde_json::json!({ "index": { "_id": document.id } }).to_string());
        lines.push(serde_json::to_string(document).unwrap_or_else(|_| "{}".to_string()));
    }
    let mut payload = lines.join("\n");
    payload.push('\n');
    payload
}

/// Parse a search response into relevant passages.
///
/// Passages are deduplicated by lowercased text keeping the best score,
/// sorted by score descending, and truncated to `topk`. A page number is
/// attributed only to passages from file contents, where the nested page
/// offset is meaningful.
pub fn parse_search_response(json: &serde_json::Value, topk: usize) -> Vec<RelevantPassage> {
    let hits = json
        .pointer("/hits/hits")
        .and_then(|hits| hits.as_array())
        .cloned()
        .unwrap_or_default();

    let mut unique: BTreeMap<String, RelevantPassage> = BTreeMap::new();

    for hit in &hits {
        let source = &hit["_source"];
        let id = source["id"].as_str().unwrap_or_default().to_string();
        let title = source["title"].as_str().unwrap_or_default().to_string();
        let contents = source["contents"].as_array().cloned().unwrap_or_default();

        let inner_hits = hit
            .pointer("/inner_hits/contents.pages.passages/hits/hits")
            .and_then(|inner| inner.as_array())
            .cloned()
            .unwrap_or_default();

        for inner_hit in &inner_hits {
            let content_offset = inner_hit
                .pointer("/_nested/offset")
                .and_then(|offset| offset.as_u64())
                .unwrap_or(0) as usize;
            let Some(content) = contents.get(content_offset) else {
                continue;
            };

            let text = inner_hit
                .pointer("/_source/text")
                .and_then(|text| text.as_str())
                .unwrap_or_default()
                .to_string();
            if text.is_empty() {
                continue;
            }

            let score = inner_hit["_score"].as_f64().unwrap_or(0.0);

            let embedding: Vec<f32> = inner_hit
                .pointer("/_source/embedding")
                .and_then(|embedding| embedding.as_array())
                .map(|values| {
                    values
                        .iter()
                        .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                })
                .unwrap_or_default();

            // The page offset is only meaningful for paginated (file)
            // contents.
            let page = if content["type"].as_str() == Some("file") {
                inner_hit
                    .pointer("/_nested/_nested/offset")
                    .and_then(|offset| offset.as_u64())
                    .map(|offset| offset as u32 + 1)
            } else {
                None
            };

            let passage = RelevantPassage {
                text: text.clone(),
                score,
                source: crate::models::PassageSource {
                    id: id.clone(),
                    title: title.clone(),
                    url: content["url"].as_str().unwrap_or_default().to_string(),
                    page,
                },
                embedding,
            };

            // Keep the best-scoring instance of duplicated text.
            let key = text.to_lowercase();
            match unique.get(&key) {
                Some(existing) if existing.score >= score => {}
                _ => {
                    unique.insert(key, passage);
                }
            }
        }
    }

    let mut passages: Vec<RelevantPassage> = unique.into_values().collect();
    passages.sort_by(|a, b| b.score.total_cmp(&a.score));
    passages.truncate(topk);
    passages
}

enum Payload<'a> {
    Empty,
    Json(&'a serde_json::Value),
    Ndjson(String),
}

/// Elasticsearch-backed vector store.
pub struct Elasticsearch {
    url: String,
    indexing_batch_size: usize,
    topk: usize,
    client: reqwest::Client,
}

impl Elasticsearch {
    pub fn new(config: &VectorStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            indexing_batch_size: config.indexing_batch_size,
            topk: config.topk,
            client,
        })
    }

    /// Perform a request against the cluster. Returns the response body,
    /// or `None` on transport errors and non-success statuses. Statuses
    /// in `valid_status_codes` (e.g. 404 on an existence check) are not
    /// logged as errors.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload<'_>,
        valid_status_codes: &[u16],
    ) -> Option<String> {
        let url = format!("{}/{}", self.url, endpoint.trim_start_matches('/'));

        let mut request = self.client.request(method.clone(), &url);
        match payload {
            Payload::Empty => {}
            Payload::Json(json) => request = request.json(json),
            Payload::Ndjson(body) => {
                request = request
                    .header("Content-Type", "application/x-ndjson")
                    .body(body);
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(transport_error) => {
                warn!(%method, endpoint, error = %transport_error, "vector store request failed");
                return None;
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            if !valid_status_codes.contains(&status) {
                error!(%method, endpoint, status, %body, "vector store request returned an error");
            }
            return None;
        }

        Some(body)
    }

    async fn request_json(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload<'_>,
    ) -> Option<serde_json::Value> {
        let body = self.request(method, endpoint, payload, &[]).await?;
        match serde_json::from_str(&body) {
            Ok(json) => Some(json),
            Err(decode_error) => {
                error!(endpoint, error = %decode_error, "unable to decode vector store response");
                None
            }
        }
    }
}

#[async_trait]
impl VectorStore for Elasticsearch {
    fn plugin_id(&self) -> &str {
        "elasticsearch"
    }

    async fn create_index(&self, index: &str, dimensions: usize) -> bool {
        if self.index_exists(index).await {
            return true;
        }

        let mapping = build_index_mapping(dimensions);
        let created = self
            .request(Method::PUT, index, Payload::Json(&mapping), &[])
            .await
            .is_some();
        if !created {
            error!(index, "unable to create vector store index");
        }
        created
    }

    async fn index_exists(&self, index: &str) -> bool {
        self.request(Method::HEAD, index, Payload::Empty, &[404])
            .await
            .is_some()
    }

    async fn delete_index(&self, index: &str) -> bool {
        if !self.index_exists(index).await {
            return true;
        }
        self.request(Method::DELETE, index, Payload::Empty, &[])
            .await
            .is_some()
    }

    async fn get_documents(
        &self,
        index: &str,
        ids: &[String],
        fields: &[&str],
    ) -> BTreeMap<String, serde_json::Value> {
        if ids.is_empty() || !self.index_exists(index).await {
            return BTreeMap::new();
        }

        let query = serde_json::json!({
            "query": {
                "ids": { "values": ids },
            },
            "size": ids.len(),
            "_source": fields,
        });

        let endpoint = format!("{index}/_search");
        let Some(json) = self
            .request_json(Method::POST, &endpoint, Payload::Json(&query))
            .await
        else {
            return BTreeMap::new();
        };

        let mut documents = BTreeMap::new();
        for hit in json
            .pointer("/hits/hits")
            .and_then(|hits| hits.as_array())
            .into_iter()
            .flatten()
        {
            if let Some(id) = hit.pointer("/_source/id").and_then(|id| id.as_str()) {
                documents.insert(id.to_string(), hit["_source"].clone());
            }
        }
        documents
    }

    async fn index_document(&self, index: &str, document: &Document, dimensions: usize) -> bool {
        if !self.create_index(index, dimensions).await {
            return false;
        }

        let payload = serde_json::json!({
            "doc": document,
            "doc_as_upsert": true,
        });

        let endpoint = format!("{index}/_update/{}?refresh=true", document.id);
        let indexed = self
            .request(Method::POST, &endpoint, Payload::Json(&payload), &[])
            .await
            .is_some();
        if !indexed {
            error!(index, id = %document.id, url = %document.url, "unable to index document");
        }
        indexed
    }

    async fn index_documents(
        &self,
        index: &str,
        documents: &mut BTreeMap<String, Document>,
        dimensions: usize,
    ) -> bool {
        if documents.is_empty() {
            return true;
        }

        if !self.create_index(index, dimensions).await {
            return false;
        }

        let endpoint = format!("{index}/_bulk?refresh=true");
        while !documents.is_empty() {
            // Drain up to one batch, freeing the processed documents as
            // we go.
            let batch_ids: Vec<String> = documents
                .keys()
                .take(self.indexing_batch_size)
                .cloned()
                .collect();
            let batch: Vec<Document> = batch_ids
                .iter()
                .filter_map(|id| documents.remove(id))
                .collect();
            let payload = build_bulk_payload(&batch.iter().collect::<Vec<_>>());

            if self
                .request(Method::POST, &endpoint, Payload::Ndjson(payload), &[])
                .await
                .is_none()
            {
                return false;
            }
        }

        true
    }

    async fn get_relevant_passages(
        &self,
        index: &str,
        ids: &[String],
        _query_text: &str,
        query_embedding: &[f32],
    ) -> Vec<RelevantPassage> {
        if ids.is_empty() || !self.index_exists(index).await {
            return Vec::new();
        }

        let query = build_search_query(ids, query_embedding, self.topk);
        let endpoint = format!("{index}/_search");
        let Some(json) = self
            .request_json(Method::POST, &endpoint, Payload::Json(&query))
            .await
        else {
            return Vec::new();
        };

        parse_search_response(&json, self.topk)
    }
}
