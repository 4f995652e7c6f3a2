//! Core data models used throughout docchat.
//!
//! These types represent the documents, passages, and answer records that
//! flow through the retrieval and answering pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A source document with its indexable contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable id derived from the document's canonical URL.
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub source: Vec<SourceOrganization>,
    #[serde(default)]
    pub date: DocumentDates,
    #[serde(default)]
    pub contents: Vec<Content>,
}

/// Organization a document is attributed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOrganization {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub shortname: String,
}

/// Document dates, kept as the API's own date strings so change
/// detection stays a plain equality check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentDates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// Kind of a document content entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Markdown,
    File,
}

/// One piece of a document: either its markdown body or a file attachment.
///
/// `text` is only set for markdown contents, `mimetype` only for files.
/// `pages` is filled during processing (extraction, splitting, embedding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub pages: Vec<Page>,
}

/// A page of extracted text with its embedded passages.
///
/// `page` is 1-based for file contents and 0 when pagination does not
/// apply (markdown bodies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub passages: Vec<Passage>,
}

/// A chunk of text with its embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A passage retrieved by similarity search, with provenance.
///
/// The embedding is only needed in memory for reranking and is never
/// serialized into logs or CLI output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevantPassage {
    pub text: String,
    pub score: f64,
    pub source: PassageSource,
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,
}

/// Where a relevant passage came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageSource {
    pub id: String,
    pub title: String,
    pub url: String,
    /// 1-based page number, only set for file contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// Outcome status of an answer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStatus {
    Success,
    Error,
}

impl AnswerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerStatus::Success => "success",
            AnswerStatus::Error => "error",
        }
    }
}

/// The full record of one answer request, persisted to the answer log.
///
/// Produced for every invocation, including failed ones: on failure
/// `answer` holds the user-facing fallback message and `status` is
/// [`AnswerStatus::Error`].
#[derive(Debug, Clone, Serialize)]
pub struct AnswerRecord {
    pub question: String,
    pub source_url: String,
    pub source_limit: usize,
    pub answer: String,
    pub passages: Vec<RelevantPassage>,
    pub status: AnswerStatus,
    pub timestamp: DateTime<Utc>,
    /// Total wall-clock duration of the request in seconds.
    pub duration: f64,
    pub uid: String,
    pub completion_plugin_id: String,
    pub embedding_plugin_id: String,
    /// Wall-clock seconds per pipeline stage, keyed by stage name.
    pub stats: BTreeMap<String, f64>,
    /// Non-fatal problems encountered along the way (skipped documents,
    /// unsupported attachments).
    pub warnings: Vec<String>,
}

/// Derive a stable document id from a canonical URL (UUID v3 under the
/// URL namespace), so re-fetching the same document always yields the
/// same id.
pub fn stable_document_id(url: &str) -> String {
    Uuid::new_v3(&Uuid::NAMESPACE_URL, url.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_document_id_is_deterministic() {
        let a = stable_document_id("https://example.org/report/1");
        let b = stable_document_id("https://example.org/report/1");
        let c = stable_document_id("https://example.org/report/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_relevant_passage_serialization_strips_embedding() {
        let passage = RelevantPassage {
            text: "Some text".to_string(),
            score: 1.5,
            source: PassageSource {
                id: "doc-1".to_string(),
                title: "Report".to_string(),
                url: "https://example.org/report/1".to_string(),
                page: Some(3),
            },
            embedding: vec![0.1, 0.2],
        };
        let json = serde_json::to_value(&passage).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["source"]["page"], 3);
    }

    #[test]
    fn test_content_type_rename() {
        let content = Content {
            id: "c1".to_string(),
            url: "https://example.org/file.pdf".to_string(),
            content_type: ContentType::File,
            text: None,
            mimetype: Some("application/pdf".to_string()),
            pages: Vec::new(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "file");
        assert!(json.get("text").is_none());
        assert!(json.get("mimetype").is_some());
    }
}
