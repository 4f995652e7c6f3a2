//! Document retrieval from the remote content API.
//!
//! A river URL (a shareable search/filter URL) is turned into an API
//! request by the search converter service, the request is adjusted
//! (limit, ordering, field selection) and posted to the API, and the
//! response is parsed into [`Document`]s grouped by API resource.
//! Results are cached in-process for a short lifetime so repeated
//! questions against the same river do not hammer the API.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::config::SourceConfig;
use crate::models::{
    stable_document_id, Content, ContentType, Document, DocumentDates, SourceOrganization,
};

/// Documents grouped by API resource, keyed by document id.
pub type DocumentMap = BTreeMap<String, BTreeMap<String, Document>>;

/// Retrieves source documents for a river URL.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Fetch up to `limit` documents for the river URL, grouped by
    /// resource. Fail-soft: problems are logged and yield an empty map.
    async fn get_documents(&self, url: &str, limit: usize) -> DocumentMap;

    /// Download a file attachment to a temporary file. `None` on failure.
    async fn download_file(&self, url: &str) -> Option<tempfile::NamedTempFile>;
}

/// Check that a river URL is plausible before contacting the converter.
pub fn validate_river_url(url: &str) -> bool {
    if url.trim().is_empty() {
        return false;
    }
    url.starts_with("https://") || url.starts_with("http://")
}

/// Cache key for one river query: hash of the normalized URL and limit.
pub fn cache_key(url: &str, limit: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim_end_matches('/').as_bytes());
    hasher.update(b"#");
    hasher.update(limit.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the API resource (last path segment) from an API request URL.
pub fn extract_resource(api_url: &str) -> Option<String> {
    let path = api_url.split('?').next()?;
    let resource = path.trim_end_matches('/').rsplit('/').next()?;
    if resource.is_empty() || resource.contains(':') {
        return None;
    }
    Some(resource.to_string())
}

/// Adjust the converter's payload before posting it to the API: cap the
/// result count, order newest first and restrict the fields to the ones
/// the pipeline consumes.
pub fn adjust_api_payload(mut payload: serde_json::Value, limit: usize) -> serde_json::Value {
    payload["limit"] = serde_json::json!(limit);
    payload["sort"] = serde_json::json!(["date.original:desc", "id:desc"]);
    payload["fields"]["include"] = serde_json::json!([
        "id",
        "url",
        "url_alias",
        "title",
        "body",
        "file.url",
        "file.mimetype",
        "source.name",
        "source.shortname",
        "date",
    ]);
    payload
}

/// Parse an API response into documents keyed by their stable id.
///
/// Each item contributes a markdown content (title + body) and one file
/// content per attachment. Document and file ids are UUID v3 of their
/// canonical URLs, so re-fetching yields identical ids.
pub fn parse_api_data(data: &serde_json::Value) -> BTreeMap<String, Document> {
    let mut documents = BTreeMap::new();

    for item in data
        .get("data")
        .and_then(|items| items.as_array())
        .into_iter()
        .flatten()
    {
        let fields = &item["fields"];
        let Some(url) = fields["url"].as_str() else {
            continue;
        };
        let id = stable_document_id(url);
        let title = fields["title"].as_str().unwrap_or_default().trim().to_string();
        let body = fields["body"].as_str().unwrap_or_default().trim().to_string();

        let source = fields["source"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|organization| SourceOrganization {
                name: organization["name"].as_str().unwrap_or_default().to_string(),
                shortname: organization["shortname"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect();

        let date = DocumentDates {
            original: fields.pointer("/date/original").and_then(|d| d.as_str()).map(String::from),
            changed: fields.pointer("/date/changed").and_then(|d| d.as_str()).map(String::from),
            created: fields.pointer("/date/created").and_then(|d| d.as_str()).map(String::from),
        };

        let mut contents = vec![Content {
            id: id.clone(),
            url: fields["url_alias"].as_str().unwrap_or(url).to_string(),
            content_type: ContentType::Markdown,
            text: Some(format!("# {title}\n\n{body}")),
            mimetype: None,
            pages: Vec::new(),
        }];

        for file in fields["file"].as_array().into_iter().flatten() {
            let Some(file_url) = file["url"].as_str() else {
                continue;
            };
            contents.push(Content {
                id: stable_document_id(file_url),
                url: file_url.to_string(),
                content_type: ContentType::File,
                text: None,
                mimetype: file["mimetype"].as_str().map(String::from),
                pages: Vec::new(),
            });
        }

        documents.insert(
            id.clone(),
            Document {
                id,
                title,
                url: url.to_string(),
                source,
                date,
                contents,
            },
        );
    }

    documents
}

struct CacheEntry {
    expires_at: Instant,
    documents: DocumentMap,
}

/// Document source backed by a river URL + search converter + content API.
pub struct RiverSource {
    plugin_id: String,
    api_url: String,
    converter_url: String,
    appname: String,
    cache_enabled: bool,
    cache_lifetime: Duration,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl RiverSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            plugin_id: config.plugin_id.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            converter_url: config.converter_url.trim_end_matches('/').to_string(),
            appname: config.appname.clone(),
            cache_enabled: config.cache_enabled,
            cache_lifetime: Duration::from_secs(config.cache_lifetime_secs),
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn get_cached(&self, key: &str) -> Option<DocumentMap> {
        if !self.cache_enabled {
            return None;
        }
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.documents.clone())
    }

    fn cache_documents(&self, key: &str, documents: DocumentMap) -> DocumentMap {
        if self.cache_enabled {
            if let Ok(mut cache) = self.cache.lock() {
                cache.insert(
                    key.to_string(),
                    CacheEntry {
                        expires_at: Instant::now() + self.cache_lifetime,
                        documents: documents.clone(),
                    },
                );
            }
        }
        documents
    }

    /// Ask the converter to translate the river URL into an API request
    /// (API URL + POST payload).
    async fn get_api_request(&self, url: &str) -> Result<(String, serde_json::Value)> {
        let response = self
            .client
            .get(&self.converter_url)
            .query(&[("appname", self.appname.as_str()), ("search-url", url)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Converter request failed with {status}"));
        }

        let json: serde_json::Value = response.json().await?;
        let request = json
            .pointer("/output/requests/post")
            .ok_or_else(|| anyhow!("Converter response has no POST request"))?;

        let api_url = request["url"]
            .as_str()
            .ok_or_else(|| anyhow!("Converter response has no API URL"))?
            .to_string();
        let payload = request.get("payload").cloned().unwrap_or_default();

        Ok((api_url, payload))
    }

    async fn get_api_data(
        &self,
        resource: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.api_url, resource.trim_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[("appname", self.appname.as_str())])
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("API request to {url} failed with {status}"));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl DocumentSource for RiverSource {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    async fn get_documents(&self, url: &str, limit: usize) -> DocumentMap {
        if !validate_river_url(url) {
            warn!(url, "invalid river URL");
            return DocumentMap::new();
        }

        let key = cache_key(url, limit);
        if let Some(documents) = self.get_cached(&key) {
            return documents;
        }

        let (api_url, payload) = match self.get_api_request(url).await {
            Ok(request) => request,
            Err(converter_error) => {
                error!(url, error = %converter_error, "unable to convert river URL to an API request");
                return self.cache_documents(&key, DocumentMap::new());
            }
        };

        let Some(resource) = extract_resource(&api_url) else {
            error!(api_url, "unable to extract the API resource from the request URL");
            return self.cache_documents(&key, DocumentMap::new());
        };

        let payload = adjust_api_payload(payload, limit);

        let data = match self.get_api_data(&resource, &payload).await {
            Ok(data) => data,
            Err(api_error) => {
                error!(resource, error = %api_error, "content API request failed");
                return self.cache_documents(&key, DocumentMap::new());
            }
        };

        let parsed = parse_api_data(&data);
        let mut documents = DocumentMap::new();
        if !parsed.is_empty() {
            documents.insert(resource, parsed);
        }

        self.cache_documents(&key, documents)
    }

    async fn download_file(&self, url: &str) -> Option<tempfile::NamedTempFile> {
        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(url, status = %response.status(), "file download failed");
                return None;
            }
            Err(download_error) => {
                warn!(url, error = %download_error, "file download failed");
                return None;
            }
        };

        let bytes = response.bytes().await.ok()?;
        let file = tempfile::NamedTempFile::new().ok()?;
        std::fs::write(file.path(), &bytes).ok()?;
        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_river_url() {
        assert!(validate_river_url("https://example.org/updates?search=floods"));
        assert!(validate_river_url("http://example.org/updates"));
        assert!(!validate_river_url(""));
        assert!(!validate_river_url("   "));
        assert!(!validate_river_url("ftp://example.org/updates"));
    }

    #[test]
    fn test_cache_key_normalizes_trailing_slash() {
        assert_eq!(
            cache_key("https://example.org/updates", 10),
            cache_key("https://example.org/updates/", 10)
        );
        assert_ne!(
            cache_key("https://example.org/updates", 10),
            cache_key("https://example.org/updates", 20)
        );
    }

    #[test]
    fn test_extract_resource() {
        assert_eq!(
            extract_resource("https://api.example.org/v1/reports?appname=x"),
            Some("reports".to_string())
        );
        assert_eq!(
            extract_resource("https://api.example.org/v1/reports/"),
            Some("reports".to_string())
        );
        assert_eq!(extract_resource("https://"), None);
    }

    #[test]
    fn test_adjust_api_payload() {
        let payload = serde_json::json!({
            "query": { "value": "floods" },
            "limit": 1000,
        });
        let adjusted = adjust_api_payload(payload, 10);
        assert_eq!(adjusted["limit"], 10);
        assert_eq!(adjusted["sort"][0], "date.original:desc");
        assert!(adjusted["fields"]["include"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("file.mimetype")));
        // The original query filter is preserved.
        assert_eq!(adjusted["query"]["value"], "floods");
    }

    fn api_data() -> serde_json::Value {
        serde_json::json!({
            "data": [
                {
                    "fields": {
                        "url": "https://example.org/node/1",
                        "url_alias": "https://example.org/report/floods-2026",
                        "title": "  Floods report  ",
                        "body": "Heavy rains caused flooding.",
                        "source": [{ "name": "Relief Org", "shortname": "RO" }],
                        "date": {
                            "original": "2026-08-01T00:00:00+00:00",
                            "changed": "2026-08-02T00:00:00+00:00",
                        },
                        "file": [
                            { "url": "https://example.org/files/report.pdf", "mimetype": "application/pdf" },
                        ],
                    },
                },
            ],
        })
    }

    #[test]
    fn test_parse_api_data() {
        let documents = parse_api_data(&api_data());
        assert_eq!(documents.len(), 1);

        let expected_id = stable_document_id("https://example.org/node/1");
        let document = documents.get(&expected_id).unwrap();
        assert_eq!(document.title, "Floods report");
        assert_eq!(document.date.changed.as_deref(), Some("2026-08-02T00:00:00+00:00"));
        assert_eq!(document.source[0].shortname, "RO");

        // Markdown body first, then one content per attachment.
        assert_eq!(document.contents.len(), 2);
        let markdown = &document.contents[0];
        assert_eq!(markdown.content_type, ContentType::Markdown);
        assert_eq!(markdown.url, "https://example.org/report/floods-2026");
        assert_eq!(
            markdown.text.as_deref(),
            Some("# Floods report\n\nHeavy rains caused flooding.")
        );

        let file = &document.contents[1];
        assert_eq!(file.content_type, ContentType::File);
        assert_eq!(file.mimetype.as_deref(), Some("application/pdf"));
        assert_eq!(file.id, stable_document_id("https://example.org/files/report.pdf"));
    }

    #[test]
    fn test_parse_api_data_stable_ids() {
        assert_eq!(
            parse_api_data(&api_data()).keys().collect::<Vec<_>>(),
            parse_api_data(&api_data()).keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_parse_api_data_empty() {
        assert!(parse_api_data(&serde_json::json!({})).is_empty());
        assert!(parse_api_data(&serde_json::json!({ "data": [] })).is_empty());
    }
}
