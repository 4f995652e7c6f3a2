//! The question-answering pipeline.
//!
//! `answer()` walks a fixed sequence of stages — fetch documents, embed
//! and index them, embed the question, retrieve relevant passages,
//! generate the answer — and produces an [`AnswerRecord`] for every
//! invocation. When a stage cannot proceed the record carries a
//! user-facing fallback message instead of an answer, and the stage
//! timings gathered so far are kept.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::completion::CompletionProvider;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::extract::TextExtractor;
use crate::models::{AnswerRecord, AnswerStatus, Document, Page, Passage};
use crate::registry;
use crate::source::DocumentSource;
use crate::splitter::{MarkdownNormalizer, TextSplitter};
use crate::store::{build_index_name, VectorStore};
use crate::vector::cosine_similarity;

pub const NO_DOCUMENTS_MESSAGE: &str =
    "Sorry, no source documents were found from the source URL.";
pub const INDEX_ERROR_MESSAGE: &str =
    "Sorry, there was an error trying to retrieve the documents to answer your question.";
pub const QUESTION_EMBEDDING_ERROR_MESSAGE: &str =
    "Sorry, there was an error trying to process the question.";
pub const NO_PASSAGES_MESSAGE: &str =
    "Sorry, no documents were found containing the answer to your question.";
pub const ANSWER_ERROR_MESSAGE: &str = "Sorry, I was unable to answer your question.";

const STAT_GET_SOURCE_DOCUMENTS: &str = "Get source documents";
const STAT_EMBED_DOCUMENTS: &str = "Embed documents";
const STAT_GET_QUESTION_EMBEDDING: &str = "Get question embedding";
const STAT_GET_RELEVANT_PASSAGES: &str = "Get relevant passages";
const STAT_GET_ANSWER: &str = "Get answer";

/// Result of embedding and indexing one batch of documents.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
}

impl EmbedOutcome {
    fn merge(&mut self, other: EmbedOutcome) {
        self.indexed += other.indexed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.warnings.extend(other.warnings);
    }
}

/// The assembled pipeline. Providers are trait objects so tests can
/// substitute in-memory fakes.
pub struct Pipeline {
    source: Box<dyn DocumentSource>,
    splitter: Box<dyn TextSplitter>,
    embedding: Box<dyn EmbeddingProvider>,
    store: Box<dyn VectorStore>,
    completion: Box<dyn CompletionProvider>,
    extractors: BTreeMap<String, Box<dyn TextExtractor>>,
    normalizer: MarkdownNormalizer,
    rerank: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn DocumentSource>,
        splitter: Box<dyn TextSplitter>,
        embedding: Box<dyn EmbeddingProvider>,
        store: Box<dyn VectorStore>,
        completion: Box<dyn CompletionProvider>,
        extractors: BTreeMap<String, Box<dyn TextExtractor>>,
        rerank: bool,
    ) -> Result<Self> {
        Ok(Self {
            source,
            splitter,
            embedding,
            store,
            completion,
            extractors,
            normalizer: MarkdownNormalizer::new()?,
            rerank,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            registry::create_document_source(config)?,
            registry::create_splitter(config)?,
            registry::create_embedding_provider(config)?,
            registry::create_vector_store(config)?,
            registry::create_completion_provider(config)?,
            registry::create_extractors(config)?,
            config.pipeline.rerank,
        )
    }

    /// Answer a question against the documents of a river URL.
    ///
    /// Always returns a complete record: on failure the answer field
    /// holds a user-facing message and the status is `error`.
    pub async fn answer(
        &self,
        question: &str,
        source_url: &str,
        limit: usize,
        uid: &str,
    ) -> AnswerRecord {
        let started = Instant::now();
        let mut record = AnswerRecord {
            question: question.to_string(),
            source_url: source_url.to_string(),
            source_limit: limit,
            answer: String::new(),
            passages: Vec::new(),
            status: AnswerStatus::Error,
            timestamp: Utc::now(),
            duration: 0.0,
            uid: uid.to_string(),
            completion_plugin_id: self.completion.plugin_id().to_string(),
            embedding_plugin_id: self.embedding.plugin_id().to_string(),
            stats: [
                STAT_GET_SOURCE_DOCUMENTS,
                STAT_EMBED_DOCUMENTS,
                STAT_GET_QUESTION_EMBEDDING,
                STAT_GET_RELEVANT_PASSAGES,
                STAT_GET_ANSWER,
            ]
            .into_iter()
            .map(|stat| (stat.to_string(), 0.0))
            .collect(),
            warnings: Vec::new(),
        };

        let mut stage = Instant::now();

        let mut document_map = self.source.get_documents(source_url, limit).await;
        record
            .stats
            .insert(STAT_GET_SOURCE_DOCUMENTS.to_string(), take_elapsed(&mut stage));

        // Answering works against a single index, so only the first
        // resource is considered.
        let Some((resource, documents)) = document_map.pop_first() else {
            record.answer = NO_DOCUMENTS_MESSAGE.to_string();
            return finish(record, started);
        };
        if documents.is_empty() {
            record.answer = NO_DOCUMENTS_MESSAGE.to_string();
            return finish(record, started);
        }

        let index = build_index_name(
            self.embedding.plugin_id(),
            self.source.plugin_id(),
            &resource,
        );

        let embed_result = self.embed_documents(&index, &documents).await;
        record
            .stats
            .insert(STAT_EMBED_DOCUMENTS.to_string(), take_elapsed(&mut stage));
        match embed_result {
            Ok(outcome) => record.warnings.extend(outcome.warnings),
            Err(embed_error) => {
                warn!(index, error = %embed_error, "unable to embed the source documents");
                record.answer = INDEX_ERROR_MESSAGE.to_string();
                return finish(record, started);
            }
        }

        let question_embedding = self.embedding.embed_one(question).await;
        record.stats.insert(
            STAT_GET_QUESTION_EMBEDDING.to_string(),
            take_elapsed(&mut stage),
        );
        if question_embedding.is_empty() {
            record.answer = QUESTION_EMBEDDING_ERROR_MESSAGE.to_string();
            return finish(record, started);
        }

        let ids: Vec<String> = documents.keys().cloned().collect();
        let passages = self
            .store
            .get_relevant_passages(&index, &ids, question, &question_embedding)
            .await;
        record.stats.insert(
            STAT_GET_RELEVANT_PASSAGES.to_string(),
            take_elapsed(&mut stage),
        );
        if passages.is_empty() {
            record.answer = NO_PASSAGES_MESSAGE.to_string();
            return finish(record, started);
        }
        record.passages = passages;

        let context = self.completion.generate_context(question, &record.passages);
        let answer = self.completion.answer(question, &context).await;
        record
            .stats
            .insert(STAT_GET_ANSWER.to_string(), take_elapsed(&mut stage));
        if answer.is_empty() {
            record.answer = ANSWER_ERROR_MESSAGE.to_string();
            return finish(record, started);
        }

        record.answer = answer;
        record.status = AnswerStatus::Success;

        if self.rerank {
            self.rerank_passages(&mut record).await;
        }

        finish(record, started)
    }

    /// Re-score the retrieved passages by their similarity with the
    /// generated answer. Skipped silently when the answer cannot be
    /// embedded.
    async fn rerank_passages(&self, record: &mut AnswerRecord) {
        let answer_embedding = self.embedding.embed_one(&record.answer).await;
        if answer_embedding.is_empty() {
            return;
        }

        for passage in &mut record.passages {
            let similarity =
                cosine_similarity(&passage.embedding, &answer_embedding) as f64 + 1.0;
            passage.score *= similarity;
        }
        record
            .passages
            .sort_by(|a, b| b.score.total_cmp(&a.score));
    }

    /// Fetch documents for a river URL and embed/index every resource,
    /// without asking a question.
    pub async fn ingest(&self, source_url: &str, limit: usize) -> Result<EmbedOutcome> {
        let document_map = self.source.get_documents(source_url, limit).await;
        if document_map.is_empty() {
            bail!("no source documents were found from the source URL");
        }

        let mut report = EmbedOutcome::default();
        for (resource, documents) in &document_map {
            let index = build_index_name(
                self.embedding.plugin_id(),
                self.source.plugin_id(),
                resource,
            );
            report.merge(self.embed_documents(&index, documents).await?);
        }
        Ok(report)
    }

    /// Process and index the documents that are new or have changed
    /// since they were last indexed.
    ///
    /// Documents that fail processing are skipped and reported in the
    /// outcome's warnings; the whole stage only fails when every
    /// new-or-updated document failed, or when the store rejects the
    /// write.
    async fn embed_documents(
        &self,
        index: &str,
        documents: &BTreeMap<String, Document>,
    ) -> Result<EmbedOutcome> {
        let mut outcome = EmbedOutcome::default();
        if documents.is_empty() {
            return Ok(outcome);
        }

        let ids: Vec<String> = documents.keys().cloned().collect();
        let existing = self
            .store
            .get_documents(index, &ids, &["id", "date.changed"])
            .await;

        let mut to_index: BTreeMap<String, Document> = BTreeMap::new();
        let mut attempted = 0usize;

        for (id, document) in documents {
            if let Some(current) = existing.get(id) {
                let unchanged = current.pointer("/date/changed").and_then(|date| date.as_str())
                    == document.date.changed.as_deref();
                if unchanged {
                    outcome.skipped += 1;
                    continue;
                }
            }

            attempted += 1;
            match self.process_document(document, &mut outcome.warnings).await {
                Ok(processed) => {
                    to_index.insert(id.clone(), processed);
                }
                Err(process_error) => {
                    warn!(url = %document.url, error = %process_error, "unable to process document");
                    outcome.failed += 1;
                    outcome
                        .warnings
                        .push(format!("Skipped document {}: {process_error}", document.url));
                }
            }
        }

        if attempted > 0 && to_index.is_empty() {
            bail!("all {attempted} new or updated documents failed processing");
        }

        outcome.indexed = to_index.len();
        if !to_index.is_empty()
            && !self
                .store
                .index_documents(index, &mut to_index, self.embedding.dimensions())
                .await
        {
            bail!("unable to index documents into {index}");
        }

        Ok(outcome)
    }

    /// Extract, split and embed all of a document's contents.
    async fn process_document(
        &self,
        document: &Document,
        warnings: &mut Vec<String>,
    ) -> Result<Document> {
        let mut document = document.clone();

        for content in &mut document.contents {
            match content.content_type {
                crate::models::ContentType::Markdown => {
                    let text = content.text.clone().unwrap_or_default();
                    let normalized = self.normalizer.normalize(&text);
                    content.pages = vec![self.process_page(&normalized, 0).await];
                }
                crate::models::ContentType::File => {
                    content.pages = self
                        .process_file(&content.url, content.mimetype.as_deref(), warnings)
                        .await;
                }
            }
        }

        let passage_count: usize = document
            .contents
            .iter()
            .flat_map(|content| &content.pages)
            .map(|page| page.passages.len())
            .sum();
        if passage_count == 0 {
            bail!("no embeddable passages");
        }

        Ok(document)
    }

    /// Download a file attachment and turn each of its pages into
    /// embedded passages. Fail-soft: problems yield no pages plus a
    /// warning.
    async fn process_file(
        &self,
        url: &str,
        mimetype: Option<&str>,
        warnings: &mut Vec<String>,
    ) -> Vec<Page> {
        let Some(mimetype) = mimetype else {
            warnings.push(format!("Skipped attachment {url}: unknown mimetype"));
            return Vec::new();
        };
        let Some(extractor) = self.extractors.get(mimetype) else {
            warnings.push(format!(
                "Skipped attachment {url}: unsupported mimetype {mimetype}"
            ));
            return Vec::new();
        };

        let mut step = Instant::now();
        let Some(file) = self.source.download_file(url).await else {
            warnings.push(format!("Skipped attachment {url}: download failed"));
            return Vec::new();
        };
        let download_secs = take_elapsed(&mut step);

        let page_texts = extractor.get_page_texts(file.path());
        let extraction_secs = take_elapsed(&mut step);
        if page_texts.is_empty() {
            warnings.push(format!("Skipped attachment {url}: no text extracted"));
            return Vec::new();
        }

        let mut pages = Vec::with_capacity(page_texts.len());
        for (index, text) in page_texts.iter().enumerate() {
            pages.push(self.process_page(text, index as u32 + 1).await);
        }
        let processing_secs = take_elapsed(&mut step);

        debug!(
            url,
            download_secs, extraction_secs, processing_secs, "processed attachment"
        );
        pages
    }

    /// Split one page of text and embed its chunks. Chunks whose
    /// embedding failed are dropped.
    async fn process_page(&self, text: &str, page: u32) -> Page {
        let texts = self.splitter.split_text(text.trim());
        let embeddings = self.embedding.embed_many(&texts).await;

        let passages = texts
            .into_iter()
            .zip(embeddings)
            .filter(|(_, embedding)| !embedding.is_empty())
            .map(|(text, embedding)| Passage { text, embedding })
            .collect();

        Page { page, passages }
    }
}

fn take_elapsed(stage: &mut Instant) -> f64 {
    let elapsed = stage.elapsed().as_secs_f64();
    *stage = Instant::now();
    elapsed
}

fn finish(mut record: AnswerRecord, started: Instant) -> AnswerRecord {
    record.duration = started.elapsed().as_secs_f64();
    record
}
