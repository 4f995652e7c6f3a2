//! Provider factories.
//!
//! Each subsystem is selected by the plugin id in its config section.
//! Unknown ids fail eagerly, before any pipeline stage runs.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::completion::{CompletionProvider, OpenAiCompletion};
use crate::config::Config;
use crate::embedding::{EmbeddingProvider, OpenAiEmbedding};
use crate::extract::{MutoolExtractor, PdfExtractExtractor, TextExtractor};
use crate::source::{DocumentSource, RiverSource};
use crate::splitter::{SentenceSplitter, TextSplitter};
use crate::store::{Elasticsearch, VectorStore};

pub fn create_splitter(config: &Config) -> Result<Box<dyn TextSplitter>> {
    match config.splitter.plugin_id.as_str() {
        "sentence" => Ok(Box::new(SentenceSplitter::new(
            config.splitter.group_length,
            config.splitter.overlap,
        )?)),
        other => bail!("Unknown text splitter plugin: {}", other),
    }
}

pub fn create_embedding_provider(config: &Config) -> Result<Box<dyn EmbeddingProvider>> {
    match config.embedding.plugin_id.as_str() {
        "openai" => Ok(Box::new(OpenAiEmbedding::new(&config.embedding)?)),
        other => bail!("Unknown embedding plugin: {}", other),
    }
}

pub fn create_vector_store(config: &Config) -> Result<Box<dyn VectorStore>> {
    match config.vector_store.plugin_id.as_str() {
        "elasticsearch" => Ok(Box::new(Elasticsearch::new(&config.vector_store)?)),
        other => bail!("Unknown vector store plugin: {}", other),
    }
}

pub fn create_completion_provider(config: &Config) -> Result<Box<dyn CompletionProvider>> {
    match config.completion.plugin_id.as_str() {
        "openai" => Ok(Box::new(OpenAiCompletion::new(&config.completion)?)),
        other => bail!("Unknown completion plugin: {}", other),
    }
}

pub fn create_document_source(config: &Config) -> Result<Box<dyn DocumentSource>> {
    match config.source.plugin_id.as_str() {
        "river" => Ok(Box::new(RiverSource::new(&config.source)?)),
        other => bail!("Unknown document source plugin: {}", other),
    }
}

/// Build the extractor for each configured mimetype.
pub fn create_extractors(config: &Config) -> Result<BTreeMap<String, Box<dyn TextExtractor>>> {
    let mut extractors: BTreeMap<String, Box<dyn TextExtractor>> = BTreeMap::new();

    for (mimetype, plugin_id) in &config.extractor.plugins {
        let extractor: Box<dyn TextExtractor> = match plugin_id.as_str() {
            "mutool" => {
                let Some(mutool) = config.extractor.mutool.as_deref() else {
                    bail!("extractor.mutool path is required for the mutool plugin");
                };
                Box::new(MutoolExtractor::new(mutool)?)
            }
            "pdf-extract" => Box::new(PdfExtractExtractor),
            other => bail!("Unknown text extractor plugin: {}", other),
        };
        extractors.insert(mimetype.clone(), extractor);
    }

    Ok(extractors)
}
