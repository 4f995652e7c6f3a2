//! Text splitting into embeddable passages.
//!
//! The sentence splitter works paragraph by paragraph: paragraphs are
//! separated by blank-line runs, sentences by terminal punctuation, and
//! chunks are groups of `group_length` sentences with the previous
//! `overlap` sentences prepended for context. Overlap never crosses a
//! paragraph boundary.

use anyhow::Result;
use regex::Regex;

/// Strategy for splitting a text into passages.
pub trait TextSplitter: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Split a text into chunks. Deterministic: the same input always
    /// yields the same chunks, in order.
    fn split_text(&self, text: &str) -> Vec<String>;
}

/// Splits text into groups of sentences.
pub struct SentenceSplitter {
    group_length: usize,
    overlap: usize,
    paragraph_re: Regex,
    sentence_re: Regex,
    whitespace_re: Regex,
}

impl SentenceSplitter {
    pub fn new(group_length: usize, overlap: usize) -> Result<Self> {
        Ok(Self {
            group_length: group_length.max(1),
            overlap,
            paragraph_re: Regex::new(r"\n{2,}")?,
            sentence_re: Regex::new(r"[;.!?。؟]+\s+")?,
            whitespace_re: Regex::new(r"\s+")?,
        })
    }

    /// Split a paragraph into sentences, keeping the terminal punctuation
    /// with each sentence.
    fn split_sentences(&self, paragraph: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for m in self.sentence_re.find_iter(paragraph) {
            let piece = paragraph[start..m.end()].trim();
            if !piece.is_empty() {
                sentences.push(piece.to_string());
            }
            start = m.end();
        }
        let tail = paragraph[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }
        sentences
    }
}

impl TextSplitter for SentenceSplitter {
    fn plugin_id(&self) -> &str {
        "sentence"
    }

    fn split_text(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();

        for paragraph in self.paragraph_re.split(text) {
            let paragraph = self.whitespace_re.replace_all(paragraph, " ");
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            let sentences = self.split_sentences(paragraph);
            if sentences.is_empty() {
                continue;
            }

            // Chunk i covers sentences [max(0, i*L - overlap), i*L + L).
            let length = self.group_length;
            let count = sentences.len().div_ceil(length);
            for i in 0..count {
                let base = i * length;
                let start = if i == 0 { 0 } else { base.saturating_sub(self.overlap) };
                let end = (base + length).min(sentences.len());
                chunks.push(sentences[start..end].join(" "));
            }
        }

        chunks
    }
}

/// Flattens markdown structure so the body text splits cleanly: ATX
/// headings become plain paragraph text and heading underlines, rulers
/// and code fences are dropped.
pub struct MarkdownNormalizer {
    heading_re: Regex,
    ruler_re: Regex,
}

impl MarkdownNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            heading_re: Regex::new(r"(?m)^#{1,6}\s*([^#\n]+)$")?,
            ruler_re: Regex::new(r"(?m)^[=*`-]{2,}\s*$")?,
        })
    }

    pub fn normalize(&self, text: &str) -> String {
        let text = self.heading_re.replace_all(text, "$1\n\n");
        let text = self.ruler_re.replace_all(&text, "\n");
        text.trim().to_string()
    }
}
