//! Text extraction from downloaded file attachments.
//!
//! Extraction is fail-soft: an unreadable or corrupt file yields no pages
//! rather than an error, so a single bad attachment never sinks a whole
//! document.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Result};
use regex::Regex;
use tracing::warn;

/// Extracts page-oriented text from a local file.
pub trait TextExtractor: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Extract the text of each page, in page order (index 0 = page 1).
    /// Returns an empty vector when the file cannot be read.
    fn get_page_texts(&self, path: &Path) -> Vec<String>;

    /// Number of pages in the file. Falls back to 1 when it cannot be
    /// determined.
    fn get_page_count(&self, path: &Path) -> usize;
}

/// PDF extractor shelling out to MuPDF's `mutool`, one page at a time,
/// so passages can be attributed to the page they came from.
#[derive(Debug)]
pub struct MutoolExtractor {
    mutool: PathBuf,
    pages_re: Regex,
}

impl MutoolExtractor {
    pub fn new(mutool: &Path) -> Result<Self> {
        if !mutool.is_file() {
            bail!("mutool executable not found: {}", mutool.display());
        }
        Ok(Self {
            mutool: mutool.to_path_buf(),
            pages_re: Regex::new(r"Pages: (\d+)")?,
        })
    }

    fn get_page_range_text(&self, path: &Path, range: &str) -> Option<String> {
        let output = tempfile::NamedTempFile::new().ok()?;

        let status = Command::new(&self.mutool)
            .arg("convert")
            .args(["-F", "text"])
            .args([
                "-O",
                "preserve-ligatures,preserve-whitespace,dehyphenate,mediabox-clip=yes",
            ])
            .arg("-o")
            .arg(output.path())
            .arg(path)
            .arg(range)
            .status()
            .ok()?;

        if !status.success() {
            warn!(path = %path.display(), range, "mutool convert failed");
            return None;
        }

        std::fs::read_to_string(output.path()).ok()
    }
}

impl TextExtractor for MutoolExtractor {
    fn plugin_id(&self) -> &str {
        "mutool"
    }

    fn get_page_texts(&self, path: &Path) -> Vec<String> {
        let page_count = self.get_page_count(path);

        let mut texts = Vec::with_capacity(page_count);
        for page in 1..=page_count {
            let range = format!("{page}-{page}");
            texts.push(self.get_page_range_text(path, &range).unwrap_or_default());
        }

        // A file where no page produced text is treated as unreadable.
        if texts.iter().all(|text| text.trim().is_empty()) {
            return Vec::new();
        }
        texts
    }

    fn get_page_count(&self, path: &Path) -> usize {
        let output = Command::new(&self.mutool)
            .args(["info", "-M"])
            .arg(path)
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                self.pages_re
                    .captures(&stdout)
                    .and_then(|captures| captures[1].parse().ok())
                    .unwrap_or(1)
            }
            _ => 1,
        }
    }
}

/// In-process PDF extractor. Has no notion of pages, so the whole
/// document comes back as a single page and passages lose per-page
/// attribution.
pub struct PdfExtractExtractor;

impl TextExtractor for PdfExtractExtractor {
    fn plugin_id(&self) -> &str {
        "pdf-extract"
    }

    fn get_page_texts(&self, path: &Path) -> Vec<String> {
        match pdf_extract::extract_text(path) {
            Ok(text) if !text.trim().is_empty() => vec![text],
            Ok(_) => Vec::new(),
            Err(error) => {
                warn!(path = %path.display(), %error, "PDF text extraction failed");
                Vec::new()
            }
        }
    }

    fn get_page_count(&self, _path: &Path) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutool_missing_executable_is_an_error() {
        let err = MutoolExtractor::new(Path::new("/nonexistent/mutool")).unwrap_err();
        assert!(err.to_string().contains("mutool"));
    }

    #[test]
    fn test_pdf_extract_unreadable_file_yields_no_pages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(b"not a pdf").unwrap();

        let extractor = PdfExtractExtractor;
        assert!(extractor.get_page_texts(file.path()).is_empty());
        assert_eq!(extractor.get_page_count(file.path()), 1);
    }
}
