//! Fetch a source document and split it into raw chunks.
//!
//! HTML is walked in document order: headings become heading chunks, list
//! items and paragraphs become text chunks, and table rows become table
//! chunks with cells joined by ` | `. Plain text and markdown are split by
//! line. PDFs and other binary formats are refused; they need an
//! OCR-capable extractor behind the same trait.

use std::sync::LazyLock;

use async_trait::async_trait;
use curricula_shared::{
    ChunkKind, CurriculaError, DocumentExtractor, ExtractedDocument, Result, SearchConfig,
    SourceChunk,
};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use url::Url;

use crate::{build_client, is_ssrf_target};

static BLOCK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6, li, p, tr").expect("valid selector")
});
static CELL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));

/// Confidence for chunks taken from explicit markup.
const MARKUP_CONFIDENCE: f64 = 0.95;
/// Confidence for table rows, whose cell boundaries may merge.
const TABLE_CONFIDENCE: f64 = 0.9;
/// Confidence for lines of unstructured text.
const TEXT_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Format {
    Html,
    Text,
    Unsupported,
}

pub struct HttpDocumentExtractor {
    client: Client,
    max_bytes: u64,
    /// Allow localhost URLs (tests only).
    allow_localhost: bool,
}

impl HttpDocumentExtractor {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            max_bytes: config.max_document_bytes,
            allow_localhost: false,
        })
    }

    /// Allow localhost URLs (for testing against a local server).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let parsed =
            Url::parse(url).map_err(|e| CurriculaError::validation(format!("{url}: {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&parsed) {
            return Err(CurriculaError::validation(format!(
                "{url}: refusing to fetch private or non-http address"
            )));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| CurriculaError::Network(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CurriculaError::Network(format!("{url}: HTTP {status}")));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(too_large(url, len, self.max_bytes));
            }
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_lowercase);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CurriculaError::Network(format!("{url}: {e}")))?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(too_large(url, bytes.len() as u64, self.max_bytes));
        }
        Ok((bytes.to_vec(), content_type))
    }
}

fn too_large(url: &str, len: u64, max: u64) -> CurriculaError {
    CurriculaError::validation(format!("{url}: document is {len} bytes, limit is {max}"))
}

#[async_trait]
impl DocumentExtractor for HttpDocumentExtractor {
    #[instrument(skip_all, fields(url = %url))]
    async fn extract(&self, url: &str) -> Result<ExtractedDocument> {
        let (bytes, content_type) = self.fetch(url).await?;
        let checksum = compute_hash(&bytes);

        let chunks = match detect_format(content_type.as_deref(), &bytes) {
            Format::Html => html_chunks(&String::from_utf8_lossy(&bytes), &checksum),
            Format::Text => text_chunks(&String::from_utf8_lossy(&bytes), &checksum),
            Format::Unsupported => {
                return Err(CurriculaError::parse(format!(
                    "{url}: {} needs an OCR-capable extractor",
                    content_type.as_deref().unwrap_or("binary document")
                )));
            }
        };

        info!(chunks = chunks.len(), bytes = bytes.len(), "document extracted");
        Ok(ExtractedDocument {
            url: url.to_string(),
            checksum,
            chunks,
        })
    }
}

/// Compute SHA-256 hash of content.
fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn detect_format(content_type: Option<&str>, bytes: &[u8]) -> Format {
    match content_type {
        Some(ct) if ct.contains("html") => Format::Html,
        Some(ct) if ct.starts_with("text/") => Format::Text,
        Some(ct) if ct.contains("markdown") => Format::Text,
        Some(ct) if !ct.contains("octet-stream") => Format::Unsupported,
        // No usable type: sniff.
        _ => {
            if bytes.starts_with(b"%PDF") || std::str::from_utf8(bytes).is_err() {
                Format::Unsupported
            } else {
                let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
                if head.contains("<html") || head.contains("<!doctype html") {
                    Format::Html
                } else {
                    Format::Text
                }
            }
        }
    }
}

/// Stable chunk id: checksum prefix plus position.
fn chunk_id(checksum: &str, index: usize) -> String {
    format!("{}-{index:04}", &checksum[..checksum.len().min(12)])
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn html_chunks(html: &str, checksum: &str) -> Vec<SourceChunk> {
    let document = Html::parse_document(html);
    let mut chunks = Vec::new();

    for el in document.select(&BLOCK_SELECTOR) {
        let name = el.value().name();
        let (text, kind, confidence) = match name {
            "tr" => {
                let cells: Vec<String> = el
                    .select(&CELL_SELECTOR)
                    .map(|c| element_text(&c))
                    .filter(|t| !t.is_empty())
                    .collect();
                (cells.join(" | "), ChunkKind::Table, TABLE_CONFIDENCE)
            }
            "li" | "p" => {
                // Rows already carry their cells' text.
                if el.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|e| e.name() == "tr")
                }) {
                    continue;
                }
                (element_text(&el), ChunkKind::Text, MARKUP_CONFIDENCE)
            }
            _ => (element_text(&el), ChunkKind::Heading, MARKUP_CONFIDENCE),
        };
        if text.is_empty() {
            continue;
        }
        chunks.push(SourceChunk {
            id: chunk_id(checksum, chunks.len()),
            text,
            kind,
            page: None,
            confidence,
        });
    }
    chunks
}

fn text_chunks(text: &str, checksum: &str) -> Vec<SourceChunk> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| SourceChunk {
            id: chunk_id(checksum, i),
            text: line.to_string(),
            kind: ChunkKind::Text,
            page: None,
            confidence: TEXT_CONFIDENCE,
        })
        .collect()
}
