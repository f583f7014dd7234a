use crate::assembly::ChunkSpan;
use crate::chunking::TextWindow;
use crate::error::{ConfigError, ExtractError};
use crate::models::{DocumentKind, DocumentRef};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Separator placed between pages when they are joined into one text.
pub const PAGE_SEPARATOR: char = '\u{000c}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub pages: Vec<PageText>,
}

impl ExtractedDocument {
    pub fn full_text(&self) -> String {
        let mut text = String::new();
        for (index, page) in self.pages.iter().enumerate() {
            if index > 0 {
                text.push(PAGE_SEPARATOR);
            }
            text.push_str(&page.text);
        }
        text
    }

    /// Character offset in [`Self::full_text`] where each page begins.
    fn page_starts(&self) -> Vec<usize> {
        let mut starts = Vec::with_capacity(self.pages.len());
        let mut offset = 0usize;
        for page in &self.pages {
            starts.push(offset);
            offset += page.text.chars().count() + 1;
        }
        starts
    }

    /// The separator after a page belongs to that page.
    fn page_in(&self, starts: &[usize], char_offset: usize) -> u32 {
        let position = starts.partition_point(|start| *start <= char_offset);
        position
            .checked_sub(1)
            .and_then(|index| self.pages.get(index))
            .map_or(1, |page| page.number)
    }

    /// Page holding the character at `char_offset` of [`Self::full_text`].
    pub fn page_at(&self, char_offset: usize) -> u32 {
        self.page_in(&self.page_starts(), char_offset)
    }

    pub fn spans(&self, windows: Vec<TextWindow>) -> Vec<ChunkSpan> {
        let starts = self.page_starts();
        windows
            .into_iter()
            .map(|window| ChunkSpan {
                page_number: self.page_in(&starts, window.start),
                content: window.text,
            })
            .collect()
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, document: &DocumentRef) -> Result<ExtractedDocument, ExtractError>;
}

async fn read_document(document: &DocumentRef) -> Result<Vec<u8>, ExtractError> {
    match document {
        DocumentRef::Path(path) => Ok(tokio::fs::read(path).await?),
        DocumentRef::Bytes(bytes) => Ok(bytes.clone()),
    }
}

/// UTF-8 text; form feeds are read as page breaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, document: &DocumentRef) -> Result<ExtractedDocument, ExtractError> {
        let bytes = read_document(document).await?;
        let text = String::from_utf8_lossy(&bytes);

        let pages = text
            .split(PAGE_SEPARATOR)
            .enumerate()
            .map(|(index, page)| PageText {
                number: (index + 1) as u32,
                text: page.to_string(),
            })
            .collect();

        Ok(ExtractedDocument { pages })
    }
}

/// Text layer of a PDF, page by page.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, document: &DocumentRef) -> Result<ExtractedDocument, ExtractError> {
        let bytes = read_document(document).await?;
        let pdf = Document::load_mem(&bytes).map_err(|error| ExtractError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in pdf.get_pages() {
            let text = pdf
                .extract_text(&[page_no])
                .map_err(|error| ExtractError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(ExtractError::NoText(format!(
                "pdf had no readable page text: {}",
                document.describe()
            )));
        }

        Ok(ExtractedDocument { pages })
    }
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl OcrEndpointConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    document_base64: String,
    source: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Sends images and scanned PDFs to a multimodal OCR service over HTTP.
#[derive(Debug, Clone)]
pub struct OcrEndpointExtractor {
    config: OcrEndpointConfig,
    client: Client,
}

impl OcrEndpointExtractor {
    pub fn new(config: OcrEndpointConfig) -> Result<Self, ConfigError> {
        if config.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("OCR endpoint URL".to_string()));
        }
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|error| ConfigError::InvalidValue {
            field: "ocr_http_client",
            details: error.to_string(),
        })?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl TextExtractor for OcrEndpointExtractor {
    async fn extract(&self, document: &DocumentRef) -> Result<ExtractedDocument, ExtractError> {
        let bytes = read_document(document).await?;
        let payload = OcrRequest {
            document_base64: STANDARD.encode(bytes),
            source: document.describe(),
        };

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ExtractError::OcrFailed(format!(
                "OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json().await?;
        let pages = payload_to_pages(&payload, &document.describe())?;
        Ok(ExtractedDocument { pages })
    }
}

fn payload_to_pages(payload: &OcrResponse, source: &str) -> Result<Vec<PageText>, ExtractError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_ref().map(|value| value.trim().to_string());
                text.and_then(|normalized| {
                    if normalized.is_empty() {
                        None
                    } else {
                        Some(PageText {
                            number: page.page.unwrap_or(1),
                            text: normalized,
                        })
                    }
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split(PAGE_SEPARATOR)
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim().to_string();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized,
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(ExtractError::OcrFailed(format!(
        "OCR response has no readable text for {source}"
    )))
}

/// Dispatches documents to the extractor registered for their kind.
///
/// When an OCR extractor is configured it handles images and doubles as the fallback
/// for PDFs that have no usable text layer.
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<DocumentKind, Arc<dyn TextExtractor>>,
    pdf_fallback: Option<Arc<dyn TextExtractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistry {
    /// Plain text and PDF text-layer extraction; images need [`Self::with_ocr`].
    pub fn new() -> Self {
        Self::empty()
            .register(DocumentKind::Text, Arc::new(PlainTextExtractor))
            .register(DocumentKind::Pdf, Arc::new(PdfTextExtractor))
    }

    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
            pdf_fallback: None,
        }
    }

    pub fn register(mut self, kind: DocumentKind, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractors.insert(kind, extractor);
        self
    }

    pub fn with_ocr(mut self, ocr: OcrEndpointExtractor) -> Self {
        let ocr: Arc<dyn TextExtractor> = Arc::new(ocr);
        self.extractors.insert(DocumentKind::Image, Arc::clone(&ocr));
        self.pdf_fallback = Some(ocr);
        self
    }

    pub async fn extract(
        &self,
        document: &DocumentRef,
        kind: DocumentKind,
    ) -> Result<ExtractedDocument, ExtractError> {
        let extractor = self
            .extractors
            .get(&kind)
            .ok_or_else(|| ExtractError::Unsupported(kind.to_string()))?;

        match extractor.extract(document).await {
            Ok(extracted) => Ok(extracted),
            Err(primary @ (ExtractError::PdfParse(_) | ExtractError::NoText(_)))
                if kind == DocumentKind::Pdf =>
            {
                let Some(fallback) = &self.pdf_fallback else {
                    return Err(primary);
                };
                debug!(document = %document.describe(), "pdf text layer unusable, trying OCR");
                fallback.extract(document).await.map_err(|ocr_error| {
                    warn!(document = %document.describe(), %ocr_error, "OCR fallback failed");
                    ExtractError::PdfParse(format!("{primary}; OCR fallback failed: {ocr_error}"))
                })
            }
            Err(error) => Err(error),
        }
    }
}
