use async_trait::async_trait;

// ── Constants ────────────────────────────────────────────────────────────────

pub const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("image data is empty")]
    EmptyImage,
    #[error("unsupported mime type: {0}")]
    UnsupportedMimeType(String),
    #[error("GEMINI_API_KEY is required")]
    MissingApiKey,
    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to send request: {0}")]
    Request(String),
    #[error("failed to read response: {0}")]
    ReadBody(String),
    #[error("failed to parse response: {0}")]
    Decode(String),
    #[error("API error: {message}")]
    Api { message: String, code: i64 },
    #[error("no content in response")]
    NoContent,
    #[error("{0}")]
    Stub(String),
}

// ── Extractor capability ─────────────────────────────────────────────────────

/// Turns an image into Markdown with LaTeX-delimited math.
#[async_trait]
pub trait MarkdownExtractor: Send + Sync {
    async fn extract_markdown(&self, image: &[u8], mime_type: &str) -> Result<String, ExtractionError>;
}

pub fn is_supported_mime_type(mime_type: &str) -> bool {
    SUPPORTED_MIME_TYPES.contains(&mime_type)
}

/// Checks shared by every extractor: non-empty data first, then the mime allow-list.
pub fn validate_image(image: &[u8], mime_type: &str) -> Result<(), ExtractionError> {
    if image.is_empty() {
        return Err(ExtractionError::EmptyImage);
    }
    if !is_supported_mime_type(mime_type) {
        return Err(ExtractionError::UnsupportedMimeType(mime_type.to_string()));
    }
    Ok(())
}

// ── Deterministic stand-in ───────────────────────────────────────────────────

/// Extractor that answers with a fixed outcome after the usual input checks.
#[cfg_attr(not(test), allow(dead_code))]
pub struct StubExtractor {
    outcome: Result<String, String>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl StubExtractor {
    pub fn returning(markdown: impl Into<String>) -> Self {
        Self {
            outcome: Ok(markdown.into()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
        }
    }
}

#[async_trait]
impl MarkdownExtractor for StubExtractor {
    async fn extract_markdown(&self, image: &[u8], mime_type: &str) -> Result<String, ExtractionError> {
        validate_image(image, mime_type)?;
        self.outcome.clone().map_err(ExtractionError::Stub)
    }
}
