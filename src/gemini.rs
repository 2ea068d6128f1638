//! Live extractor backed by a Gemini-compatible `generateContent` endpoint.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::extract::{validate_image, ExtractionError, MarkdownExtractor};

const EXTRACTION_PROMPT: &str = "Extract all text and mathematical formulas from this image.
Return the result in Markdown format.
Use LaTeX syntax wrapped in $ for inline math and $$ for display math.
Preserve document structure (headings, lists, paragraphs).
Only return the extracted content, no explanations or preamble.";

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    InlineData { inline_data: InlineData<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<UpstreamError>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct GeminiClient {
    http: reqwest::Client,
    url: Url,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &Config) -> Result<Self, ExtractionError> {
        if config.api_key.is_empty() {
            return Err(ExtractionError::MissingApiKey);
        }

        let base = config.api_endpoint.trim_end_matches('/');
        let mut url = Url::parse(&format!(
            "{}/v1beta/models/{}:generateContent",
            base, config.model
        ))
        .map_err(|e| ExtractionError::InvalidEndpoint(format!("{}: {}", config.api_endpoint, e)))?;
        url.query_pairs_mut().append_pair("key", &config.api_key);

        Ok(Self {
            http: reqwest::Client::new(),
            url,
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl MarkdownExtractor for GeminiClient {
    async fn extract_markdown(&self, image: &[u8], mime_type: &str) -> Result<String, ExtractionError> {
        validate_image(image, mime_type)?;

        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type,
                            data: STANDARD.encode(image),
                        },
                    },
                    Part::Text {
                        text: EXTRACTION_PROMPT,
                    },
                ],
            }],
        };

        tracing::debug!(model = %self.model, bytes = image.len(), mime_type, "calling upstream model");

        let response = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractionError::Request(e.without_url().to_string()))?;

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|e| ExtractionError::ReadBody(e.without_url().to_string()))?;

        let parsed: GenerateResponse = serde_json::from_slice(&raw).map_err(|e| {
            tracing::warn!(%status, "upstream returned an undecodable body");
            ExtractionError::Decode(e.to_string())
        })?;

        collect_markdown(parsed)
    }
}

/// Concatenates the text parts of the first candidate.
fn collect_markdown(response: GenerateResponse) -> Result<String, ExtractionError> {
    if let Some(err) = response.error {
        tracing::warn!(code = err.code, message = %err.message, "upstream reported an error");
        return Err(ExtractionError::Api {
            message: err.message,
            code: err.code,
        });
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(ExtractionError::NoContent)?;
    if candidate.content.parts.is_empty() {
        return Err(ExtractionError::NoContent);
    }

    Ok(candidate
        .content
        .parts
        .into_iter()
        .map(|p| p.text)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::StatusCode, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Option<(String, HashMap<String, String>, Value)>>>;

    fn config_for(endpoint: &str) -> Config {
        Config {
            api_key: "test-key".to_string(),
            api_endpoint: endpoint.to_string(),
            model: "gemini-2.5-flash".to_string(),
            port: 0,
            allowed_origins: vec!["*".to_string()],
            static_dir: "web".into(),
        }
    }

    /// Spawns a fake upstream that answers every POST with `reply`.
    async fn fake_upstream(status: StatusCode, reply: String) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();

        let app = Router::new().fallback(
            move |uri: axum::http::Uri,
                  Query(query): Query<HashMap<String, String>>,
                  Json(body): Json<Value>| {
                let sink = sink.clone();
                let reply = reply.clone();
                async move {
                    *sink.lock().unwrap() = Some((uri.path().to_string(), query, body));
                    (
                        status,
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        reply,
                    )
                }
            },
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), captured)
    }

    #[test]
    fn requires_api_key() {
        let mut cfg = config_for("http://127.0.0.1:8045");
        cfg.api_key.clear();
        let err = GeminiClient::new(&cfg).err().unwrap();
        assert_eq!(err.to_string(), "GEMINI_API_KEY is required");
    }

    #[test]
    fn rejects_unparseable_endpoint() {
        let err = GeminiClient::new(&config_for("not a url")).err().unwrap();
        assert!(matches!(err, ExtractionError::InvalidEndpoint(_)));
    }

    #[test]
    fn builds_generate_content_url() {
        let client = GeminiClient::new(&config_for("http://127.0.0.1:8045/")).unwrap();
        assert_eq!(
            client.url.as_str(),
            "http://127.0.0.1:8045/v1beta/models/gemini-2.5-flash:generateContent?key=test-key"
        );
        assert_eq!(client.model(), "gemini-2.5-flash");
    }

    #[test]
    fn request_body_shape() {
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/png",
                            data: STANDARD.encode(b"abc"),
                        },
                    },
                    Part::Text { text: "prompt" },
                ],
            }],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"contents": [{"role": "user", "parts": [
                {"inline_data": {"mime_type": "image/png", "data": "YWJj"}},
                {"text": "prompt"}
            ]}]})
        );
    }

    #[test]
    fn concatenates_first_candidate_parts() {
        let resp: GenerateResponse = serde_json::from_value(json!({
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "# Title\n\n"}, {"text": "$ E = mc^2 $"}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }))
        .unwrap();
        assert_eq!(collect_markdown(resp).unwrap(), "# Title\n\n$ E = mc^2 $");
    }

    #[test]
    fn upstream_error_object_wins() {
        let resp: GenerateResponse = serde_json::from_value(json!({
            "error": {"message": "quota exceeded", "code": 429}
        }))
        .unwrap();
        let err = collect_markdown(resp).unwrap_err();
        assert!(matches!(err, ExtractionError::Api { code: 429, .. }));
        assert_eq!(err.to_string(), "API error: quota exceeded");
    }

    #[test]
    fn empty_candidates_or_parts_are_no_content() {
        for body in [json!({}), json!({"candidates": []}), json!({"candidates": [{"content": {"parts": []}}]})] {
            let resp: GenerateResponse = serde_json::from_value(body).unwrap();
            let err = collect_markdown(resp).unwrap_err();
            assert_eq!(err.to_string(), "no content in response");
        }
    }

    #[tokio::test]
    async fn round_trip_against_fake_upstream() {
        let reply = json!({"candidates": [{"content": {"parts": [{"text": "$$x^2$$"}]}}]}).to_string();
        let (endpoint, captured) = fake_upstream(StatusCode::OK, reply).await;
        let client = GeminiClient::new(&config_for(&endpoint)).unwrap();

        let out = client.extract_markdown(b"png-bytes", "image/png").await.unwrap();
        assert_eq!(out, "$$x^2$$");

        let (path, query, body) = captured.lock().unwrap().take().unwrap();
        assert_eq!(path, "/v1beta/models/gemini-2.5-flash:generateContent");
        assert_eq!(query.get("key").map(String::as_str), Some("test-key"));
        let parts = &body["contents"][0]["parts"];
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[0]["inline_data"]["data"], STANDARD.encode(b"png-bytes"));
        assert_eq!(parts[1]["text"], EXTRACTION_PROMPT);
    }

    #[tokio::test]
    async fn upstream_error_surfaces_message() {
        let reply = json!({"error": {"message": "API key not valid", "code": 400}}).to_string();
        let (endpoint, _) = fake_upstream(StatusCode::BAD_REQUEST, reply).await;
        let client = GeminiClient::new(&config_for(&endpoint)).unwrap();

        let err = client.extract_markdown(b"img", "image/jpeg").await.unwrap_err();
        assert_eq!(err.to_string(), "API error: API key not valid");
    }

    #[tokio::test]
    async fn non_json_body_is_parse_error() {
        let (endpoint, _) = fake_upstream(StatusCode::BAD_GATEWAY, "<html>oops</html>".to_string()).await;
        let client = GeminiClient::new(&config_for(&endpoint)).unwrap();

        let err = client.extract_markdown(b"img", "image/webp").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Decode(_)));
        assert!(err.to_string().starts_with("failed to parse response: "));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = GeminiClient::new(&config_for(&format!("http://{}", addr))).unwrap();
        let err = client.extract_markdown(b"img", "image/gif").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Request(_)));
        assert!(err.to_string().starts_with("failed to send request: "));
    }

    #[tokio::test]
    async fn validation_happens_before_network() {
        // Nothing listens here; validation must fail first.
        let client = GeminiClient::new(&config_for("http://127.0.0.1:9")).unwrap();
        let err = client.extract_markdown(&[], "image/png").await.unwrap_err();
        assert!(matches!(err, ExtractionError::EmptyImage));
        let err = client.extract_markdown(b"x", "text/plain").await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported mime type: text/plain");
    }
}
