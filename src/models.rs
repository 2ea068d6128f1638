use serde::{Deserialize, Serialize};

/// Inbound body. Absent, `null` and empty fields all count as missing.
#[derive(Debug, Default, Deserialize)]
pub struct ExtractRequest {
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExtractPayload {
    pub markdown: String,
}

/// Uniform envelope for every response from the extraction endpoint.
///
/// `payload` is set exactly when `success` is true, `error` exactly when it is false.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub success: bool,
    pub payload: Option<ExtractPayload>,
    pub error: Option<String>,
}

impl ExtractResponse {
    pub fn ok(markdown: String) -> Self {
        Self {
            success: true,
            payload: Some(ExtractPayload { markdown }),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(message.into()),
        }
    }
}
