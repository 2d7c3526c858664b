use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the chat REST endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiErrorBody {
    pub fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.detail.clone())
            .unwrap_or_else(|| "An error occurred".to_string())
    }
}

#[derive(Debug, Error)]
#[error("request failed with status {status}: {message}")]
pub struct ApiException {
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn from_body(status: u16, body: &ApiErrorBody) -> Self {
        Self::new(status, body.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_message_over_detail() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"message":"chat missing","detail":"not found"}"#)
                .expect("body");
        assert_eq!(body.describe(), "chat missing");
    }

    #[test]
    fn falls_back_to_generic_text() {
        let body: ApiErrorBody = serde_json::from_str("{}").expect("body");
        let err = ApiException::from_body(500, &body);
        assert_eq!(
            err.to_string(),
            "request failed with status 500: An error occurred"
        );
    }
}
