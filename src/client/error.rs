//! Client error types

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The server could not be reached (or kept failing) after every retry
    #[error("Transfer failed after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    /// The server refused the request; retrying will not help
    #[error("Server rejected request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Build a rejection from an error response, preferring the JSON
    /// `message` field over the raw body
    pub(crate) async fn rejected(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);

        ClientError::Rejected { status, message }
    }
}
