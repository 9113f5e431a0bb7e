//! Clients for the generation, persistence and analytics backends, plus the
//! worker thread that runs them off the UI loop.

pub mod analytics;
pub mod generation;
pub mod persistence;
pub mod retry;
pub mod worker;

use reqwest::{Client, Response, StatusCode};

use crate::error::{CanvasError, CanvasResult};
use crate::persistence::settings::AppSettings;
use retry::RetryPolicy;

/// Connection details shared by the HTTP clients.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub chat_type: String,
    pub retry: RetryPolicy,
}

impl BackendConfig {
    pub fn from_settings(s: &AppSettings) -> Self {
        Self {
            base_url: s.backend_url.trim_end_matches('/').to_string(),
            model: s.model_id.clone(),
            temperature: s.temperature,
            chat_type: s.chat_type.clone(),
            retry: s.retry_policy(),
        }
    }

    pub fn url(&self, path: &str) -> String { format!("{}{}", self.base_url, path) }
}

// Timeouts are enforced per attempt by the retry policy, not by the client
pub(crate) fn http_client() -> CanvasResult<Client> {
    Client::builder()
        .build()
        .map_err(|e| CanvasError::TransientNetwork { message: e.to_string(), attempts: 0 })
}

/// Map an HTTP status onto the error taxonomy: 5xx and 429 are worth
/// retrying, other failures mean the request or payload is wrong.
pub(crate) async fn check_status(response: Response) -> CanvasResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(CanvasError::TransientNetwork { message, attempts: 1 })
    } else {
        Err(CanvasError::invalid_payload(message))
    }
}
