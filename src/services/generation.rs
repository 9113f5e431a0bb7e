use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{BackendConfig, check_status, http_client};
use crate::error::{CanvasError, CanvasResult};
use crate::graph_utils::graph::{Message, Role};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub stream: bool,
}

impl GenerateRequest {
    /// The prompt is the newest user message; the full context rides along.
    pub fn from_context(context: &[Message], system_prompt: Option<String>, model: &str, temperature: f32, stream: bool) -> Self {
        let prompt = context
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Self {
            prompt,
            messages: context.iter().map(|m| WireMessage { role: m.role, content: m.content.clone() }).collect(),
            system_prompt,
            model: model.to_string(),
            temperature,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    response: Option<String>,
}

pub type DeltaSink<'a> = &'a mut (dyn FnMut(String) + Send);

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: GenerateRequest, cancel: &CancellationToken) -> CanvasResult<String>;

    /// Delivers deltas in arrival order; returns once the stream ends.
    async fn generate_stream(&self, request: GenerateRequest, cancel: &CancellationToken, on_delta: DeltaSink<'_>) -> CanvasResult<()>;
}

pub struct HttpGeneration {
    client: Client,
    cfg: BackendConfig,
}

impl HttpGeneration {
    pub fn new(cfg: BackendConfig) -> CanvasResult<Self> {
        Ok(Self { client: http_client()?, cfg })
    }
}

// One SSE payload: JSON delta, the end marker, or raw text
fn parse_sse_data(data: &str) -> Option<Option<String>> {
    if data.trim() == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<StreamDelta>(data) {
        Ok(d) => Some(d.delta.or(d.response)),
        Err(_) => Some(Some(data.to_string())),
    }
}

#[async_trait]
impl GenerationService for HttpGeneration {
    async fn generate(&self, mut request: GenerateRequest, cancel: &CancellationToken) -> CanvasResult<String> {
        request.stream = false;
        let url = self.cfg.url("/api/generate");
        let (client, url, body) = (&self.client, url.as_str(), &request);
        let out = self
            .cfg
            .retry
            .run("generate", cancel, || async move {
                let resp = client.post(url).json(body).send().await?;
                let resp = check_status(resp).await?;
                let body: GenerateResponse = resp
                    .json()
                    .await
                    .map_err(|e| CanvasError::invalid_payload(format!("generate response: {}", e)))?;
                Ok(body.response)
            })
            .await?;
        info!("generation finished ({} chars)", out.len());
        Ok(out)
    }

    async fn generate_stream(&self, mut request: GenerateRequest, cancel: &CancellationToken, on_delta: DeltaSink<'_>) -> CanvasResult<()> {
        request.stream = true;
        let url = self.cfg.url("/api/generate");
        // Only opening the stream is retried; a broken stream mid-way is reported
        let (client, url, body) = (&self.client, url.as_str(), &request);
        let resp = self
            .cfg
            .retry
            .run("generate-stream", cancel, || async move {
                let resp = client.post(url).json(body).send().await?;
                check_status(resp).await
            })
            .await?;

        let mut events = resp.bytes_stream().eventsource();
        let mut chunks = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CanvasError::UserAbort),
                ev = tokio::time::timeout(self.cfg.retry.timeout, events.next()) => ev,
            };
            let event = match next {
                Err(_) => {
                    return Err(CanvasError::TransientNetwork {
                        message: format!("stream stalled for {} ms", self.cfg.retry.timeout.as_millis()),
                        attempts: 1,
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(CanvasError::TransientNetwork { message: e.to_string(), attempts: 1 }),
                Ok(Some(Ok(ev))) => ev,
            };
            match parse_sse_data(&event.data) {
                None => break,
                Some(Some(text)) if !text.is_empty() => {
                    chunks += 1;
                    on_delta(text);
                }
                Some(_) => {}
            }
        }
        debug!("stream closed after {} chunks", chunks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_is_latest_user_message() {
        let ctx = vec![Message::user("first"), Message::assistant("reply"), Message::user("second")];
        let req = GenerateRequest::from_context(&ctx, None, "m", 0.2, false);
        assert_eq!(req.prompt, "second");
        assert_eq!(req.messages.len(), 3);
    }

    #[test]
    fn sse_payloads() {
        assert_eq!(parse_sse_data("[DONE]"), None);
        assert_eq!(parse_sse_data(r#"{"delta":"hi"}"#), Some(Some("hi".to_string())));
        assert_eq!(parse_sse_data("plain"), Some(Some("plain".to_string())));
    }
}
