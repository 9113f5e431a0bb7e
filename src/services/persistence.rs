use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use super::{BackendConfig, check_status, http_client};
use crate::error::{CanvasError, CanvasResult};
use crate::graph_utils::graph::Node;
use crate::persistence::persist::{atomic_write, to_pretty_ron};

/// A saved conversation graph as the backend stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(alias = "id")]
    pub chat_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Returns the id the chat was stored under.
    async fn save(&self, chat: &ChatRecord, cancel: &CancellationToken) -> CanvasResult<String>;
    async fn load(&self, id: &str, cancel: &CancellationToken) -> CanvasResult<ChatRecord>;
    async fn list(&self, cancel: &CancellationToken) -> CanvasResult<Vec<ChatSummary>>;
    async fn delete(&self, id: &str, cancel: &CancellationToken) -> CanvasResult<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(default)]
    success: bool,
    data: Option<ChatRecord>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    chats: Vec<ChatSummary>,
}

pub struct HttpChatStore {
    client: Client,
    cfg: BackendConfig,
}

impl HttpChatStore {
    pub fn new(cfg: BackendConfig) -> CanvasResult<Self> {
        Ok(Self { client: http_client()?, cfg })
    }
}

fn decode_err(what: &str, e: reqwest::Error) -> CanvasError {
    CanvasError::invalid_payload(format!("{}: {}", what, e))
}

#[async_trait]
impl ChatStore for HttpChatStore {
    async fn save(&self, chat: &ChatRecord, cancel: &CancellationToken) -> CanvasResult<String> {
        let url = self.cfg.url("/api/chats/save");
        let (client, url) = (&self.client, url.as_str());
        let resp: SaveResponse = self
            .cfg
            .retry
            .run("chat-save", cancel, || async move {
                let resp = client.post(url).json(chat).send().await?;
                check_status(resp).await?.json().await.map_err(|e| decode_err("save response", e))
            })
            .await?;
        if !resp.success {
            return Err(CanvasError::invalid_payload(resp.error.unwrap_or_else(|| "save rejected".to_string())));
        }
        let id = resp.chat_id.unwrap_or_else(|| chat.chat_id.clone());
        info!("chat {} saved ({} nodes)", id, chat.nodes.len());
        Ok(id)
    }

    async fn load(&self, id: &str, cancel: &CancellationToken) -> CanvasResult<ChatRecord> {
        let url = self.cfg.url(&format!("/api/chats/load/{}", id));
        let (client, url) = (&self.client, url.as_str());
        let resp: LoadResponse = self
            .cfg
            .retry
            .run("chat-load", cancel, || async move {
                let resp = client.get(url).send().await?;
                check_status(resp).await?.json().await.map_err(|e| decode_err("load response", e))
            })
            .await?;
        match (resp.success, resp.data) {
            (true, Some(record)) => Ok(record),
            (_, _) => Err(CanvasError::invalid_payload(resp.error.unwrap_or_else(|| format!("chat {} not found", id)))),
        }
    }

    async fn list(&self, cancel: &CancellationToken) -> CanvasResult<Vec<ChatSummary>> {
        let url = self.cfg.url("/api/chats/list");
        let (client, url) = (&self.client, url.as_str());
        let resp: ListResponse = self
            .cfg
            .retry
            .run("chat-list", cancel, || async move {
                let resp = client.get(url).send().await?;
                check_status(resp).await?.json().await.map_err(|e| decode_err("list response", e))
            })
            .await?;
        Ok(resp.chats)
    }

    async fn delete(&self, id: &str, cancel: &CancellationToken) -> CanvasResult<()> {
        let url = self.cfg.url(&format!("/api/chats/delete/{}", id));
        let (client, url) = (&self.client, url.as_str());
        self.cfg
            .retry
            .run("chat-delete", cancel, || async move {
                let resp = client.delete(url).send().await?;
                check_status(resp).await.map(|_| ())
            })
            .await
    }
}

/// Same contract backed by RON files under `<dir>/<id>.ron`.
pub struct LocalChatStore {
    dir: PathBuf,
}

impl LocalChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> CanvasResult<PathBuf> {
        // Ids become file names; refuse anything that could escape the directory
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(CanvasError::invalid_payload(format!("invalid chat id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.ron", id)))
    }

    fn read(&self, path: &std::path::Path) -> CanvasResult<ChatRecord> {
        let s = fs::read_to_string(path)?;
        ron::from_str(&s).map_err(|e| CanvasError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl ChatStore for LocalChatStore {
    async fn save(&self, chat: &ChatRecord, _cancel: &CancellationToken) -> CanvasResult<String> {
        let mut record = chat.clone();
        if record.chat_id.is_empty() {
            record.chat_id = uuid::Uuid::now_v7().to_string();
        }
        record.last_modified = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.chat_id)?;
        let s = to_pretty_ron(&record).map_err(|e| CanvasError::Serialization(e.to_string()))?;
        atomic_write(&path, s.as_bytes())?;
        debug!("chat {} written to {}", record.chat_id, path.display());
        Ok(record.chat_id)
    }

    async fn load(&self, id: &str, _cancel: &CancellationToken) -> CanvasResult<ChatRecord> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(CanvasError::invalid_payload(format!("chat {} not found", id)));
        }
        self.read(&path)
    }

    async fn list(&self, _cancel: &CancellationToken) -> CanvasResult<Vec<ChatSummary>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let p = entry?.path();
            if p.extension().and_then(|e| e.to_str()) != Some("ron") {
                continue;
            }
            match self.read(&p) {
                Ok(r) => out.push(ChatSummary { id: r.chat_id, title: r.title, last_modified: r.last_modified }),
                Err(e) => log::warn!("skipping unreadable chat file {}: {}", p.display(), e),
            }
        }
        // Newest first, like the backend
        out.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(out)
    }

    async fn delete(&self, id: &str, _cancel: &CancellationToken) -> CanvasResult<()> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(CanvasError::invalid_payload(format!("chat {} not found", id)));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}
