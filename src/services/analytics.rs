use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{BackendConfig, check_status, http_client};
use crate::error::{CanvasError, CanvasResult};
use crate::graph_utils::import::BranchedChat;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub coherence: f32,
    #[serde(default)]
    pub reflection: Option<String>,
}

/// Embedding projection of every conversation plus its topic clustering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizationData {
    pub points: Vec<[f32; 2]>,
    pub clusters: Vec<i64>,
    pub titles: Vec<String>,
    pub topics: BTreeMap<String, TopicInfo>,
    #[serde(default)]
    pub chats_with_reflections: Vec<String>,
}

fn no_data(detail: impl Into<String>) -> CanvasError {
    CanvasError::invalid_payload(format!("no data available ({})", detail.into()))
}

impl VisualizationData {
    /// Check the raw shape before decoding: the three per-conversation
    /// arrays must be arrays of equal length and `topics` a map. Backends
    /// disagree on `chats_with_reflections` (titles or chat objects), so
    /// only the titles are kept from it.
    pub fn from_value(v: Value) -> CanvasResult<Self> {
        let obj = v.as_object().ok_or_else(|| no_data("payload is not an object"))?;
        for key in ["points", "clusters", "titles"] {
            if !obj.get(key).map(Value::is_array).unwrap_or(false) {
                return Err(no_data(format!("'{}' missing or not a list", key)));
            }
        }
        if !obj.get("topics").map(Value::is_object).unwrap_or(false) {
            return Err(no_data("'topics' missing or not a map"));
        }

        let points: Vec<[f32; 2]> = serde_json::from_value(obj["points"].clone()).map_err(|e| no_data(format!("points: {}", e)))?;
        let clusters: Vec<i64> = serde_json::from_value(obj["clusters"].clone()).map_err(|e| no_data(format!("clusters: {}", e)))?;
        let titles: Vec<String> = obj["titles"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|t| match t {
                        Value::String(s) => s.clone(),
                        Value::Object(o) => o.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let topics: BTreeMap<String, TopicInfo> =
            serde_json::from_value(obj["topics"].clone()).map_err(|e| no_data(format!("topics: {}", e)))?;
        let chats_with_reflections = obj
            .get("chats_with_reflections")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|c| match c {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o.get("title").or_else(|| o.get("chat_id")).and_then(Value::as_str).map(str::to_string),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let data = Self { points, clusters, titles, topics, chats_with_reflections };
        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> CanvasResult<()> {
        if self.points.len() != self.clusters.len() || self.points.len() != self.titles.len() {
            return Err(no_data(format!(
                "length mismatch: {} points, {} clusters, {} titles",
                self.points.len(),
                self.clusters.len(),
                self.titles.len()
            )));
        }
        if self.titles.is_empty() {
            return Err(no_data("empty dataset"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BranchedChatsResponse {
    #[serde(default)]
    pub branched_chats: BTreeMap<String, BranchedChat>,
}

#[async_trait]
pub trait AnalyticsService: Send + Sync {
    async fn visualization(&self, chat_type: &str, cancel: &CancellationToken) -> CanvasResult<VisualizationData>;
    async fn branched_chats(&self, chat_type: &str, cancel: &CancellationToken) -> CanvasResult<BTreeMap<String, BranchedChat>>;
}

pub struct HttpAnalytics {
    client: Client,
    cfg: BackendConfig,
}

impl HttpAnalytics {
    pub fn new(cfg: BackendConfig) -> CanvasResult<Self> {
        Ok(Self { client: http_client()?, cfg })
    }
}

#[async_trait]
impl AnalyticsService for HttpAnalytics {
    async fn visualization(&self, chat_type: &str, cancel: &CancellationToken) -> CanvasResult<VisualizationData> {
        let url = self.cfg.url("/api/visualization");
        let (client, url) = (&self.client, url.as_str());
        let raw: Value = self
            .cfg
            .retry
            .run("visualization", cancel, || async move {
                let resp = client.get(url).query(&[("type", chat_type)]).send().await?;
                let resp = check_status(resp).await?;
                resp.json::<Value>().await.map_err(|e| no_data(e.to_string()))
            })
            .await?;
        let data = VisualizationData::from_value(raw).inspect_err(|e| warn!("visualization payload rejected: {}", e))?;
        info!("visualization: {} conversations in {} topics", data.titles.len(), data.topics.len());
        Ok(data)
    }

    async fn branched_chats(&self, chat_type: &str, cancel: &CancellationToken) -> CanvasResult<BTreeMap<String, BranchedChat>> {
        let url = self.cfg.url("/api/messages/branched");
        let (client, url) = (&self.client, url.as_str());
        let resp: BranchedChatsResponse = self
            .cfg
            .retry
            .run("branched-chats", cancel, || async move {
                let resp = client.get(url).query(&[("type", chat_type)]).send().await?;
                let resp = check_status(resp).await?;
                resp.json::<BranchedChatsResponse>().await.map_err(|e| no_data(e.to_string()))
            })
            .await?;
        Ok(resp.branched_chats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_payload() {
        let v = json!({
            "points": [[0.1, 0.2], [1.0, -1.0]],
            "clusters": [0, 1],
            "titles": ["a", "b"],
            "topics": {"0": {"topic": "Rust", "size": 1, "coherence": 0.5}},
            "chats_with_reflections": [{"title": "b", "branches": {}}]
        });
        let d = VisualizationData::from_value(v).unwrap();
        assert_eq!(d.titles, vec!["a", "b"]);
        assert_eq!(d.chats_with_reflections, vec!["b"]);
    }

    #[test]
    fn rejects_wrong_shapes() {
        let topics_list = json!({"points": [], "clusters": [], "titles": [], "topics": []});
        assert!(matches!(VisualizationData::from_value(topics_list), Err(CanvasError::InvalidPayload { .. })));
        let mismatch = json!({"points": [[0.0, 0.0]], "clusters": [0, 1], "titles": ["a"], "topics": {}});
        assert!(matches!(VisualizationData::from_value(mismatch), Err(CanvasError::InvalidPayload { .. })));
        let missing = json!({"clusters": [0], "titles": ["a"], "topics": {}});
        assert!(VisualizationData::from_value(missing).is_err());
    }
}
