use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

use super::settings::AppSettings;
use crate::error::CanvasResult;
use crate::graph_utils::graph::{ConversationGraph, Node};
use crate::layout::LayoutMode;
use crate::viewport::ViewState;

/// Local snapshot of one open canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStateFile {
    #[serde(default)]
    pub chat_id: Option<String>,
    pub title: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub view: ViewState,
    #[serde(default)]
    pub layout_mode: LayoutMode,
}

impl AppStateFile {
    pub fn from_runtime(chat_id: Option<&str>, title: &str, graph: &ConversationGraph, view: ViewState, layout_mode: LayoutMode) -> Self {
        Self {
            chat_id: chat_id.map(str::to_string),
            title: title.to_string(),
            nodes: graph.to_nodes(),
            view,
            layout_mode,
        }
    }

    /// Rebuild the graph, validating the tree invariants on the way in.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_runtime(self) -> CanvasResult<(ConversationGraph, ViewState, LayoutMode)> {
        let graph = ConversationGraph::from_nodes(self.nodes)?;
        Ok((graph, self.view, self.layout_mode))
    }
}

static SETTINGS_OVERRIDE: OnceLock<AppSettings> = OnceLock::new();

pub fn set_settings_override(settings: AppSettings) {
    let _ = SETTINGS_OVERRIDE.set(settings);
}

pub fn autosave_dir() -> PathBuf {
    // If an override is set (e.g. from main.rs), use it.
    if let Some(settings) = SETTINGS_OVERRIDE.get() {
        return settings.autosave_dir();
    }
    let settings = AppSettings::load().unwrap_or_default();
    settings.autosave_dir()
}

pub fn active_state_path_in(dir: &Path) -> PathBuf {
    dir.join("state.ron")
}

pub fn versioned_state_path_in(dir: &Path) -> PathBuf {
    let now = OffsetDateTime::now_utc();
    let fmt = format_description!("[year][month][day]_[hour][minute][second]");
    let stamp = now.format(fmt).unwrap_or_else(|_| "unknown".to_string());
    dir.join(format!("state_{}.ron", stamp))
}

pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("ron.tmp");
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(data)?;
        f.flush()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

pub(crate) fn to_pretty_ron<T: Serialize>(value: &T) -> Result<String, ron::Error> {
    let pretty = PrettyConfig::new().separate_tuple_members(true).enumerate_arrays(false);
    ron::ser::to_string_pretty(value, pretty)
}

pub fn save_active_in(dir: &Path, state: &AppStateFile) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let s = to_pretty_ron(state)?;
    let path = active_state_path_in(dir);
    atomic_write(&path, s.as_bytes())?;
    Ok(path)
}

pub fn save_versioned_in(dir: &Path, state: &AppStateFile) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let s = to_pretty_ron(state)?;
    let path = versioned_state_path_in(dir);
    atomic_write(&path, s.as_bytes())?;
    Ok(path)
}

pub fn save_active(state: &AppStateFile) -> anyhow::Result<PathBuf> { save_active_in(&autosave_dir(), state) }

pub fn save_versioned(state: &AppStateFile) -> anyhow::Result<PathBuf> { save_versioned_in(&autosave_dir(), state) }

pub fn load_active_in(dir: &Path) -> anyhow::Result<Option<AppStateFile>> {
    let path = active_state_path_in(dir);
    if !path.exists() {
        return Ok(None);
    }
    load_from_path(&path).map(Some)
}

pub fn load_active() -> anyhow::Result<Option<AppStateFile>> { load_active_in(&autosave_dir()) }

pub fn load_from_path(path: &Path) -> anyhow::Result<AppStateFile> {
    let mut f = File::open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let state: AppStateFile = ron::from_str(&buf)?;
    Ok(state)
}

pub fn list_versions_in(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = Vec::new();
    if dir.exists() {
        for e in fs::read_dir(dir)? {
            let p = e?.path();
            if let Some(name) = p.file_name().and_then(|s| s.to_str())
                && name.starts_with("state_")
                && name.ends_with(".ron")
            {
                entries.push(p);
            }
        }
    }
    // newest first; the timestamp sorts lexicographically
    entries.sort();
    entries.reverse();
    Ok(entries)
}

pub fn list_versions() -> anyhow::Result<Vec<PathBuf>> { list_versions_in(&autosave_dir()) }
