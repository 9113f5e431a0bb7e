use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CanvasConfig;
use crate::services::retry::RetryPolicy;

pub const BACKEND_URL_ENV: &str = "TANGENT_BACKEND_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    // If None, use OS default autosave directory
    pub autosave_override: Option<PathBuf>,
    // If None, use OS temporary directory for exports
    #[serde(default)]
    pub export_override: Option<PathBuf>,
    // If None, server traffic logs go to OS temp dir
    #[serde(default)]
    pub api_log_override: Option<PathBuf>,
    // Generation / persistence / analytics backend
    #[serde(default = "AppSettings::default_backend_url")]
    pub backend_url: String,
    #[serde(default = "AppSettings::default_model")]
    pub model_id: String,
    #[serde(default = "AppSettings::default_temperature")]
    pub temperature: f32,
    #[serde(default = "AppSettings::default_chat_type")]
    pub chat_type: String,
    #[serde(default = "AppSettings::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "AppSettings::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "AppSettings::default_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "AppSettings::default_stream")]
    pub stream_responses: bool,
    // Save chats on the backend instead of the local chat store
    #[serde(default)]
    pub remote_persistence: bool,
    #[serde(default = "AppSettings::default_search_debounce_ms")]
    pub search_debounce_ms: u64,
    // API service configuration (actix)
    #[serde(default)]
    pub api_enabled: bool,
    #[serde(default = "AppSettings::default_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "AppSettings::default_port")]
    pub api_port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub canvas: CanvasConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            autosave_override: None,
            export_override: None,
            api_log_override: None,
            backend_url: Self::default_backend_url(),
            model_id: Self::default_model(),
            temperature: Self::default_temperature(),
            chat_type: Self::default_chat_type(),
            max_retries: Self::default_max_retries(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            request_timeout_ms: Self::default_timeout_ms(),
            stream_responses: Self::default_stream(),
            remote_persistence: false,
            search_debounce_ms: Self::default_search_debounce_ms(),
            api_enabled: false,
            api_bind_addr: Self::default_bind_addr(),
            api_port: Self::default_port(),
            api_key: None,
            canvas: CanvasConfig::default(),
        }
    }
}

impl AppSettings {
    fn config_dir() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            // ~/Library/Application Support/Tangent-Loom
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("~"));
            return home.join("Library").join("Application Support").join("Tangent-Loom");
        }
        #[cfg(target_os = "windows")]
        {
            // %APPDATA%\Tangent-Loom
            if let Ok(appdata) = std::env::var("APPDATA") {
                return PathBuf::from(appdata).join("Tangent-Loom");
            }
            return PathBuf::from("Tangent-Loom");
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            // $XDG_CONFIG_HOME/Tangent-Loom or ~/.config/Tangent-Loom
            if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
                return PathBuf::from(xdg).join("Tangent-Loom");
            }
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("~"));
            return home.join(".config").join("Tangent-Loom");
        }
    }

    fn autosave_default_dir() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            let tmp = std::env::var_os("TMPDIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"));
            return tmp.join("Tangent-Loom");
        }
        #[cfg(target_os = "windows")]
        {
            // %LOCALAPPDATA%\Tangent-Loom\Autosave else TEMP
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                return PathBuf::from(local).join("Tangent-Loom").join("Autosave");
            }
            if let Ok(temp) = std::env::var("TEMP") {
                return PathBuf::from(temp).join("Tangent-Loom");
            }
            return PathBuf::from("Tangent-Loom");
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            // $XDG_STATE_HOME/tangent-loom or ~/.local/state/tangent-loom, else /tmp/Tangent-Loom
            if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
                return PathBuf::from(xdg).join("tangent-loom");
            }
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(".local").join("state").join("tangent-loom");
            }
            return PathBuf::from("/tmp").join("Tangent-Loom");
        }
    }

    /// Settings from disk (JSON, migrating legacy RON) with the environment
    /// override applied on top.
    pub fn load() -> anyhow::Result<Self> {
        let mut v = Self::load_file()?;
        v.apply_env();
        Ok(v)
    }

    fn load_file() -> anyhow::Result<Self> {
        let json_path = Self::config_dir().join("settings.json");
        if json_path.exists() {
            let mut f = std::fs::File::open(json_path)?;
            let mut s = String::new();
            f.read_to_string(&mut s)?;
            let v: Self = serde_json::from_str(&s)?;
            return Ok(v);
        }
        // Migrate from legacy RON if present
        let ron_path = Self::config_dir().join("settings.ron");
        if ron_path.exists() {
            let mut f = std::fs::File::open(&ron_path)?;
            let mut s = String::new();
            f.read_to_string(&mut s)?;
            let v: Self = ron::from_str(&s)?;
            if let Err(e) = v.save() {
                log::warn!("could not migrate settings to JSON: {}", e);
            }
            return Ok(v);
        }
        Ok(Self::default())
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(BACKEND_URL_ENV)
            && !url.trim().is_empty()
        {
            self.backend_url = url.trim().trim_end_matches('/').to_string();
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join("settings.json");
        let s = serde_json::to_string_pretty(self)?;
        let mut f = std::fs::File::create(path)?;
        f.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn autosave_dir(&self) -> PathBuf {
        if let Some(p) = &self.autosave_override {
            return p.clone();
        }
        Self::autosave_default_dir()
    }

    pub fn settings_dir() -> PathBuf { Self::config_dir() }

    /// Default export directory when no override is set: OS temporary directory.
    pub fn export_default_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push("Tangent-Loom");
        p.push("exports");
        p
    }

    pub fn export_dir(&self) -> PathBuf {
        if let Some(p) = &self.export_override {
            return p.clone();
        }
        Self::export_default_dir()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
            timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn search_debounce(&self) -> Duration { Duration::from_millis(self.search_debounce_ms) }

    pub(crate) fn default_backend_url() -> String { "http://127.0.0.1:5001".to_string() }
    pub(crate) fn default_model() -> String { "qwen2.5-coder:7b".to_string() }
    pub(crate) fn default_temperature() -> f32 { 0.7 }
    pub(crate) fn default_chat_type() -> String { "claude".to_string() }
    pub(crate) fn default_max_retries() -> u32 { 3 }
    pub(crate) fn default_retry_delay_ms() -> u64 { 1000 }
    pub(crate) fn default_timeout_ms() -> u64 { 60_000 }
    pub(crate) fn default_stream() -> bool { true }
    pub(crate) fn default_search_debounce_ms() -> u64 { 300 }
    pub(crate) fn default_bind_addr() -> String { "127.0.0.1".to_string() }
    pub(crate) fn default_port() -> u16 { 8787 }

    pub fn api_endpoint(&self) -> String { format!("{}:{}", self.api_bind_addr, self.api_port) }

    /// Default API log directory when no override is set: OS temporary directory.
    pub fn api_log_default_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push("Tangent-Loom");
        p.push("api-logs");
        p
    }

    pub fn api_log_dir(&self) -> PathBuf {
        if let Some(p) = &self.api_log_override {
            return p.clone();
        }
        Self::api_log_default_dir()
    }
}
