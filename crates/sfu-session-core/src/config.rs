use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static configuration consumed by the session engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Self-hosted server link. Overrides the managed cloud endpoint.
    #[serde(default)]
    pub local_link: Option<String>,
    #[serde(default)]
    pub api_user_name: String,
    #[serde(default)]
    pub api_key: String,
    /// Also connect to the managed cloud when a local link is configured.
    #[serde(default = "default_true")]
    pub connect_media_sfu: bool,
    #[serde(default)]
    pub use_local_ui_mode: bool,
    #[serde(default)]
    pub timings: Timings,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_link: None,
            api_user_name: String::new(),
            api_key: String::new(),
            connect_media_sfu: true,
            use_local_ui_mode: false,
            timings: Timings::default(),
        }
    }
}

impl SessionConfig {
    /// Non-blank local link, if any.
    pub fn local_link(&self) -> Option<&str> {
        self.local_link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }
}

/// Timeouts and intervals, in milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Timings {
    pub connect_timeout_ms: u64,
    pub connect_poll_ms: u64,
    pub join_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    pub auto_join_interval_ms: u64,
    pub auto_join_tick_ms: u64,
    pub settle_delay_ms: u64,
    pub record_change_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 18_000,
            connect_poll_ms: 100,
            join_backoff_ms: 1_500,
            ack_timeout_ms: 30_000,
            auto_join_interval_ms: 5_000,
            auto_join_tick_ms: 1_000,
            settle_delay_ms: 1_000,
            record_change_ms: 15_000,
        }
    }
}

impl Timings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn join_backoff(&self) -> Duration {
        Duration::from_millis(self.join_backoff_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn auto_join_interval(&self) -> Duration {
        Duration::from_millis(self.auto_join_interval_ms)
    }

    pub fn auto_join_tick(&self) -> Duration {
        Duration::from_millis(self.auto_join_tick_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn record_change(&self) -> Duration {
        Duration::from_millis(self.record_change_ms)
    }
}

/// JSON-backed persistence for [`SessionConfig`].
pub struct ConfigStore {
    config: Mutex<SessionConfig>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("session.json");
        let config = Self::load(&file_path);
        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    pub fn get(&self) -> SessionConfig {
        self.lock().clone()
    }

    pub fn set_local_link(&self, link: Option<String>) {
        self.lock().local_link = link;
        self.save();
    }

    pub fn set_credentials(&self, api_user_name: String, api_key: String) {
        {
            let mut config = self.lock();
            config.api_user_name = api_user_name;
            config.api_key = api_key;
        }
        self.save();
    }

    pub fn set_connect_media_sfu(&self, enabled: bool) {
        self.lock().connect_media_sfu = enabled;
        self.save();
    }

    pub fn set_use_local_ui_mode(&self, enabled: bool) {
        self.lock().use_local_ui_mode = enabled;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) {
        let config = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize session config: {e}"),
        }
    }

    fn load(path: &PathBuf) -> SessionConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable session config: {e}");
                SessionConfig::default()
            }),
            Err(_) => SessionConfig::default(),
        }
    }
}
