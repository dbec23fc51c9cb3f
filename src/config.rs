use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::manager::{ManagerConfig, ReconnectPolicy};
use crate::protocol::RoutingOptions;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base `ws://` or `wss://` URL of the chat server
    pub server_url: String,
    /// How long a message may wait for an open channel
    pub queue_timeout_secs: u64,
    /// Delay before the notification stream reconnects
    pub notification_reconnect_delay_secs: u64,
    /// Give up on a silent exchange after this long; unset waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_timeout_secs: Option<u64>,
    /// Subscribe to the notification stream on start
    pub notifications: bool,
    /// Routing defaults for new messages
    pub routing: RoutingOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            queue_timeout_secs: 10,
            notification_reconnect_delay_secs: 5,
            stall_timeout_secs: None,
            notifications: false,
            routing: RoutingOptions::default(),
        }
    }
}

impl Config {
    /// `~/.chatlink/config.toml`
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".chatlink").join("config.toml")
    }

    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !config_path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        config.server_url()?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("writing {}", config_path.display()))?;
        Ok(())
    }

    /// Parsed and checked server URL.
    pub fn server_url(&self) -> Result<Url> {
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url `{}`", self.server_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("server_url must use ws:// or wss://, got `{}`", url.scheme());
        }
        Ok(url)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn notification_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.notification_reconnect_delay_secs)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_secs.map(Duration::from_secs)
    }

    /// Manager settings for a chat stream.
    pub fn chat_manager(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig {
            queue_timeout: self.queue_timeout(),
            stall_timeout: self.stall_timeout(),
            ..ManagerConfig::new(self.server_url()?, ReconnectPolicy::Manual)
        })
    }
}
