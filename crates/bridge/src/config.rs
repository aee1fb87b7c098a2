//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use protocol::LineCoding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::usb::{DeviceFilter, RetryPolicy};

/// Directory name used under the platform config/data dirs
pub const APP_DIR: &str = "usb-ws-bridge";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub indicator: IndicatorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub log_level: String,
    /// Pause between attempts to bind the listen address
    pub bind_retry_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            bind_retry_ms: 2000,
        }
    }
}

/// Peripheral selection, line coding and session timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    /// VID:PID filters (`0x1234:0x5678`, `0x1234:*`); empty matches any serial device
    pub filters: Vec<String>,
    #[serde(flatten)]
    pub line: LineCoding,
    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Bytes of recent peripheral output kept for `GET /serial`
    pub backlog_bytes: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            filters: Vec::new(),
            line: LineCoding::default(),
            connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
            retry_interval_ms: policy.retry_interval.as_millis() as u64,
            read_timeout_ms: policy.read_timeout.as_millis() as u64,
            write_timeout_ms: 1000,
            backlog_bytes: 1024,
        }
    }
}

impl UsbSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Liveness probe period; keep below the clients' idle timeout
    pub keepalive_interval_secs: u64,
    /// Outgoing messages buffered per subscriber before it counts as saturated
    pub queue_depth: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 10,
            queue_depth: 64,
        }
    }
}

impl HubSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Shared secret accepted by the login endpoint
    pub password: String,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            password: "admin".to_string(),
        }
    }
}

/// Storage regions and replacement tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Bytes read from the upload stream per step
    pub chunk_size: usize,
    /// Per-read timeout on the upload stream; timeouts are retried
    pub recv_timeout_secs: u64,
    /// The two boot image slots (`a`, `b`)
    pub boot_slots: [String; 2],
    /// File naming the slot used on next boot
    pub boot_pointer: String,
    pub boot_capacity: u64,
    /// Raw content store region
    pub content_store: String,
    pub content_capacity: u64,
    pub boot_restart_delay_ms: u64,
    pub content_restart_delay_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let base = Self::default_dir();
        let path = |name: &str| base.join(name).to_string_lossy().into_owned();
        Self {
            chunk_size: 4096,
            recv_timeout_secs: 30,
            boot_slots: [path("boot_a.img"), path("boot_b.img")],
            boot_pointer: path("next_boot"),
            boot_capacity: 16 * 1024 * 1024,
            content_store: path("content.img"),
            content_capacity: 4 * 1024 * 1024,
            boot_restart_delay_ms: 1000,
            content_restart_delay_ms: 800,
        }
    }
}

impl StorageSettings {
    fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/var/lib").join(APP_DIR))
    }

    /// Expand `~` and environment references in a configured path
    pub fn expand(path: &str) -> Result<PathBuf> {
        let expanded = shellexpand::full(path)
            .with_context(|| format!("Failed to expand storage path '{}'", path))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }
}

/// Where the indicator colour goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Trace-level log lines only
    #[default]
    Log,
    /// Linux multicolour LED class device
    Sysfs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorSettings {
    pub sink: SinkKind,
    /// LED class device name under `/sys/class/leds`
    pub led_name: String,
    pub render_interval_ms: u64,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            led_name: "rgb:status".to_string(),
            render_interval_ms: 50,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `path`, or the first standard location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => [
                Self::default_path(),
                PathBuf::from("/etc").join(APP_DIR).join("bridge.toml"),
            ]
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults when none is found
    ///
    /// An explicitly given path that fails to load is an error.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        if path.is_some() {
            return Self::load(path);
        }
        match Self::load(None) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("{:#}, using defaults", e);
                Ok(Self::default())
            }
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(APP_DIR))
            .join("bridge.toml")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_addr))?;

        for filter in &self.usb.filters {
            if DeviceFilter::parse(filter).is_none() {
                return Err(anyhow!(
                    "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                    filter
                ));
            }
        }

        self.usb
            .line
            .validate()
            .context("Invalid [usb] line coding")?;

        if self.usb.connect_timeout_ms == 0 || self.usb.read_timeout_ms == 0 {
            return Err(anyhow!("USB connect and read timeouts must be non-zero"));
        }
        if self.usb.backlog_bytes == 0 {
            return Err(anyhow!("usb.backlog_bytes must be non-zero"));
        }

        if self.hub.keepalive_interval_secs == 0 {
            return Err(anyhow!("hub.keepalive_interval_secs must be non-zero"));
        }
        if self.hub.queue_depth == 0 {
            return Err(anyhow!("hub.queue_depth must be non-zero"));
        }

        if self.security.password.is_empty() {
            return Err(anyhow!("security.password must not be empty"));
        }

        let storage = &self.storage;
        if storage.chunk_size == 0 {
            return Err(anyhow!("storage.chunk_size must be non-zero"));
        }
        if storage.boot_capacity == 0 || storage.content_capacity == 0 {
            return Err(anyhow!("Storage region capacities must be non-zero"));
        }
        if storage.boot_slots[0] == storage.boot_slots[1] {
            return Err(anyhow!("Boot slots must be two distinct paths"));
        }

        if self.indicator.render_interval_ms == 0 {
            return Err(anyhow!("indicator.render_interval_ms must be non-zero"));
        }

        Ok(())
    }
}
