//! Configuration system for Speedup.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SPEEDUP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/speedup/config.toml
//!   3. ~/.config/speedup/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedupConfig {
    pub window: WindowConfig,
    pub host: HostConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Packets acknowledged as one unit.
    pub window_size: u32,
    /// Retransmission buffer capacity in packets. Multiple of window_size.
    pub sliding_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Local UDP address for data, ACKs and resets.
    pub bind_addr: String,
    /// Device data port (where ACKs and resets go, and where data comes from).
    pub device_data_addr: String,
    /// Device control port (start commands).
    pub device_control_addr: String,
    pub receive_timeout_ms: u64,
    /// Consecutive receive timeouts tolerated before the session fails.
    pub retry_ceiling: u32,
    /// Bound of the reader → processor queue, in datagrams.
    pub queue_capacity: usize,
    /// Keep-alive ACK threshold as a fraction of the window (window_size / N).
    /// 0 = never send keep-alives.
    pub keepalive_divisor: u32,
    /// SO_RCVBUF for the host socket. 0 = leave the OS default.
    pub recv_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub data_addr: String,
    pub control_addr: String,
    /// Retransmission timer period.
    pub tick_ms: u64,
    /// Retransmission rounds without progress before the session fails.
    pub retry_ceiling: u32,
    pub reset_wait: ResetWaitPolicy,
    /// Budget for a bounded reset wait. Must outlast the host's reset
    /// retries (`receive_timeout_ms × (retry_ceiling + 1)`).
    pub reset_wait_ms: u64,
}

/// How long a device waits for the host's reset request after the final ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetWaitPolicy {
    /// Give up after `reset_wait_ms` and abort the session.
    Bounded,
    /// Wait until a reset request or a new start command arrives.
    Unbounded,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            sliding_window: 64,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            device_data_addr: "127.0.0.1:17893".to_string(),
            device_control_addr: "127.0.0.1:17894".to_string(),
            receive_timeout_ms: 1000,
            retry_ceiling: 10,
            queue_capacity: 1024,
            keepalive_divisor: 3,
            recv_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            data_addr: "0.0.0.0:17893".to_string(),
            control_addr: "0.0.0.0:17894".to_string(),
            tick_ms: 5,
            retry_ceiling: 100,
            reset_wait: ResetWaitPolicy::Bounded,
            reset_wait_ms: 15_000,
        }
    }
}

impl HostConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

impl DeviceConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Ticks a bounded reset wait lasts; at least one.
    pub fn reset_wait_ticks(&self) -> u32 {
        let ticks = self.reset_wait_ms / self.tick_ms.max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("speedup")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SpeedupConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SpeedupConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SPEEDUP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SpeedupConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SPEEDUP_* overrides. `lookup` is the environment in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SPEEDUP_WINDOW__WINDOW_SIZE").and_then(|v| v.parse().ok()) {
            self.window.window_size = v;
        }
        if let Some(v) = lookup("SPEEDUP_WINDOW__SLIDING_WINDOW").and_then(|v| v.parse().ok()) {
            self.window.sliding_window = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__BIND_ADDR") {
            self.host.bind_addr = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__DEVICE_DATA_ADDR") {
            self.host.device_data_addr = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__DEVICE_CONTROL_ADDR") {
            self.host.device_control_addr = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__RECEIVE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.host.receive_timeout_ms = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__RETRY_CEILING").and_then(|v| v.parse().ok()) {
            self.host.retry_ceiling = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.host.queue_capacity = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__KEEPALIVE_DIVISOR").and_then(|v| v.parse().ok()) {
            self.host.keepalive_divisor = v;
        }
        if let Some(v) = lookup("SPEEDUP_HOST__RECV_BUFFER_BYTES").and_then(|v| v.parse().ok()) {
            self.host.recv_buffer_bytes = v;
        }
        if let Some(v) = lookup("SPEEDUP_DEVICE__DATA_ADDR") {
            self.device.data_addr = v;
        }
        if let Some(v) = lookup("SPEEDUP_DEVICE__CONTROL_ADDR") {
            self.device.control_addr = v;
        }
        if let Some(v) = lookup("SPEEDUP_DEVICE__TICK_MS").and_then(|v| v.parse().ok()) {
            self.device.tick_ms = v;
        }
        if let Some(v) = lookup("SPEEDUP_DEVICE__RETRY_CEILING").and_then(|v| v.parse().ok()) {
            self.device.retry_ceiling = v;
        }
        if let Some(v) = lookup("SPEEDUP_DEVICE__RESET_WAIT") {
            match v.as_str() {
                "bounded" => self.device.reset_wait = ResetWaitPolicy::Bounded,
                "unbounded" => self.device.reset_wait = ResetWaitPolicy::Unbounded,
                _ => {}
            }
        }
        if let Some(v) = lookup("SPEEDUP_DEVICE__RESET_WAIT_MS").and_then(|v| v.parse().ok()) {
            self.device.reset_wait_ms = v;
        }
    }
}
