//! Relay configuration.
//!
//! Loading order: compiled defaults, then an optional JSON file, then
//! `CUMBIA_*` environment variables. CLI flags are applied last by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How uploaded audio reaches the chat backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioDelivery {
    /// Persist under `audio_dir` and send the `/audios/...` URL as an `AUDIO` message.
    #[default]
    Reference,
    /// Forward the raw bytes through `send_audio`.
    Forward,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind; `0` asks the OS for one.
    pub port: u16,
    /// `host:port` of the chat backend's line-JSON endpoint.
    pub backend_addr: String,
    /// Run against the in-process chat service instead of `backend_addr`.
    pub in_memory: bool,
    /// Upper bound for every backend call.
    pub call_timeout_ms: u64,
    /// Where persisted audio lives; served under `/audios`.
    pub audio_dir: PathBuf,
    /// Staging directory for uploads. Defaults to `uploads`.
    pub upload_tmp_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
    /// Static browser client, served as the router fallback when set.
    pub web_root: Option<PathBuf>,
    pub audio_delivery: AudioDelivery,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            backend_addr: "127.0.0.1:10000".into(),
            in_memory: false,
            call_timeout_ms: 8_000,
            audio_dir: PathBuf::from("audios"),
            upload_tmp_dir: None,
            max_upload_bytes: 10 * 1024 * 1024,
            web_root: None,
            audio_delivery: AudioDelivery::Reference,
            log_level: "info".into(),
        }
    }
}

impl RelayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_tmp_dir(&self) -> PathBuf {
        self.upload_tmp_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("uploads"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Load configuration from `path` (if it exists) and the environment.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading relay config from file");
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        }
        _ => RelayConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut RelayConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = var("CUMBIA_HOST") {
        config.host = host;
    }
    if let Some(port) = var("CUMBIA_PORT") {
        config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
            key: "CUMBIA_PORT",
            value: port,
        })?;
    }
    if let Some(addr) = var("CUMBIA_BACKEND_ADDR") {
        config.backend_addr = addr;
    }
    if let Some(timeout) = var("CUMBIA_CALL_TIMEOUT_MS") {
        config.call_timeout_ms = timeout.parse().map_err(|_| ConfigError::InvalidValue {
            key: "CUMBIA_CALL_TIMEOUT_MS",
            value: timeout,
        })?;
    }
    if let Some(dir) = var("CUMBIA_AUDIO_DIR") {
        config.audio_dir = PathBuf::from(dir);
    }
    if let Some(root) = var("CUMBIA_WEB_ROOT") {
        config.web_root = Some(PathBuf::from(root));
    }
    if let Some(dir) = var("CUMBIA_UPLOAD_TMP_DIR") {
        config.upload_tmp_dir = Some(PathBuf::from(dir));
    }
    if let Some(flag) = var("CUMBIA_IN_MEMORY") {
        config.in_memory = match flag.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "CUMBIA_IN_MEMORY",
                    value: flag,
                });
            }
        };
    }
    if let Some(bytes) = var("CUMBIA_MAX_UPLOAD_BYTES") {
        config.max_upload_bytes = bytes.parse().map_err(|_| ConfigError::InvalidValue {
            key: "CUMBIA_MAX_UPLOAD_BYTES",
            value: bytes,
        })?;
    }
    if let Some(mode) = var("CUMBIA_AUDIO_DELIVERY") {
        config.audio_delivery = match mode.to_ascii_lowercase().as_str() {
            "reference" => AudioDelivery::Reference,
            "forward" => AudioDelivery::Forward,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "CUMBIA_AUDIO_DELIVERY",
                    value: mode,
                });
            }
        };
    }
    if let Some(level) = var("CUMBIA_LOG_LEVEL") {
        config.log_level = level;
    }
    Ok(())
}
