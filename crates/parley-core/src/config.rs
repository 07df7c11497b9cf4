//! Configuration system for Parley.
//!
//! Resolution order: environment variables → config file → defaults.
//! Command-line flags in the binaries are applied on top of the result.
//!
//! Config file location:
//!   1. $PARLEY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/parley/config.toml
//!   3. ~/.config/parley/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_MAX_FRAME_LEN;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub host: String,
    pub port: u16,
    /// Seconds allowed for the TLS handshake of a new connection.
    pub handshake_timeout_secs: u64,
    /// Frames queued per client before that client is considered stalled
    /// and evicted.
    pub outbound_queue_depth: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_len: usize,
    /// How often the online-user snapshot is logged. 0 = never.
    pub registry_snapshot_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate. Generated (self-signed) if missing at server start.
    pub cert_path: PathBuf,
    /// PEM private key. Generated together with the certificate.
    pub key_path: PathBuf,
    /// Names and addresses written into a generated certificate.
    pub subject_alt_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Empty = ask at startup.
    pub username: String,
    /// Certificate to trust for the server. None = accept any certificate.
    pub ca_cert: Option<PathBuf>,
    /// Input line that ends the chat.
    pub quit_command: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 8443;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout_secs: 10,
            outbound_queue_depth: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            registry_snapshot_secs: 30,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: config_dir().join("tls").join("cert.pem"),
            key_path: config_dir().join("tls").join("key.pem"),
            subject_alt_names: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: String::new(),
            ca_cert: None,
            quit_command: "/quit".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("parley")
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

impl ParleyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one file without env overrides. A missing file yields defaults.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(ParleyConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PARLEY_CONFIG")
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
            let text = toml::to_string_pretty(&ParleyConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PARLEY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any lookup. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PARLEY_SERVER__HOST") {
            self.server.host = v;
        }
        if let Some(p) = lookup("PARLEY_SERVER__PORT").and_then(|v| v.parse().ok()) {
            self.server.port = p;
        }
        if let Some(v) = lookup("PARLEY_TLS__CERT_PATH") {
            self.tls.cert_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PARLEY_TLS__KEY_PATH") {
            self.tls.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PARLEY_CLIENT__HOST") {
            self.client.host = v;
        }
        if let Some(p) = lookup("PARLEY_CLIENT__PORT").and_then(|v| v.parse().ok()) {
            self.client.port = p;
        }
        if let Some(v) = lookup("PARLEY_CLIENT__USERNAME") {
            self.client.username = v;
        }
        if let Some(v) = lookup("PARLEY_CLIENT__CA_CERT") {
            self.client.ca_cert = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
    }
}
