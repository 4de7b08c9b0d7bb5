//! Client configuration.
//!
//! Resolved in layers: built-in defaults < `<data dir>/client.toml` < env vars
//! < explicit CLI flags. The data dir is `--data-dir` > `ORBITDOCK_DATA_DIR` >
//! `~/.orbitdock`, shared with the server so the auth token file is found
//! without extra setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::logging::{LogFormat, LogSettings};
use crate::supervisor::ReconnectPolicy;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:4000/ws";
pub const DEFAULT_APPROVAL_PAGE_LIMIT: u32 = 200;

/// Locations under the OrbitDock data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Priority: `explicit` arg > `ORBITDOCK_DATA_DIR` env > `~/.orbitdock` default.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(p) = explicit {
            return Ok(Self::new(p));
        }
        if let Ok(env_val) = std::env::var("ORBITDOCK_DATA_DIR") {
            return Ok(Self::new(env_val));
        }
        dirs::home_dir()
            .map(|home| Self::new(home.join(".orbitdock")))
            .ok_or(ConfigError::NoHomeDir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn token_file(&self) -> PathBuf {
        self.root.join("auth-token")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("client.toml")
    }
}

/// On-disk overrides. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub server_url: Option<String>,
    pub auth_token: Option<String>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub approval_page_limit: Option<u32>,
    pub log_format: Option<LogFormat>,
    pub log_filter: Option<String>,
}

impl ConfigFile {
    /// Missing file is not an error; returns defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Runtime configuration for a `SyncEngine`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub approval_page_limit: u32,
    /// Offsets (from the triggering action) of the follow-up history re-reads.
    pub approval_refresh_delays: Vec<Duration>,
    pub event_buffer: usize,
    pub log: LogSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            auth_token: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            approval_page_limit: DEFAULT_APPROVAL_PAGE_LIMIT,
            approval_refresh_delays: vec![
                Duration::from_millis(250),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            event_buffer: 256,
            log: LogSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults, then the config file, the token file, and env vars.
    pub fn load(paths: &DataPaths) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_file(ConfigFile::load(&paths.config_file())?);
        if config.auth_token.is_none() {
            config.auth_token = read_token_file(&paths.token_file());
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(url) = normalize_non_empty(file.server_url) {
            self.server_url = url;
        }
        if let Some(token) = normalize_non_empty(file.auth_token) {
            self.auth_token = Some(token);
        }
        if let Some(n) = file.max_reconnect_attempts {
            self.reconnect.max_attempts = n.max(1);
        }
        if let Some(ms) = file.reconnect_base_delay_ms {
            self.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.reconnect_max_delay_ms {
            self.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.probe_timeout_ms {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = file.approval_page_limit {
            self.approval_page_limit = limit;
        }
        if let Some(format) = file.log_format {
            self.log.format = format;
        }
        if let Some(filter) = normalize_non_empty(file.log_filter) {
            self.log.filter = Some(filter);
        }
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = normalize_non_empty(var("ORBITDOCK_SERVER_URL")) {
            self.server_url = url;
        }
        if let Some(token) = normalize_non_empty(var("ORBITDOCK_AUTH_TOKEN")) {
            self.auth_token = Some(token);
        }
        if let Some(format) = var("ORBITDOCK_CLIENT_LOG_FORMAT").and_then(|v| LogFormat::parse(&v)) {
            self.log.format = format;
        }
        // RUST_LOG only fills in when nothing more specific is configured.
        if let Some(filter) = normalize_non_empty(var("ORBITDOCK_CLIENT_LOG_FILTER")) {
            self.log.filter = Some(filter);
        } else if self.log.filter.is_none() {
            self.log.filter = normalize_non_empty(var("RUST_LOG"));
        }
    }

    /// HTTP base (`http://host:port`) derived from the WebSocket URL.
    pub fn http_base_url(&self) -> String {
        let url = self.server_url.trim_end_matches('/');
        let url = url.strip_suffix("/ws").unwrap_or(url);
        if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            url.to_string()
        }
    }
}

fn read_token_file(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| normalize_non_empty(Some(raw)))
}

fn normalize_non_empty(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::new(dir.path());
        let file = ConfigFile::load(&paths.config_file()).expect("load");
        assert!(file.server_url.is_none());
    }

    #[test]
    fn file_then_env_layering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::new(dir.path());
        std::fs::write(
            paths.config_file(),
            "server_url = \"ws://10.0.0.2:4000/ws\"\nmax_reconnect_attempts = 3\nprobe_timeout_ms = 750\n",
        )
        .expect("write config");
        std::fs::write(paths.token_file(), "  secret-token \n").expect("write token");

        let mut config = SyncConfig::default();
        config.apply_file(ConfigFile::load(&paths.config_file()).expect("load"));
        assert_eq!(config.server_url, "ws://10.0.0.2:4000/ws");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.probe_timeout, Duration::from_millis(750));
        assert_eq!(
            read_token_file(&paths.token_file()).as_deref(),
            Some("secret-token")
        );

        let env: HashMap<&str, &str> =
            HashMap::from([("ORBITDOCK_SERVER_URL", "wss://dock.example.com/ws")]);
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.server_url, "wss://dock.example.com/ws");
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut config = SyncConfig::default();
        config.apply_env(|_| Some("   ".to_string()));
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert!(config.auth_token.is_none());
        assert_eq!(config.log, LogSettings::default());
    }

    #[test]
    fn log_settings_layer_like_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "log_format = \"pretty\"\nlog_filter = \"warn\"\n").expect("write");
        let mut config = SyncConfig::default();
        config.apply_file(ConfigFile::load(&path).expect("load"));
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.log.filter.as_deref(), Some("warn"));

        let env: HashMap<&str, &str> = HashMap::from([
            ("ORBITDOCK_CLIENT_LOG_FORMAT", "json"),
            ("RUST_LOG", "trace"),
        ]);
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.filter.as_deref(), Some("warn"));

        let mut bare = SyncConfig::default();
        bare.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(bare.log.filter.as_deref(), Some("trace"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "sever_url = \"typo\"\n").expect("write");
        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn http_base_url_from_ws_url() {
        let mut config = SyncConfig::default();
        assert_eq!(config.http_base_url(), "http://127.0.0.1:4000");
        config.server_url = "wss://dock.example.com/ws/".to_string();
        assert_eq!(config.http_base_url(), "https://dock.example.com");
    }

    #[test]
    fn data_paths_layout() {
        let paths = DataPaths::new("/tmp/od");
        assert_eq!(paths.log_dir(), PathBuf::from("/tmp/od/logs"));
        assert_eq!(paths.token_file(), PathBuf::from("/tmp/od/auth-token"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/od/client.toml"));
    }
}
