//! Server configuration.
//!
//! Priority: CLI / env var  >  TOML  >  built-in default, with the TOML
//! file at `{data_dir}/config.toml`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::error;

const DEFAULT_PORT: u16 = 6523;
const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_IDLE_SAVE_SECS: u64 = 60;

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 6523).
    port: Option<u16>,
    /// Bind address (default: 127.0.0.1).
    bind: Option<String>,
    /// Log level filter string, e.g. "debug", "info,scribed=trace".
    log: Option<String>,
    /// Seconds an unsubscribed session stays in memory before save-back.
    idle_save_secs: Option<u64>,
    /// Server-wide chat (default: enabled).
    chat_enabled: Option<bool>,
    /// Path to the ed25519 issuing key for `create-acl-account`.
    /// Without one, account creation is unsupported.
    signing_key: Option<PathBuf>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub log: String,
    pub idle_save_secs: u64,
    pub chat_enabled: bool,
    pub signing_key: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        ServerConfig {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            bind: toml.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            idle_save_secs: toml.idle_save_secs.unwrap_or(DEFAULT_IDLE_SAVE_SECS),
            chat_enabled: toml.chat_enabled.unwrap_or(true),
            signing_key: toml.signing_key,
            data_dir,
        }
    }

    /// Root of the on-disk note tree.
    pub fn tree_dir(&self) -> PathBuf {
        self.data_dir.join("tree")
    }

    /// The persistent account records.
    pub fn accounts_file(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("scribed");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("scribed");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("scribed");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("scribed");
        }
    }
    PathBuf::from(".scribed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_beats_toml_beats_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 7000\nidle_save_secs = 5\n",
        )
        .unwrap();

        let cfg = ServerConfig::new(Some(8000), Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.idle_save_secs, 5);
        assert_eq!(cfg.log, "info");
        assert!(cfg.chat_enabled);
    }

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.idle_save_secs, DEFAULT_IDLE_SAVE_SECS);
        assert!(cfg.signing_key.is_none());
    }
}
