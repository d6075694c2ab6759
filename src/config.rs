use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngramConfig {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub client: ClientConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// The external service binary and how it is addressed.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Binary launched as `<bin> http-server --host H --port P`.
    pub bin: String,
    pub host: String,
    /// First port tried during negotiation.
    pub start_port: u16,
    /// How many ports to scan upward from `start_port`.
    pub port_scan_attempts: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub ready_poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub stop_poll_interval_ms: u64,
    pub lock_stale_secs: u64,
    pub log_tail_lines: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_secs: u64,
    pub fallback_timeout_secs: u64,
    /// Binary invoked as `<bin> <command> --flag value ...` on the degrade path.
    pub fallback_bin: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub home_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            supervisor: SupervisorConfig::default(),
            client: ClientConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bin: "engram-cli".into(),
            host: "127.0.0.1".into(),
            start_port: 8001,
            port_scan_attempts: 100,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval_ms: 500,
            probe_timeout_ms: 200,
            stop_poll_interval_ms: 100,
            lock_stale_secs: 30,
            log_tail_lines: 20,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            fallback_timeout_secs: 30,
            fallback_bin: "engram-cli".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home_dir = default_engram_dir().to_string_lossy().into_owned();
        Self { home_dir }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl SupervisorConfig {
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }
}

/// Returns `~/.engram/`
pub fn default_engram_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".engram")
}

/// Returns the default config file path: `~/.engram/config.toml`
pub fn default_config_path() -> PathBuf {
    default_engram_dir().join("config.toml")
}

impl EngramConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EngramConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (ENGRAM_HOME, ENGRAM_LOG_LEVEL, ENGRAM_DEBUG).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENGRAM_HOME") {
            self.storage.home_dir = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_LOG_LEVEL") {
            self.logging.level = val;
        }
        if std::env::var("ENGRAM_DEBUG").as_deref() == Ok("1") {
            self.logging.level = "debug".into();
        }
    }

    /// Resolve the per-user home directory, expanding `~` if needed.
    pub fn home(&self) -> PathBuf {
        expand_tilde(&self.storage.home_dir)
    }

    /// Directory holding the state record, server log, and start lock.
    pub fn servers_dir(&self) -> PathBuf {
        self.home().join("servers")
    }

    pub fn state_file(&self) -> PathBuf {
        self.servers_dir().join("engram.state")
    }

    pub fn log_file(&self) -> PathBuf {
        self.servers_dir().join("engram.log")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.servers_dir().join("engram.lock")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
