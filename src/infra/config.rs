// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Base URL used when building shareable links.
    pub public_url: String,
    /// Operator bearer token guarding session creation and abort.
    pub token: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            public_url: "http://127.0.0.1:8080".into(),
            token: None,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a receiver has to consent before the session expires.
    pub consent_window_secs: u64,
    /// How long a cleaned-up session remains queryable.
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            consent_window_secs: 900,
            retention_secs: 3600,
            sweep_interval_secs: 30,
        }
    }
}

/// Longest consent window or retention accepted: ten years.
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl SessionConfig {
    pub fn consent_window(&self) -> chrono::Duration {
        window(self.consent_window_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        window(self.retention_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (key, secs) in [
            ("session.consent_window_secs", self.consent_window_secs),
            ("session.retention_secs", self.retention_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                anyhow::bail!("{key} = {secs} exceeds the maximum of {MAX_WINDOW_SECS}");
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: String,
    pub playbooks_dir: PathBuf,
    /// Per-session key and job files. Defaults to the data directory.
    pub work_dir: Option<PathBuf>,
    pub install_timeout_secs: u64,
    pub revoke_timeout_secs: u64,
    /// Attempts for install-key and revoke-key, which are safe to repeat.
    pub key_job_attempts: u32,
    /// Identity used to reach the receiver before the session key is trusted.
    pub bootstrap_identity: Option<PathBuf>,
    pub host_key_checking: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "ansible-playbook".into(),
            playbooks_dir: PathBuf::from("playbooks"),
            work_dir: None,
            install_timeout_secs: 120,
            revoke_timeout_secs: 120,
            key_job_attempts: 2,
            bootstrap_identity: None,
            host_key_checking: true,
        }
    }
}

impl RunnerConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(paths::sessions_dir)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn revoke_timeout(&self) -> Duration {
        Duration::from_secs(self.revoke_timeout_secs)
    }

    pub fn attempts(&self) -> u32 {
        self.key_job_attempts.max(1)
    }
}

fn window(secs: u64) -> chrono::Duration {
    // Capped value always fits in an i64 and in chrono's range.
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.session.validate()?;
        Ok(config)
    }
}
