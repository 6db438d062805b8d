use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., 0.0.0.0:8080)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Filesystem the explorers operate on
    #[serde(default)]
    pub backend: BackendConfig,

    /// Absolute lifetime of a bound session in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// How often expired sessions are swept, in seconds
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Directory served under /static
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        /// Expected SHA-256 host key fingerprint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_key_fingerprint: Option<String>,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
        #[serde(default = "default_keepalive_interval")]
        keepalive_interval_secs: u64,
    },
    Local {
        root: PathBuf,
        /// username -> password
        #[serde(default)]
        users: HashMap<String, String>,
    },
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_session_ttl() -> u64 {
    24 * 60 * 60
}
fn default_reaper_interval() -> u64 {
    60
}
fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_keepalive_interval() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Ssh {
            host: "localhost".to_string(),
            port: default_ssh_port(),
            host_key_fingerprint: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backend: BackendConfig::default(),
            session_ttl_secs: default_session_ttl(),
            reaper_interval_secs: default_reaper_interval(),
            static_dir: None,
        }
    }
}

impl ServerConfig {
    /// Default config file path for this platform
    pub fn default_path() -> PathBuf {
        if let Some(dirs) = directories::ProjectDirs::from("com", "fe", "fe-server") {
            dirs.config_dir().join("config.json")
        } else {
            PathBuf::from("fe-config.json")
        }
    }

    /// Load config from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&data).with_context(|| "failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file path
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_secs == 0 {
            anyhow::bail!("session_ttl_secs must be greater than zero");
        }
        if self.reaper_interval_secs == 0 {
            anyhow::bail!("reaper_interval_secs must be greater than zero");
        }
        Ok(())
    }
}
