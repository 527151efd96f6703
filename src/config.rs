//! Pool configuration.
//!
//! Loaded from the YAML file named by `FETCHPOOL_CONFIG` when set, then
//! adjusted by `FETCHPOOL_*` environment overrides.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Allow pipelined HTTP requests at all.
    pub pipelining: bool,
    /// Requests a single connection may carry before it is replaced.
    pub max_requests: usize,
    /// Connections open at once across all endpoints.
    pub max_connections: usize,
    /// Seconds to wait for data while a response is outstanding.
    pub request_timeout_secs: u64,
    /// Seconds an idle connection stays open.
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// FTP password used when the URL has none.
    pub ftp_anonymous_password: String,
    /// Sent as `User-Agent` unless the caller supplies one.
    pub user_agent: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pipelining: true,
            max_requests: 100,
            max_connections: 10,
            request_timeout_secs: 60,
            idle_timeout_secs: 5,
            connect_timeout_secs: 30,
            ftp_anonymous_password: "fetchpool@".to_string(),
            user_agent: None,
        }
    }
}

impl PoolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("FETCHPOOL_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path))?;
                Self::from_yaml(&text).with_context(|| format!("parsing config file {}", path))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(v) = std::env::var("FETCHPOOL_PIPELINING") {
            self.pool.pipelining = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Ok(v) = std::env::var("FETCHPOOL_MAX_REQUESTS") {
            self.pool.max_requests = v
                .trim()
                .parse()
                .context("FETCHPOOL_MAX_REQUESTS must be a number")?;
        }
        if let Ok(v) = std::env::var("FETCHPOOL_MAX_CONNECTIONS") {
            self.pool.max_connections = v
                .trim()
                .parse()
                .context("FETCHPOOL_MAX_CONNECTIONS must be a number")?;
        }
        self.validate()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.pool.max_requests == 0 {
            anyhow::bail!("max_requests must be at least 1");
        }
        if self.pool.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        Ok(())
    }
}
