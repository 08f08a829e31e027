use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("you must set instance name")]
    MissingName,
    #[error("at least one upstream node is required")]
    NoUpstreams,
    #[error("share difficulty must be greater than zero")]
    ZeroDifficulty,
    #[error("backlog window must be greater than zero")]
    ZeroBacklogWindow,
    #[error("upstream {name}: url must start with http:// (got {url})")]
    InvalidUpstreamUrl { name: String, url: String },
    #[error("interval {0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Deserialize, Clone, Debug)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub ban_enabled: bool,
    #[serde(default = "default_ban_timeout_secs")]
    pub ban_timeout_secs: u64,
    /// Invalid-to-valid ratio (in percent) that triggers a ban
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f64,
    /// Shares to accumulate before the ratio is evaluated
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u32,
    #[serde(default = "default_malformed_limit")]
    pub malformed_limit: u32,
    /// Idle time after which an IP's tallies are forgotten
    #[serde(default = "default_reset_interval_secs")]
    pub reset_interval_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ban_enabled: true,
            ban_timeout_secs: default_ban_timeout_secs(),
            invalid_percent: default_invalid_percent(),
            check_threshold: default_check_threshold(),
            malformed_limit: default_malformed_limit(),
            reset_interval_secs: default_reset_interval_secs(),
        }
    }
}

impl PolicyConfig {
    pub fn ban_timeout(&self) -> Duration {
        Duration::from_secs(self.ban_timeout_secs)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset_interval_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_limit_body_size")]
    pub limit_body_size: usize,
    #[serde(default)]
    pub behind_reverse_proxy: bool,
    #[serde(default = "default_block_refresh_interval_ms")]
    pub block_refresh_interval_ms: u64,
    #[serde(default = "default_state_update_interval_secs")]
    pub state_update_interval_secs: u64,
    /// Share difficulty advertised to miners
    pub difficulty: u64,
    #[serde(default = "default_hashrate_expiration_secs")]
    pub hashrate_expiration_secs: u64,
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(default = "default_max_fails")]
    pub max_fails: u64,
    #[serde(default = "default_backlog_window")]
    pub backlog_window: u64,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl ProxyConfig {
    pub fn block_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.block_refresh_interval_ms)
    }

    pub fn state_update_interval(&self) -> Duration {
        Duration::from_secs(self.state_update_interval_secs)
    }

    pub fn hashrate_expiration(&self) -> Duration {
        Duration::from_secs(self.hashrate_expiration_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    /// Bound on every storage call, connection included
    #[serde(default = "default_redis_timeout_secs")]
    pub timeout_secs: u64,
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            prefix: default_redis_prefix(),
            timeout_secs: default_redis_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// Instance name used when publishing node state
    #[serde(default)]
    pub name: String,
    pub proxy: ProxyConfig,
    #[serde(default = "default_upstream_check_interval_secs")]
    pub upstream_check_interval_secs: u64,
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,
    #[serde(default)]
    pub redis: RedisConfig,
}

fn default_true() -> bool { true }
fn default_listen() -> String { "0.0.0.0:8888".to_string() }
fn default_limit_body_size() -> usize { 256 }
fn default_block_refresh_interval_ms() -> u64 { 120 }
fn default_state_update_interval_secs() -> u64 { 3 }
fn default_hashrate_expiration_secs() -> u64 { 10800 }
fn default_max_fails() -> u64 { 100 }
fn default_backlog_window() -> u64 { 3 }
fn default_ban_timeout_secs() -> u64 { 1800 }
fn default_invalid_percent() -> f64 { 30.0 }
fn default_check_threshold() -> u32 { 30 }
fn default_malformed_limit() -> u32 { 5 }
fn default_reset_interval_secs() -> u64 { 3600 }
fn default_redis_timeout_secs() -> u64 { 5 }
fn default_upstream_check_interval_secs() -> u64 { 5 }
fn default_upstream_timeout_secs() -> u64 { 10 }
fn default_redis_url() -> String { "redis://127.0.0.1/".to_string() }
fn default_redis_prefix() -> String { "ergo".to_string() }

impl Config {
    /// Config path: first CLI argument, then `ERGO_PROXY_CONFIG`, then `config.json`.
    pub fn resolve_path() -> PathBuf {
        std::env::args()
            .nth(1)
            .or_else(|| std::env::var("ERGO_PROXY_CONFIG").ok())
            .unwrap_or_else(|| "config.json".to_string())
            .into()
    }

    /// Read, apply env overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_json(&txt)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(txt)?)
    }

    fn apply_env(&mut self) {
        if let Ok(n) = std::env::var("ERGO_PROXY_NAME") { self.name = n; }
        if let Ok(l) = std::env::var("ERGO_PROXY_LISTEN") { self.proxy.listen = l; }
        if let Ok(r) = std::env::var("ERGO_REDIS_URL") { self.redis.url = r; }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.upstream.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        for u in &self.upstream {
            if !u.url.starts_with("http://") {
                return Err(ConfigError::InvalidUpstreamUrl {
                    name: u.name.clone(),
                    url: u.url.clone(),
                });
            }
        }
        if self.proxy.difficulty == 0 {
            return Err(ConfigError::ZeroDifficulty);
        }
        if self.proxy.backlog_window == 0 {
            return Err(ConfigError::ZeroBacklogWindow);
        }
        if self.proxy.block_refresh_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("block_refresh_interval_ms"));
        }
        if self.proxy.state_update_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("state_update_interval_secs"));
        }
        if self.upstream_check_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("upstream_check_interval_secs"));
        }
        if self.redis.timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("redis.timeout_secs"));
        }
        Ok(())
    }

    pub fn upstream_check_interval(&self) -> Duration {
        Duration::from_secs(self.upstream_check_interval_secs)
    }
}
