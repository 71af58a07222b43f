//! Configuration loader and validator for the crawler daemon.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::crawler::SchedulerSettings;
use crate::model::RetryPolicy;
use crate::session::PollerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub crawler: Crawler,
    #[serde(default)]
    pub wechat: Wechat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Job scheduler and article executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Crawler {
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    pub job_timeout_secs: u64,
    pub max_retries: i32,
    pub page_size: i64,
    pub page_delay_ms: u64,
}

impl Default for Crawler {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval_secs: 5,
            job_timeout_secs: 120,
            max_retries: 3,
            page_size: 5,
            page_delay_ms: 2000,
        }
    }
}

/// Provider endpoint and session poller settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Wechat {
    pub base_url: String,
    pub http_timeout_secs: u64,
    pub session_poll_interval_ms: u64,
    pub session_batch_size: i64,
    pub session_ttl_hours: u64,
}

impl Default for Wechat {
    fn default() -> Self {
        Self {
            base_url: crate::wechat::MP_BASE_URL.to_string(),
            http_timeout_secs: 20,
            session_poll_interval_ms: 2000,
            session_batch_size: 20,
            session_ttl_hours: 12,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/wechat2rss.db", self.app.data_dir))
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            concurrency: self.crawler.concurrency.max(1),
            poll_interval: Duration::from_secs(self.crawler.poll_interval_secs),
            job_timeout: Duration::from_secs(self.crawler.job_timeout_secs),
            retry: RetryPolicy::new(self.crawler.max_retries),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            interval: Duration::from_millis(self.wechat.session_poll_interval_ms),
            batch_size: self.wechat.session_batch_size,
            session_ttl: Duration::from_secs(self.wechat.session_ttl_hours.saturating_mul(60 * 60)),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.wechat.http_timeout_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.crawler.page_delay_ms)
    }
}

/// Upper bound for `wechat.session_ttl_hours` (one year).
const MAX_SESSION_TTL_HOURS: u64 = 24 * 365;

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let c = &cfg.crawler;
    // concurrency 0 is clamped to 1 rather than rejected
    if c.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("crawler.poll_interval_secs must be > 0"));
    }
    if c.job_timeout_secs == 0 {
        return Err(ConfigError::Invalid("crawler.job_timeout_secs must be > 0"));
    }
    if c.max_retries < 1 {
        return Err(ConfigError::Invalid("crawler.max_retries must be >= 1"));
    }
    if c.page_size < 1 {
        return Err(ConfigError::Invalid("crawler.page_size must be >= 1"));
    }

    let w = &cfg.wechat;
    match Url::parse(&w.base_url) {
        Ok(url) if url.has_host() => {}
        _ => return Err(ConfigError::Invalid("wechat.base_url must be an absolute URL")),
    }
    if w.http_timeout_secs == 0 {
        return Err(ConfigError::Invalid("wechat.http_timeout_secs must be > 0"));
    }
    if w.session_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("wechat.session_poll_interval_ms must be > 0"));
    }
    if w.session_batch_size < 1 {
        return Err(ConfigError::Invalid("wechat.session_batch_size must be >= 1"));
    }
    if w.session_ttl_hours == 0 {
        return Err(ConfigError::Invalid("wechat.session_ttl_hours must be > 0"));
    }
    if w.session_ttl_hours > MAX_SESSION_TTL_HOURS {
        return Err(ConfigError::Invalid("wechat.session_ttl_hours must be <= 8760"));
    }

    Ok(())
}

/// Example YAML with every key at its default.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

crawler:
  concurrency: 1
  poll_interval_secs: 5
  job_timeout_secs: 120
  max_retries: 3
  page_size: 5
  page_delay_ms: 2000

wechat:
  base_url: "https://mp.weixin.qq.com/"
  http_timeout_secs: 20
  session_poll_interval_ms: 2000
  session_batch_size: 20
  session_ttl_hours: 12
"#
}
