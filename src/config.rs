use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("could not parse {}: {source}", .path.display())]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid { key: String, value: String, reason: String },
}

/// A flat key/value configuration source.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn describe(&self) -> String;
}

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    env_file: PathBuf,
    loaded: bool,
}

impl EnvConfig {
    pub fn new(env_file: impl Into<PathBuf>) -> Self {
        let env_file = env_file.into();
        let loaded = env_file.exists() && dotenvy::from_path(&env_file).is_ok();
        Self { env_file, loaded }
    }
}

#[async_trait]
impl ConfigSource for EnvConfig {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn describe(&self) -> String {
        if self.loaded {
            format!("environment + {}", self.env_file.display())
        } else {
            "environment".to_string()
        }
    }
}

/// In-memory source.
#[derive(Clone, Debug, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[async_trait]
impl ConfigSource for MapConfig {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn describe(&self) -> String {
        format!("map ({} entries)", self.map.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub port: u16,
    /// milliseconds
    pub timeout: u64,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self { port: 7000, timeout: 20_000 }
    }
}

impl WebSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// milliseconds
    pub startup_timeout: u64,
    /// milliseconds
    pub delete_grace: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { startup_timeout: 10_000, delete_grace: 1_000 }
    }
}

impl WorkerSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout)
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_millis(self.delete_grace)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// seconds
    pub directory_refresh: u64,
    /// seconds
    pub reconnect_backoff: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { directory_refresh: 3600, reconnect_backoff: 60 }
    }
}

impl ServiceSettings {
    pub fn directory_refresh(&self) -> Duration {
        Duration::from_secs(self.directory_refresh)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    pub level: String,
    pub dir: PathBuf,
    pub file: String,
    /// Also write one JSON line per routed request.
    pub json: bool,
    pub otel_endpoint: Option<String>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            file: "slackmux.log".to_string(),
            json: false,
            otel_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub web: WebSettings,
    pub worker: WorkerSettings,
    pub service: ServiceSettings,
    pub logger: LoggerSettings,
}

/// Where the settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    Source(String),
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOrigin::File(path) => write!(f, "{}", path.display()),
            ConfigOrigin::Source(name) => f.write_str(name),
        }
    }
}

async fn read<T>(src: &dyn ConfigSource, keys: &[&str]) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    for key in keys {
        if let Some(raw) = src.get(key).await {
            return raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            });
        }
    }
    Ok(None)
}

impl Settings {
    /// `config` when that file exists, otherwise the environment (after
    /// loading `env_file`).
    pub async fn load(config: &Path, env_file: &Path) -> Result<(Self, ConfigOrigin), ConfigError> {
        if config.exists() {
            let settings = Self::from_file(config)?;
            return Ok((settings, ConfigOrigin::File(config.to_path_buf())));
        }
        let source = EnvConfig::new(env_file);
        let settings = Self::from_source(&source).await?;
        Ok((settings, ConfigOrigin::Source(source.describe())))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub async fn from_source(src: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let mut s = Settings::default();

        if let Some(v) = read::<u16>(src, &["PORT", "WEB_PORT"]).await? {
            s.web.port = v;
        }
        if let Some(v) = read::<u64>(src, &["WEB_TIMEOUT"]).await? {
            s.web.timeout = v;
        }
        if let Some(v) = read::<u64>(src, &["WORKER_STARTUP_TIMEOUT"]).await? {
            s.worker.startup_timeout = v;
        }
        if let Some(v) = read::<u64>(src, &["WORKER_DELETE_GRACE"]).await? {
            s.worker.delete_grace = v;
        }
        if let Some(v) = read::<u64>(src, &["DIRECTORY_REFRESH"]).await? {
            s.service.directory_refresh = v;
        }
        if let Some(v) = read::<u64>(src, &["RECONNECT_BACKOFF"]).await? {
            s.service.reconnect_backoff = v;
        }
        if let Some(v) = read::<String>(src, &["LOG_LEVEL"]).await? {
            s.logger.level = v;
        }
        if let Some(v) = read::<PathBuf>(src, &["LOG_DIR"]).await? {
            s.logger.dir = v;
        }
        if let Some(v) = read::<String>(src, &["LOG_FILE"]).await? {
            s.logger.file = v;
        }
        if let Some(v) = read::<bool>(src, &["LOG_JSON"]).await? {
            s.logger.json = v;
        }
        s.logger.otel_endpoint = read::<String>(src, &["OTEL_ENDPOINT"])
            .await?
            .filter(|endpoint| !endpoint.is_empty());

        s.validate()?;
        Ok(s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("web.timeout", self.web.timeout),
            ("worker.startup_timeout", self.worker.startup_timeout),
            ("service.directory_refresh", self.service.directory_refresh),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}
