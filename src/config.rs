//! Monitor configuration: data model, JSON validation, and hot-reload.

use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, watch};

const DEFAULT_LOG_FILENAME: &str = "fb_monitor.log";
const DEFAULT_DATABASE_NAME: &str = "fb-rss-feed.json";

/// One AND-tier of a filter. Keywords inside a level are OR'd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordLevel {
    level: u32,
    keywords: Vec<String>,
    folded: Vec<String>,
}

impl KeywordLevel {
    /// Builds a level, dropping empty and duplicate keywords.
    ///
    /// Returns `None` when no usable keyword remains, since such levels are never stored.
    pub fn new<I, S>(level: u32, keywords: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut kept: Vec<String> = Vec::new();
        for keyword in keywords {
            let keyword = keyword.into();
            if keyword.is_empty() || kept.contains(&keyword) {
                continue;
            }
            kept.push(keyword);
        }

        if kept.is_empty() {
            return None;
        }

        let folded = kept.iter().map(|keyword| keyword.to_lowercase()).collect();
        Some(Self {
            level,
            keywords: kept,
            folded,
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Keywords case-folded for matching.
    pub fn folded_keywords(&self) -> &[String] {
        &self.folded
    }
}

/// The ordered set of levels for one monitored URL. No levels matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    levels: Vec<KeywordLevel>,
}

impl FilterSpec {
    /// Sorts levels ascending by number. Fails on a repeated level number.
    pub fn new(mut levels: Vec<KeywordLevel>) -> Result<Self, ConfigError> {
        levels.sort_by_key(KeywordLevel::level);
        if let Some(pair) = levels.windows(2).find(|pair| pair[0].level == pair[1].level) {
            return Err(ConfigError::validation(format!(
                "level {} is defined more than once",
                pair[0].level
            )));
        }
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[KeywordLevel] {
        &self.levels
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    fn from_json(url: &str, value: &Value) -> Result<Self, ConfigError> {
        let Value::Object(entries) = value else {
            return Err(ConfigError::validation(format!(
                "filters for {url} must be an object of levelN keys"
            )));
        };

        let mut levels = Vec::with_capacity(entries.len());
        for (key, keywords) in entries {
            let level = parse_level_key(key).ok_or_else(|| {
                ConfigError::validation(format!(
                    "malformed level key '{key}' for {url}, expected level<N> with N > 0"
                ))
            })?;

            let Value::Array(keywords) = keywords else {
                return Err(ConfigError::validation(format!(
                    "{key} for {url} must be an array of strings"
                )));
            };

            let keywords = keywords
                .iter()
                .map(|keyword| match keyword {
                    Value::String(keyword) => Ok(keyword.clone()),
                    other => Err(ConfigError::validation(format!(
                        "{key} for {url} contains a non-string keyword: {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;

            levels.extend(KeywordLevel::new(level, keywords));
        }

        Self::new(levels).map_err(|error| match error {
            ConfigError::Validation(message) => {
                ConfigError::validation(format!("{message} for {url}"))
            }
            other => other,
        })
    }

    fn to_json(&self) -> Value {
        let levels = self
            .levels
            .iter()
            .map(|level| {
                let keywords = level.keywords.iter().cloned().map(Value::String).collect();
                (format!("level{}", level.level), Value::Array(keywords))
            })
            .collect::<Map<_, _>>();
        Value::Object(levels)
    }
}

fn parse_level_key(key: &str) -> Option<u32> {
    let digits = key.strip_prefix("level")?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|level| *level > 0)
}

/// A monitored search URL and its filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlFilter {
    pub url: String,
    pub spec: FilterSpec,
}

/// A validated configuration. Never mutated; reloads replace it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server_ip: String,
    pub server_port: u16,
    pub currency: String,
    pub refresh_interval_minutes: u64,
    pub log_filename: String,
    pub database_name: String,
    /// Whether re-observing a known ad overwrites its title, price and link.
    pub refresh_ad_details: bool,
    /// In file order.
    pub url_filters: Vec<UrlFilter>,
}

/// The config file as written on disk, before validation.
#[derive(Debug, Deserialize)]
struct ConfigDocument {
    server_ip: String,
    server_port: i64,
    currency: String,
    refresh_interval_minutes: i64,
    log_filename: Option<String>,
    database_name: Option<String>,
    #[serde(default)]
    refresh_ad_details: bool,
    #[serde(default)]
    url_filters: Map<String, Value>,
}

impl Config {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|error| ConfigError::validation(format!("malformed JSON: {error}")))?;
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: Value) -> Result<Self, ConfigError> {
        let document: ConfigDocument = serde_json::from_value(value)
            .map_err(|error| ConfigError::validation(error.to_string()))?;

        if document.server_ip.trim().is_empty() {
            return Err(ConfigError::validation("server_ip must not be empty"));
        }
        let server_port = u16::try_from(document.server_port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| {
                ConfigError::validation(format!(
                    "server_port must be between 1 and 65535, got {}",
                    document.server_port
                ))
            })?;
        if document.currency.is_empty() {
            return Err(ConfigError::validation("currency must not be empty"));
        }
        let refresh_interval_minutes = u64::try_from(document.refresh_interval_minutes)
            .ok()
            .filter(|minutes| *minutes > 0)
            .ok_or_else(|| {
                ConfigError::validation(format!(
                    "refresh_interval_minutes must be a positive integer, got {}",
                    document.refresh_interval_minutes
                ))
            })?;

        let mut url_filters = Vec::with_capacity(document.url_filters.len());
        for (url, filters) in &document.url_filters {
            let parsed = url::Url::parse(url)
                .map_err(|error| ConfigError::validation(format!("invalid URL '{url}': {error}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::validation(format!(
                    "URL '{url}' must use http or https"
                )));
            }
            url_filters.push(UrlFilter {
                url: url.clone(),
                spec: FilterSpec::from_json(url, filters)?,
            });
        }

        Ok(Self {
            server_ip: document.server_ip,
            server_port,
            currency: document.currency,
            refresh_interval_minutes,
            log_filename: document
                .log_filename
                .unwrap_or_else(|| DEFAULT_LOG_FILENAME.to_string()),
            database_name: document
                .database_name
                .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string()),
            refresh_ad_details: document.refresh_ad_details,
            url_filters,
        })
    }

    /// The on-disk JSON representation.
    pub fn to_json_value(&self) -> Value {
        let url_filters = self
            .url_filters
            .iter()
            .map(|filter| (filter.url.clone(), filter.spec.to_json()))
            .collect::<Map<_, _>>();

        serde_json::json!({
            "server_ip": self.server_ip,
            "server_port": self.server_port,
            "currency": self.currency,
            "refresh_interval_minutes": self.refresh_interval_minutes,
            "log_filename": self.log_filename,
            "database_name": self.database_name,
            "refresh_ad_details": self.refresh_ad_details,
            "url_filters": url_filters,
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60))
    }
}

impl Config {
    /// Whether moving to `next` changes a setting only read at startup.
    pub fn needs_restart_for(&self, next: &Config) -> bool {
        self.server_ip != next.server_ip
            || self.server_port != next.server_port
            || self.log_filename != next.log_filename
            || self.database_name != next.database_name
    }
}

/// Reads and validates a config file.
pub async fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = tokio::fs::read_to_string(path).await?;
    Config::from_json_str(&content)
}

/// Owns the live config file and publishes every committed change.
///
/// Saves are serialized by a single-writer lock. Subscribers see the latest
/// committed config through a single-slot `watch` channel, so a burst of saves
/// collapses into the last one.
pub struct ConfigManager {
    path: PathBuf,
    write_lock: Mutex<()>,
    sender: watch::Sender<Arc<Config>>,
}

impl ConfigManager {
    /// Takes ownership of the config file at `path`, whose contents are `config`.
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        let (sender, _) = watch::channel(Arc::new(config));
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            sender,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<Config> {
        self.sender.borrow().clone()
    }

    /// A receiver that is notified on every committed change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.sender.subscribe()
    }

    /// Validates a raw JSON document and commits it.
    pub async fn save_document(&self, document: Value) -> Result<Arc<Config>, ConfigError> {
        let config = Config::from_json_value(document)?;
        self.save(config).await
    }

    /// Backs up the live file, atomically replaces it, then publishes the new config.
    ///
    /// Nothing is written and nothing is published if any step before the
    /// final rename fails.
    pub async fn save(&self, config: Config) -> Result<Arc<Config>, ConfigError> {
        let _guard = self.write_lock.lock().await;

        let content = serde_json::to_string_pretty(&config.to_json_value())?;

        if tokio::fs::try_exists(&self.path).await? {
            tokio::fs::copy(&self.path, sibling(&self.path, "bak")).await?;
        }

        let staging = sibling(&self.path, "tmp");
        tokio::fs::write(&staging, content).await?;
        if let Err(error) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(error.into());
        }

        let previous = self.current();
        if *previous == config {
            tracing::debug!("Configuration saved unchanged, nothing to publish");
            return Ok(previous);
        }
        if previous.needs_restart_for(&config) {
            tracing::warn!(
                "Server address, log file and ad database changes take effect after a restart"
            );
        }

        let config = Arc::new(config);
        self.sender.send_replace(config.clone());
        tracing::info!(
            "Configuration saved to {} and published ({} URLs, every {} minutes)",
            self.path.display(),
            config.url_filters.len(),
            config.refresh_interval_minutes
        );

        Ok(config)
    }
}

/// `config.json` -> `config.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
