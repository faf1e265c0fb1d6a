use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::ListingKey;
use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "lexicon-harvest.json";

pub const DEFAULT_LISTING_URL: &str = "https://www.corpus-lsfb.be/lexique.php?lettre=";
pub const DEFAULT_LOOKUP_URL: &str = "https://www.corpus-lsfb.be/getVocabulaire.php?mot=";
pub const DEFAULT_ASSET_BASE_URL: &str = "https://www.corpus-lsfb.be/img/pictures/";
pub const DEFAULT_KEYS: &str = "abcdefghijklmnopqrstuvwxyz";
pub const DEFAULT_ROW_MARKER: &str = "vocabulaire";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub lookup_url: Option<String>,
    #[serde(default)]
    pub asset_base_url: Option<String>,
    #[serde(default)]
    pub keys: Option<String>,
    #[serde(default)]
    pub row_marker: Option<String>,
    #[serde(default)]
    pub listing_delay_ms: Option<u64>,
    #[serde(default)]
    pub launch_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub asset_dir: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub asset_extension: Option<String>,
    #[serde(default)]
    pub checkpoint_listing: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

/// Exponential backoff for the metadata lookup: the pause after failed attempt
/// `n` (zero-based) is `base * 2^n`, never more than `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub listing_url: String,
    pub lookup_url: String,
    pub asset_base_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            asset_base_url: DEFAULT_ASSET_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoints: Endpoints,
    pub keys: Vec<ListingKey>,
    pub row_marker: String,
    pub listing_delay: Duration,
    pub launch_delay: Duration,
    pub retry: RetryPolicy,
    /// Zero means one worker per record.
    pub workers: usize,
    pub timeout: Duration,
    pub asset_dir: Utf8PathBuf,
    pub dataset: Utf8PathBuf,
    pub asset_extension: String,
    pub checkpoint_listing: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            keys: ListingKey::space(DEFAULT_KEYS),
            row_marker: DEFAULT_ROW_MARKER.to_string(),
            listing_delay: Duration::from_millis(500),
            launch_delay: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            workers: 8,
            timeout: Duration::from_secs(30),
            asset_dir: Utf8PathBuf::from("gif"),
            dataset: Utf8PathBuf::from("output.csv"),
            asset_extension: "gif".to_string(),
            checkpoint_listing: false,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file if one is given or present in the working
    /// directory; a missing default file just means "all defaults".
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let defaults = ResolvedConfig::default();

        match config.schema_version {
            None | Some(SCHEMA_VERSION) => {}
            Some(other) => {
                return Err(HarvestError::ConfigInvalid(format!(
                    "unsupported schema_version {other}, expected {SCHEMA_VERSION}"
                )));
            }
        }

        let keys = match config.keys {
            Some(keys) => ListingKey::space(&keys),
            None => defaults.keys,
        };
        if keys.is_empty() {
            return Err(HarvestError::ConfigInvalid("key space is empty".to_string()));
        }

        let row_marker = config
            .row_marker
            .map(|value| value.trim().to_string())
            .unwrap_or(defaults.row_marker);
        if row_marker.is_empty() || row_marker.chars().any(char::is_whitespace) {
            return Err(HarvestError::ConfigInvalid(format!(
                "row marker must be a single class name, got {row_marker:?}"
            )));
        }

        let retry_entry = config.retry.unwrap_or_default();
        let retry = RetryPolicy {
            max_attempts: retry_entry
                .max_attempts
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: retry_entry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: retry_entry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        };
        if retry.max_attempts == 0 {
            return Err(HarvestError::ConfigInvalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if retry.max_delay < retry.base_delay {
            return Err(HarvestError::ConfigInvalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
            ));
        }

        let endpoints = Endpoints {
            listing_url: config
                .listing_url
                .unwrap_or(defaults.endpoints.listing_url),
            lookup_url: config.lookup_url.unwrap_or(defaults.endpoints.lookup_url),
            asset_base_url: config
                .asset_base_url
                .unwrap_or(defaults.endpoints.asset_base_url),
        };

        let asset_extension = config
            .asset_extension
            .map(|ext| ext.trim().trim_start_matches('.').to_string())
            .unwrap_or(defaults.asset_extension);
        if asset_extension.is_empty() || asset_extension.contains(['/', '\\']) {
            return Err(HarvestError::ConfigInvalid(format!(
                "invalid asset extension {asset_extension:?}"
            )));
        }

        Ok(ResolvedConfig {
            endpoints,
            keys,
            row_marker,
            listing_delay: config
                .listing_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.listing_delay),
            launch_delay: config
                .launch_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.launch_delay),
            retry,
            workers: config.workers.unwrap_or(defaults.workers),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            asset_dir: config
                .asset_dir
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.asset_dir),
            dataset: config
                .dataset
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.dataset),
            asset_extension,
            checkpoint_listing: config
                .checkpoint_listing
                .unwrap_or(defaults.checkpoint_listing),
        })
    }
}
