use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid record id: {0:?}")]
    InvalidId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    ConfigInvalid(String),

    #[error("listing request failed: {0}")]
    ListingHttp(String),

    #[error("listing returned status {status}: {message}")]
    ListingStatus { status: u16, message: String },

    #[error("listing document could not be parsed: {0}")]
    ListingParse(String),

    #[error("asset lookup failed: {0}")]
    AssetHttp(String),

    #[error("asset lookup request rejected: {0}")]
    AssetRequest(String),

    #[error("asset lookup returned status {status}: {message}")]
    AssetStatus { status: u16, message: String },

    #[error("asset lookup response could not be decoded: {0}")]
    AssetDecode(String),

    #[error("asset download failed: {0}")]
    AssetDownload(String),

    #[error("invalid asset reference: {0:?}")]
    InvalidReference(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("malformed dataset {path} at line {line}: {message}")]
    DatasetFormat {
        path: String,
        line: usize,
        message: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("setup failed: {0}")]
    #[diagnostic(help("check that the asset directory and dataset location are writable"))]
    Setup(String),

    #[error("failed to persist dataset: {0}")]
    #[diagnostic(help("the previously persisted dataset was left untouched"))]
    Persist(String),
}

impl HarvestError {
    /// Only transport failures on the metadata lookup are worth another attempt;
    /// a status answer from the server is taken as final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarvestError::AssetHttp(_))
    }
}
