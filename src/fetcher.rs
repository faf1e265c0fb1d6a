use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::config::{Endpoints, RetryPolicy};
use crate::domain::{AssetReference, RecordId};
use crate::error::HarvestError;
use crate::store::AssetStore;

pub trait AssetClient: Send + Sync {
    /// One metadata lookup; the caller owns retrying.
    fn fetch_reference(&self, id: &RecordId) -> Result<AssetReference, HarvestError>;
    fn open_asset(&self, reference: &AssetReference) -> Result<Box<dyn Read + Send>, HarvestError>;
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    url: String,
}

#[derive(Clone)]
pub struct AssetHttpClient {
    client: Client,
    lookup_url: String,
    asset_base_url: String,
}

impl AssetHttpClient {
    pub fn new(endpoints: &Endpoints, timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("lexicon-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::AssetRequest(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::AssetRequest(err.to_string()))?;
        Ok(Self {
            client,
            lookup_url: endpoints.lookup_url.clone(),
            asset_base_url: endpoints.asset_base_url.clone(),
        })
    }

    pub fn lookup_url(&self, id: &RecordId) -> String {
        format!("{}{}", self.lookup_url, id.as_str())
    }

    pub fn asset_url(&self, reference: &AssetReference) -> String {
        format!("{}{}", self.asset_base_url, reference.as_str())
    }
}

impl AssetClient for AssetHttpClient {
    fn fetch_reference(&self, id: &RecordId) -> Result<AssetReference, HarvestError> {
        let response = self
            .client
            .get(self.lookup_url(id))
            .send()
            .map_err(classify_transport)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "asset lookup failed".to_string());
            return Err(HarvestError::AssetStatus { status, message });
        }
        let payload: LookupResponse = response
            .json()
            .map_err(|err| HarvestError::AssetDecode(err.to_string()))?;
        payload.url.parse()
    }

    fn open_asset(&self, reference: &AssetReference) -> Result<Box<dyn Read + Send>, HarvestError> {
        let url = self.asset_url(reference);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| HarvestError::AssetDownload(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            return Err(HarvestError::AssetDownload(format!(
                "{url}: status {}",
                response.status().as_u16()
            )));
        }
        Ok(Box::new(response))
    }
}

fn classify_transport(err: reqwest::Error) -> HarvestError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        HarvestError::AssetHttp(err.to_string())
    } else {
        HarvestError::AssetRequest(err.to_string())
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. `sleep` is called between attempts only.
pub fn retry_transport<T, F, S>(policy: &RetryPolicy, mut sleep: S, mut op: F) -> Result<(T, u32), HarvestError>
where
    F: FnMut(u32) -> Result<T, HarvestError>,
    S: FnMut(Duration),
{
    let mut attempt = 0u32;
    loop {
        match op(attempt) {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(err) if err.is_retryable() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(HarvestError::RetriesExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                let delay = policy.delay_after(attempt - 1);
                debug!("attempt {attempt} failed ({err}), retrying in {delay:?}");
                sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSource {
    /// Found on disk before any network call.
    Cached,
    /// The lookup named a file that was already on disk.
    ReferenceCached,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub file_name: String,
    pub source: AssetSource,
    /// Metadata lookups issued; zero on a cache hit.
    pub attempts: u32,
}

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Resolves one record's asset: local cache first, then the metadata lookup
/// (with backoff on transport failures), then the binary download.
pub struct Fetcher<'a, A: AssetClient> {
    client: &'a A,
    store: &'a AssetStore,
    policy: RetryPolicy,
    sleeper: Sleeper,
}

impl<'a, A: AssetClient> Fetcher<'a, A> {
    pub fn new(client: &'a A, store: &'a AssetStore, policy: RetryPolicy) -> Self {
        Self {
            client,
            store,
            policy,
            sleeper: Arc::new(thread::sleep),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn fetch(&self, id: &RecordId) -> Result<FetchedAsset, HarvestError> {
        if let Some(file_name) = self.store.cached_file(id) {
            debug!("cache hit for {id}: {file_name}");
            return Ok(FetchedAsset {
                file_name,
                source: AssetSource::Cached,
                attempts: 0,
            });
        }

        let sleeper = self.sleeper.clone();
        let (reference, attempts) = retry_transport(
            &self.policy,
            |delay| sleeper(delay),
            |_| self.client.fetch_reference(id),
        )?;
        let file_name = reference.file_name().to_string();

        if self.store.has_file(&file_name) {
            debug!("asset {file_name} for {id} already on disk");
            return Ok(FetchedAsset {
                file_name,
                source: AssetSource::ReferenceCached,
                attempts,
            });
        }

        let mut body = self.client.open_asset(&reference)?;
        let path: Utf8PathBuf = self.store.save(&file_name, &mut body)?;
        debug!("saved asset for {id} to {path}");
        Ok(FetchedAsset {
            file_name,
            source: AssetSource::Downloaded,
            attempts,
        })
    }
}
