#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;

use lexicon_harvest::config::ResolvedConfig;
use lexicon_harvest::domain::{AssetReference, ListingKey, RecordId};
use lexicon_harvest::error::HarvestError;
use lexicon_harvest::fetcher::{AssetClient, Sleeper};
use lexicon_harvest::listing::ListingClient;

pub fn page(rows: &[(&str, &str, &str)]) -> String {
    let mut html = String::from("<html><body><table>\n");
    html.push_str("<tr class=\"entete\"><td>Signe</td><td></td><td>Definition</td></tr>\n");
    for (id, label, definition) in rows {
        html.push_str(&format!(
            "<tr class=\"vocabulaire\" id=\"{id}\"><td> {label} </td><td><img src=\"v.png\"></td><td>{definition}</td></tr>\n"
        ));
    }
    html.push_str("</table></body></html>");
    html
}

#[derive(Default)]
pub struct MockListing {
    pages: HashMap<String, Result<String, u16>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockListing {
    pub fn with_page(mut self, key: &str, rows: &[(&str, &str, &str)]) -> Self {
        self.pages.insert(key.to_string(), Ok(page(rows)));
        self
    }

    pub fn with_status(mut self, key: &str, status: u16) -> Self {
        self.pages.insert(key.to_string(), Err(status));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ListingClient for MockListing {
    fn fetch_listing(&self, key: &ListingKey) -> Result<String, HarvestError> {
        self.calls.lock().unwrap().push(key.to_string());
        match self.pages.get(key.as_str()) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(HarvestError::ListingStatus {
                status: *status,
                message: "mock".to_string(),
            }),
            None => Ok("<html><body><table></table></body></html>".to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Lookup {
    Url(&'static str),
    Status(u16),
    Transport,
    Garbage,
}

#[derive(Default)]
pub struct MockAssets {
    lookups: Mutex<HashMap<String, VecDeque<Lookup>>>,
    bodies: HashMap<String, Vec<u8>>,
    pub lookup_calls: Mutex<Vec<String>>,
    pub download_calls: Mutex<Vec<String>>,
}

impl MockAssets {
    /// Queue of lookup answers for `id`; the last one repeats once the queue
    /// is down to a single entry.
    pub fn with_lookups(self, id: &str, answers: Vec<Lookup>) -> Self {
        self.lookups
            .lock()
            .unwrap()
            .insert(id.to_string(), answers.into());
        self
    }

    pub fn with_body(mut self, reference: &str, body: &[u8]) -> Self {
        self.bodies.insert(reference.to_string(), body.to_vec());
        self
    }

    pub fn lookups_for(&self, id: &str) -> usize {
        self.lookup_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == id)
            .count()
    }

    pub fn network_calls(&self) -> usize {
        self.lookup_calls.lock().unwrap().len() + self.download_calls.lock().unwrap().len()
    }
}

impl AssetClient for MockAssets {
    fn fetch_reference(&self, id: &RecordId) -> Result<AssetReference, HarvestError> {
        self.lookup_calls.lock().unwrap().push(id.to_string());
        let answer = {
            let mut lookups = self.lookups.lock().unwrap();
            match lookups.get_mut(id.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match answer {
            Some(Lookup::Url(url)) => url.parse(),
            Some(Lookup::Status(status)) => Err(HarvestError::AssetStatus {
                status,
                message: "mock".to_string(),
            }),
            Some(Lookup::Transport) => Err(HarvestError::AssetHttp("connection refused".to_string())),
            Some(Lookup::Garbage) => Err(HarvestError::AssetDecode("expected value".to_string())),
            None => Err(HarvestError::AssetStatus {
                status: 404,
                message: "unknown id".to_string(),
            }),
        }
    }

    fn open_asset(&self, reference: &AssetReference) -> Result<Box<dyn Read + Send>, HarvestError> {
        self.download_calls.lock().unwrap().push(reference.to_string());
        match self.bodies.get(reference.as_str()) {
            Some(body) => Ok(Box::new(std::io::Cursor::new(body.clone()))),
            None => Err(HarvestError::AssetDownload(format!("{reference}: status 404"))),
        }
    }
}

pub fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&delays);
    let sleeper: Sleeper = Arc::new(move |delay| recorded.lock().unwrap().push(delay));
    (sleeper, delays)
}

pub fn test_config(root: &Path, keys: &str) -> ResolvedConfig {
    let root = Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap();
    ResolvedConfig {
        keys: ListingKey::space(keys),
        listing_delay: Duration::ZERO,
        launch_delay: Duration::ZERO,
        workers: 4,
        asset_dir: root.join("gif"),
        dataset: root.join("output.csv"),
        ..ResolvedConfig::default()
    }
}
