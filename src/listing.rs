use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{ListingKey, ListingRow, RecordId};
use crate::error::HarvestError;
use crate::fetcher::Sleeper;

pub trait ListingClient: Send + Sync {
    /// Raw listing document for one key.
    fn fetch_listing(&self, key: &ListingKey) -> Result<String, HarvestError>;
}

#[derive(Clone)]
pub struct ListingHttpClient {
    client: Client,
    base_url: String,
}

impl ListingHttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("lexicon-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::ListingHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::ListingHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn listing_url(&self, key: &ListingKey) -> String {
        format!("{}{}", self.base_url, key.as_str())
    }
}

impl ListingClient for ListingHttpClient {
    fn fetch_listing(&self, key: &ListingKey) -> Result<String, HarvestError> {
        let response = self
            .client
            .get(self.listing_url(key))
            .send()
            .map_err(|err| HarvestError::ListingHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "listing request failed".to_string());
            return Err(HarvestError::ListingStatus { status, message });
        }
        let bytes = response
            .bytes()
            .map_err(|err| HarvestError::ListingHttp(err.to_string()))?;
        Ok(decode_document(&bytes))
    }
}

/// Listing pages are UTF-8 when they can be; anything else is read as
/// ISO-8859-1, which maps every byte to a char.
pub fn decode_document(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("listing document is not UTF-8, decoding as latin-1");
            bytes.iter().map(|&byte| char::from(byte)).collect()
        }
    }
}

/// Pulls catalog rows out of a listing page: every `<tr>` whose class list
/// contains the marker, keyed by its `id` attribute, with cells 0 and 2 as
/// label and definition.
#[derive(Debug, Clone)]
pub struct ListingParser {
    marker: String,
}

impl ListingParser {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn parse(&self, document: &str) -> Result<Vec<ListingRow>, HarvestError> {
        if !document.trim().is_empty() && !document.contains('<') {
            return Err(HarvestError::ListingParse(
                "document contains no markup".to_string(),
            ));
        }

        let mut rows = Vec::new();
        for captures in row_re().captures_iter(document) {
            let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let body = captures.get(2).map(|m| m.as_str()).unwrap_or_default();

            let has_marker = attribute(class_re(), attrs)
                .map(|classes| classes.split_whitespace().any(|class| class == self.marker))
                .unwrap_or(false);
            if !has_marker {
                continue;
            }
            let Some(raw_id) = attribute(id_re(), attrs) else {
                continue;
            };
            let id: RecordId = match decode_entities(&raw_id).parse() {
                Ok(id) => id,
                Err(err) => {
                    debug!("skipping listing row: {err}");
                    continue;
                }
            };

            let cells: Vec<String> = cell_re()
                .captures_iter(body)
                .map(|cell| cell_text(cell.get(1).map(|m| m.as_str()).unwrap_or_default()))
                .collect();
            if cells.len() < 3 {
                debug!("skipping listing row {id}: only {} cells", cells.len());
                continue;
            }

            rows.push(ListingRow {
                id,
                label: cells[0].clone(),
                definition: cells[2].clone(),
            });
        }
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct ListingOutcome {
    pub rows: BTreeMap<RecordId, ListingRow>,
    pub keys_ok: usize,
    pub keys_failed: Vec<String>,
}

pub struct Lister<'a, L: ListingClient> {
    client: &'a L,
    parser: ListingParser,
    delay: Duration,
    sleeper: Sleeper,
}

impl<'a, L: ListingClient> Lister<'a, L> {
    pub fn new(client: &'a L, parser: ListingParser, delay: Duration) -> Self {
        Self {
            client,
            parser,
            delay,
            sleeper: Arc::new(thread::sleep),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn fetch_rows(&self, key: &ListingKey) -> Result<Vec<ListingRow>, HarvestError> {
        let document = self.client.fetch_listing(key)?;
        self.parser.parse(&document)
    }

    /// Walks the key space in order, pausing between requests. A key that
    /// fails contributes nothing; a later key overwrites rows with the same id.
    pub fn collect(&self, keys: &[ListingKey], sink: &dyn ProgressSink) -> ListingOutcome {
        let mut outcome = ListingOutcome::default();
        for (index, key) in keys.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                (self.sleeper)(self.delay);
            }
            match self.fetch_rows(key) {
                Ok(rows) => {
                    let count = rows.len();
                    for row in rows {
                        outcome.rows.insert(row.id.clone(), row);
                    }
                    outcome.keys_ok += 1;
                    debug!("key {key}: {count} rows");
                    sink.event(ProgressEvent {
                        message: format!("key.ok key={key} rows={count} done={}/{}", index + 1, keys.len()),
                        elapsed: None,
                    });
                }
                Err(err) => {
                    warn!("skipping key {key}: {err}");
                    outcome.keys_failed.push(key.to_string());
                    sink.event(ProgressEvent {
                        message: format!("key.failed key={key} done={}/{}", index + 1, keys.len()),
                        elapsed: None,
                    });
                }
            }
        }
        info!(
            "listing finished: {} ids from {} keys ({} failed)",
            outcome.rows.len(),
            outcome.keys_ok,
            outcome.keys_failed.len()
        );
        outcome
    }
}

fn row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<tr\b([^>]*)>(.*?)</tr\s*>").expect("row pattern"))
}

fn cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<td\b[^>]*>(.*?)</td\s*>").expect("cell pattern"))
}

fn class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|\s)class\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#)
            .expect("class pattern")
    })
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|\s)id\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#)
            .expect("id pattern")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern"))
}

fn attribute(re: &Regex, attrs: &str) -> Option<String> {
    let captures = re.captures(attrs)?;
    (1..=3)
        .find_map(|group| captures.get(group))
        .map(|m| m.as_str().to_string())
}

fn cell_text(inner: &str) -> String {
    let stripped = tag_re().replace_all(inner, "");
    decode_entities(&stripped).trim().to_string()
}

pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &candidate[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|ch| (ch, end))
        });
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
