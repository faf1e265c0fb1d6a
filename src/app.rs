use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::dataset::{self, load_dataset};
use crate::domain::{Record, RecordId};
use crate::error::HarvestError;
use crate::fetcher::{AssetClient, AssetSource, FetchedAsset, Fetcher, Sleeper};
use crate::listing::{Lister, ListingClient, ListingParser};
use crate::merger::DatasetMerger;
use crate::store::AssetStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct HarvestOptions {
    /// Stop after the listing phase; asset columns only carry over from the
    /// previous dataset where the file is still on disk.
    pub skip_assets: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub dataset: String,
    pub asset_dir: String,
    pub keys_total: usize,
    pub keys_ok: usize,
    pub keys_failed: Vec<String>,
    pub records: usize,
    pub with_asset: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub retried: usize,
    pub failed: Vec<ItemFailure>,
    pub started_at: String,
    pub finished_at: String,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub dataset: String,
    pub records: usize,
    pub with_asset: usize,
    pub without_asset: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Harvest,
    List,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress to the log; used when nothing is drawing a UI.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        debug!("{}", event.message);
    }
}

#[derive(Debug, Default)]
struct DownloadStats {
    downloaded: usize,
    cached: usize,
    retried: usize,
    failed: Vec<ItemFailure>,
}

struct ItemOutcome {
    id: RecordId,
    result: Result<FetchedAsset, HarvestError>,
}

pub struct Harvester<L: ListingClient, A: AssetClient> {
    config: ResolvedConfig,
    listing: L,
    assets: A,
    sleeper: Sleeper,
}

impl<L: ListingClient, A: AssetClient> Harvester<L, A> {
    pub fn new(config: ResolvedConfig, listing: L, assets: A) -> Self {
        Self {
            config,
            listing,
            assets,
            sleeper: Arc::new(thread::sleep),
        }
    }

    /// Replaces the sleep used for listing and launch pacing and for retry
    /// backoff.
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn into_parts(self) -> (ResolvedConfig, L, A) {
        (self.config, self.listing, self.assets)
    }

    pub fn run(
        &self,
        options: HarvestOptions,
        sink: &dyn ProgressSink,
    ) -> Result<HarvestSummary, HarvestError> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let start = Instant::now();
        let dataset_path = self.config.dataset.as_path();

        sink.event(ProgressEvent {
            message: "phase=Setup; preparing directories".to_string(),
            elapsed: None,
        });
        let mut store = AssetStore::new(
            self.config.asset_dir.clone(),
            self.config.asset_extension.clone(),
        );
        if !options.skip_assets {
            store.ensure_root()?;
        }
        ensure_dataset_writable(dataset_path)?;

        let previous = self.previous_records(dataset_path);
        let seeded = store.seed(&previous);
        if seeded > 0 {
            debug!("seeded {seeded} asset names from {dataset_path}");
        }

        sink.event(ProgressEvent {
            message: format!("phase=Listing; {} keys", self.config.keys.len()),
            elapsed: Some(start.elapsed()),
        });
        let lister = Lister::new(
            &self.listing,
            ListingParser::new(self.config.row_marker.clone()),
            self.config.listing_delay,
        )
        .with_sleeper(self.sleeper.clone());
        let listing = lister.collect(&self.config.keys, sink);
        let keys_ok = listing.keys_ok;
        let keys_failed = listing.keys_failed;
        let merger = DatasetMerger::from_rows(listing.rows.into_values());
        info!("working set: {} records", merger.len());

        let mut stats = DownloadStats::default();
        if options.skip_assets {
            let still_on_disk: Vec<Record> = previous
                .into_iter()
                .filter(|record| {
                    record
                        .asset
                        .as_deref()
                        .map(|name| store.has_file(name))
                        .unwrap_or(false)
                })
                .collect();
            let carried = merger.carry_over(&still_on_disk);
            debug!("carried {carried} asset names over from the previous dataset");
        } else {
            if self.config.checkpoint_listing {
                sink.event(ProgressEvent {
                    message: "phase=Persist; listing checkpoint".to_string(),
                    elapsed: Some(start.elapsed()),
                });
                merger.persist(dataset_path)?;
            }
            sink.event(ProgressEvent {
                message: format!("phase=Download; {} records", merger.len()),
                elapsed: Some(start.elapsed()),
            });
            stats = self.download(&merger, &store, sink);
        }

        sink.event(ProgressEvent {
            message: format!("phase=Persist; writing {dataset_path}"),
            elapsed: Some(start.elapsed()),
        });
        merger.persist(dataset_path)?;
        info!("persisted {} records to {dataset_path}", merger.len());

        sink.event(ProgressEvent {
            message: "phase=Done; harvest complete".to_string(),
            elapsed: Some(start.elapsed()),
        });
        Ok(HarvestSummary {
            dataset: dataset_path.to_string(),
            asset_dir: self.config.asset_dir.to_string(),
            keys_total: self.config.keys.len(),
            keys_ok,
            keys_failed,
            records: merger.len(),
            with_asset: merger.resolved_count(),
            downloaded: stats.downloaded,
            cached: stats.cached,
            retried: stats.retried,
            failed: stats.failed,
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
            elapsed_ms: start.elapsed().as_millis(),
        })
    }

    fn previous_records(&self, path: &Utf8Path) -> Vec<Record> {
        match load_dataset(path) {
            Ok(records) => records,
            Err(HarvestError::DatasetNotFound(_)) => Vec::new(),
            Err(err) => {
                warn!("ignoring previous dataset: {err}");
                Vec::new()
            }
        }
    }

    /// Feeds every id through a pool of fetch workers, pacing job launches.
    /// Results come back over a channel and are applied here, so the merger
    /// only ever sees short, lock-held assignments.
    fn download(
        &self,
        merger: &DatasetMerger,
        store: &AssetStore,
        sink: &dyn ProgressSink,
    ) -> DownloadStats {
        let ids = merger.ids();
        let total = ids.len();
        let mut stats = DownloadStats::default();
        if total == 0 {
            return stats;
        }
        let workers = match self.config.workers {
            0 => total,
            n => n.min(total),
        };
        let fetcher = Fetcher::new(&self.assets, store, self.config.retry)
            .with_sleeper(self.sleeper.clone());
        let launch_delay = self.config.launch_delay;

        let (job_tx, job_rx) = mpsc::channel::<RecordId>();
        let job_rx = Mutex::new(job_rx);
        let (result_tx, result_rx) = mpsc::channel::<ItemOutcome>();
        let mut done = 0usize;

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = &job_rx;
                let fetcher = &fetcher;
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    loop {
                        let next = match job_rx.lock() {
                            Ok(rx) => rx.recv().ok(),
                            Err(_) => None,
                        };
                        let Some(id) = next else {
                            break;
                        };
                        let result = fetcher.fetch(&id);
                        if result_tx.send(ItemOutcome { id, result }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut apply = |outcome: ItemOutcome| {
                done += 1;
                apply_outcome(merger, &mut stats, outcome, done, total, sink);
            };

            for (index, id) in ids.into_iter().enumerate() {
                if index > 0 && !launch_delay.is_zero() {
                    (self.sleeper)(launch_delay);
                }
                if job_tx.send(id).is_err() {
                    warn!("download workers exited early; {} ids not launched", total - index);
                    break;
                }
                while let Ok(outcome) = result_rx.try_recv() {
                    apply(outcome);
                }
            }
            drop(job_tx);

            for outcome in result_rx.iter() {
                apply(outcome);
            }
        });

        info!(
            "downloads finished: {} downloaded, {} cached, {} failed",
            stats.downloaded,
            stats.cached,
            stats.failed.len()
        );
        stats
    }
}

fn apply_outcome(
    merger: &DatasetMerger,
    stats: &mut DownloadStats,
    outcome: ItemOutcome,
    done: usize,
    total: usize,
    sink: &dyn ProgressSink,
) {
    let ItemOutcome { id, result } = outcome;
    match result {
        Ok(asset) => {
            if asset.attempts > 1 {
                stats.retried += 1;
                sink.event(ProgressEvent {
                    message: format!("retry id={id} attempts={}", asset.attempts),
                    elapsed: None,
                });
            }
            let label = match asset.source {
                AssetSource::Cached | AssetSource::ReferenceCached => {
                    stats.cached += 1;
                    "item.cached"
                }
                AssetSource::Downloaded => {
                    stats.downloaded += 1;
                    "item.ok"
                }
            };
            merger.resolve(&id, &asset.file_name);
            sink.event(ProgressEvent {
                message: format!("{label} id={id} file={} done={done}/{total}", asset.file_name),
                elapsed: None,
            });
        }
        Err(err) => {
            warn!("no asset for {id}: {err}");
            if matches!(err, HarvestError::RetriesExhausted { .. }) {
                stats.retried += 1;
            }
            sink.event(ProgressEvent {
                message: format!("item.failed id={id} done={done}/{total}"),
                elapsed: None,
            });
            stats.failed.push(ItemFailure {
                id: id.to_string(),
                error: err.to_string(),
            });
        }
    }
}

/// Creates the dataset's directory and proves a file can be created there,
/// before any network traffic.
fn ensure_dataset_writable(path: &Utf8Path) -> Result<(), HarvestError> {
    let dir = dataset::dataset_dir(path);
    std::fs::create_dir_all(dir.as_std_path())
        .map_err(|err| HarvestError::Setup(format!("create dataset directory {dir}: {err}")))?;
    tempfile::Builder::new()
        .prefix(".dataset-probe-")
        .tempfile_in(dir.as_std_path())
        .map_err(|err| HarvestError::Setup(format!("dataset location {dir} is not writable: {err}")))?;
    Ok(())
}

pub fn inspect_dataset(path: &Utf8Path) -> Result<DatasetStats, HarvestError> {
    let records = load_dataset(path)?;
    let with_asset = records.iter().filter(|record| record.asset.is_some()).count();
    Ok(DatasetStats {
        dataset: path.to_string(),
        records: records.len(),
        with_asset,
        without_asset: records.len() - with_asset,
    })
}
