use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8Path;
use tracing::warn;

use crate::dataset;
use crate::domain::{ListingRow, Record, RecordId};
use crate::error::HarvestError;

/// Owns the working set for one run. The set of ids is fixed at construction;
/// afterwards only the asset column changes, once per record.
#[derive(Debug, Default)]
pub struct DatasetMerger {
    records: Mutex<BTreeMap<RecordId, Record>>,
}

impl DatasetMerger {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn from_rows(rows: impl IntoIterator<Item = ListingRow>) -> Self {
        Self::new(rows.into_iter().map(Record::from))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordId, Record>> {
        // Writers only ever assign a single Option; the map stays consistent.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the asset for `id`. Returns `false` when `id` is unknown or
    /// already resolved; neither case changes the collection.
    pub fn resolve(&self, id: &RecordId, file_name: &str) -> bool {
        let mut records = self.lock();
        match records.get_mut(id) {
            Some(record) if record.asset.is_none() => {
                record.asset = Some(file_name.to_string());
                true
            }
            Some(record) => {
                warn!(
                    "ignoring second asset {file_name} for {id}, already {:?}",
                    record.asset
                );
                false
            }
            None => {
                warn!("ignoring asset {file_name} for unknown id {id}");
                false
            }
        }
    }

    /// Copies an asset name recorded by an earlier run, without counting as
    /// this run's resolution.
    pub fn carry_over(&self, previous: &[Record]) -> usize {
        let mut records = self.lock();
        let mut carried = 0;
        for old in previous {
            if let (Some(record), Some(asset)) = (records.get_mut(&old.id), old.asset.as_ref()) {
                if record.asset.is_none() {
                    record.asset = Some(asset.clone());
                    carried += 1;
                }
            }
        }
        carried
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.lock().keys().cloned().collect()
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Record> {
        self.lock().values().cloned().collect()
    }

    pub fn resolved_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|record| record.asset.is_some())
            .count()
    }

    /// Atomically replaces `path` with the current collection, ordered by id.
    pub fn persist(&self, path: &Utf8Path) -> Result<(), HarvestError> {
        let records = self.snapshot();
        dataset::persist_atomic(path, &records)
    }
}
