use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::{Record, RecordId};
use crate::error::HarvestError;

/// Directory of downloaded assets, one file per record id.
///
/// A non-empty file is a cache hit no matter what it contains; nothing here
/// ever re-validates an asset once it is on disk.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: Utf8PathBuf,
    extension: String,
    known: HashMap<RecordId, String>,
}

impl AssetStore {
    pub fn new(root: impl Into<Utf8PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            known: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Remembers the asset names a previous run recorded, so those ids are
    /// found again without asking the network what they are called.
    pub fn seed<'a>(&mut self, records: impl IntoIterator<Item = &'a Record>) -> usize {
        let mut seeded = 0;
        for record in records {
            if let Some(asset) = record.asset.as_deref().filter(|name| is_plain_file_name(name)) {
                self.known.insert(record.id.clone(), asset.to_string());
                seeded += 1;
            }
        }
        seeded
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path()).map_err(|err| {
            HarvestError::Setup(format!("create asset directory {}: {err}", self.root))
        })
    }

    /// Default on-disk name for an id that has no recorded asset name.
    pub fn default_file_name(&self, id: &RecordId) -> String {
        format!("{id}.{}", self.extension)
    }

    pub fn path_for(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join(file_name)
    }

    pub fn exists(&self, id: &RecordId) -> bool {
        self.cached_file(id).is_some()
    }

    /// The file name that satisfies `id` from disk, if any.
    pub fn cached_file(&self, id: &RecordId) -> Option<String> {
        let recorded = self.known.get(id).cloned();
        let fallback = Some(self.default_file_name(id));
        [recorded, fallback]
            .into_iter()
            .flatten()
            .find(|name| self.has_file(name))
    }

    pub fn has_file(&self, file_name: &str) -> bool {
        fs::metadata(self.path_for(file_name).as_std_path())
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    /// Streams `content` into a temporary file next to the target and renames
    /// it into place, so a torn download never shows up under `file_name`.
    pub fn save(&self, file_name: &str, content: &mut dyn Read) -> Result<Utf8PathBuf, HarvestError> {
        if !is_plain_file_name(file_name) {
            return Err(HarvestError::InvalidReference(file_name.to_string()));
        }
        let target = self.path_for(file_name);
        let mut temp = Builder::new()
            .prefix(".asset-")
            .suffix(".part")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("create temp asset in {}: {err}", self.root)))?;
        let written = io::copy(content, temp.as_file_mut())
            .map_err(|err| HarvestError::AssetDownload(format!("write {file_name}: {err}")))?;
        if written == 0 {
            return Err(HarvestError::AssetDownload(format!(
                "empty body for {file_name}"
            )));
        }
        temp.as_file_mut()
            .flush()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(target.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("persist {target}: {}", err.error)))?;
        Ok(target)
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|ch| ch == '/' || ch == '\\' || ch.is_control())
}
