use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Catalog identifier. Doubles as a file stem in the asset directory, so it
/// never contains path separators or control characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized != "."
            && normalized != ".."
            && !normalized
                .chars()
                .any(|ch| ch == '/' || ch == '\\' || ch.is_control());
        if !is_valid {
            return Err(HarvestError::InvalidId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// One entry of the key space the listing phase walks through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey(String);

impl ListingKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits a key-space string into single-character keys, keeping order and
    /// dropping duplicates and whitespace.
    pub fn space(keys: &str) -> Vec<ListingKey> {
        let mut seen = Vec::new();
        for ch in keys.chars().filter(|ch| !ch.is_whitespace()) {
            let key = ListingKey(ch.to_string());
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
        seen
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row extracted from one listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub id: RecordId,
    pub label: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub id: RecordId,
    pub label: String,
    pub definition: String,
    pub asset: Option<String>,
}

impl Record {
    pub fn new(id: RecordId, label: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            definition: definition.into(),
            asset: None,
        }
    }
}

impl From<ListingRow> for Record {
    fn from(row: ListingRow) -> Self {
        Record::new(row.id, row.label, row.definition)
    }
}

/// Remote reference returned by the metadata lookup, relative to the asset base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    reference: String,
    file_name: String,
}

impl AssetReference {
    pub fn as_str(&self) -> &str {
        &self.reference
    }

    /// Last path segment of the reference; this is the name the asset is stored under.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl fmt::Display for AssetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reference)
    }
}

impl FromStr for AssetReference {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let reference = value.trim();
        let without_query = reference
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let file_name = without_query
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        let is_valid = !file_name.is_empty()
            && file_name != "."
            && file_name != ".."
            && !file_name.chars().any(|ch| ch.is_control());
        if !is_valid {
            return Err(HarvestError::InvalidReference(value.to_string()));
        }
        Ok(Self {
            reference: reference.to_string(),
            file_name: file_name.to_string(),
        })
    }
}
