//! Core domain model, record identity and snapshot differencing for jobwatch.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobwatch-core";

/// Number of hex characters kept from the identity digest.
pub const IDENTITY_KEY_LEN: usize = 16;

/// Textual fields of one job listing, as handed over by extraction.
///
/// Every field is always present; a value the page did not provide is an
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobListing {
    pub title: String,
    pub location: String,
    pub date: String,
    pub day_of_week: String,
    pub time_range: String,
    pub duration: String,
    pub wage: String,
    pub raw_text: String,
}

impl JobListing {
    /// Field-level comparison used for change detection. `raw_text` never
    /// participates.
    pub fn differs_from(&self, other: &JobListing) -> bool {
        self.title != other.title
            || self.location != other.location
            || self.date != other.date
            || self.day_of_week != other.day_of_week
            || self.time_range != other.time_range
            || self.duration != other.duration
            || self.wage != other.wage
    }
}

/// Content fingerprint of a listing; the primary key across cycles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Wraps an already-derived key, e.g. one read back from storage.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Canonical text the identity digest is computed over.
///
/// Title, location, date, weekday, time range and wage are joined with single
/// spaces, NBSPs become spaces, whitespace runs collapse and the ends are
/// trimmed. Duration and raw text are not part of identity. Changing this
/// function invalidates every stored key.
pub fn canonical_identity_text(listing: &JobListing) -> String {
    let joined = [
        listing.title.as_str(),
        listing.location.as_str(),
        listing.date.as_str(),
        listing.day_of_week.as_str(),
        listing.time_range.as_str(),
        listing.wage.as_str(),
    ]
    .join(" ")
    .replace('\u{a0}', " ");

    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First [`IDENTITY_KEY_LEN`] hex characters of the SHA-256 of the canonical text.
pub fn compute_identity(listing: &JobListing) -> IdentityKey {
    let digest = Sha256::digest(canonical_identity_text(listing).as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(IDENTITY_KEY_LEN);
    IdentityKey(hex)
}

/// One job listing plus its identity and store-managed sighting timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    key: IdentityKey,
    #[serde(flatten)]
    listing: JobListing,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Builds a freshly extracted record; the identity is derived here and
    /// never changes afterwards.
    pub fn new(listing: JobListing) -> Self {
        Self {
            key: compute_identity(&listing),
            listing,
            first_seen: None,
            last_seen: None,
        }
    }

    /// Rebuilds a record from persisted state, keeping the stored key as-is.
    pub fn restore(
        key: IdentityKey,
        listing: JobListing,
        first_seen: Option<DateTime<Utc>>,
        last_seen: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key,
            listing,
            first_seen,
            last_seen,
        }
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn listing(&self) -> &JobListing {
        &self.listing
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.first_seen
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn differs_from(&self, other: &JobRecord) -> bool {
        self.listing.differs_from(&other.listing)
    }
}

/// Identity key → current record. Repeated keys are last-write-wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    records: BTreeMap<IdentityKey, JobRecord>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts under the record's own key, returning the record it replaced.
    pub fn insert(&mut self, record: JobRecord) -> Option<JobRecord> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&JobRecord> {
        self.records.get(key)
    }

    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<JobRecord> {
        self.records.into_values().collect()
    }
}

impl FromIterator<JobRecord> for Snapshot {
    fn from_iter<I: IntoIterator<Item = JobRecord>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Added, ChangeKind::Removed, ChangeKind::Modified];

    /// Value persisted in the notification ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown change kind: {0}")]
pub struct ParseChangeKindError(String);

impl FromStr for ChangeKind {
    type Err = ParseChangeKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(ChangeKind::Added),
            "removed" => Ok(ChangeKind::Removed),
            "modified" => Ok(ChangeKind::Modified),
            other => Err(ParseChangeKindError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Change {
    Added(JobRecord),
    Removed(JobRecord),
    Modified { old: JobRecord, new: JobRecord },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Added(_) => ChangeKind::Added,
            Change::Removed(_) => ChangeKind::Removed,
            Change::Modified { .. } => ChangeKind::Modified,
        }
    }

    /// Ledger key of the change. Modified pairs are keyed on the new record.
    pub fn key(&self) -> &IdentityKey {
        match self {
            Change::Added(record) | Change::Removed(record) => record.key(),
            Change::Modified { new, .. } => new.key(),
        }
    }
}

/// Three disjoint change sets between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobDiff {
    pub added: Vec<JobRecord>,
    pub removed: Vec<JobRecord>,
    /// `(old, new)` pairs sharing a key.
    pub modified: Vec<(JobRecord, JobRecord)>,
}

impl JobDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn counts(&self) -> DiffCounts {
        DiffCounts {
            added: self.added.len(),
            removed: self.removed.len(),
            modified: self.modified.len(),
        }
    }

    /// Copy holding only the added records.
    pub fn added_only(&self) -> JobDiff {
        JobDiff {
            added: self.added.clone(),
            removed: Vec::new(),
            modified: Vec::new(),
        }
    }

    /// Flattened view, added then removed then modified.
    pub fn changes(&self) -> Vec<Change> {
        self.added
            .iter()
            .cloned()
            .map(Change::Added)
            .chain(self.removed.iter().cloned().map(Change::Removed))
            .chain(
                self.modified
                    .iter()
                    .cloned()
                    .map(|(old, new)| Change::Modified { old, new }),
            )
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffCounts {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl DiffCounts {
    pub fn total(&self) -> usize {
        self.added + self.removed + self.modified
    }
}

impl fmt::Display for DiffCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} added, -{} removed, ~{} modified",
            self.added, self.removed, self.modified
        )
    }
}

/// Compares two snapshots by key. Pure; output order follows key order and
/// carries no meaning.
pub fn compute_diff(old: &Snapshot, new: &Snapshot) -> JobDiff {
    let mut diff = JobDiff::default();

    for (key, record) in &new.records {
        match old.records.get(key) {
            None => diff.added.push(record.clone()),
            Some(previous) if previous.differs_from(record) => {
                diff.modified.push((previous.clone(), record.clone()))
            }
            Some(_) => {}
        }
    }

    for (key, record) in &old.records {
        if !new.records.contains_key(key) {
            diff.removed.push(record.clone());
        }
    }

    diff
}
