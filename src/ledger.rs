//! Persistent package ledger for resume support.
//!
//! The ledger records every package the catalog scan has ever seen plus
//! aggregate progress counters. It is the single source of truth for the
//! download → verify → extract pipeline and is rewritten atomically after
//! every state transition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Most recent error messages kept in the ledger.
pub const MAX_ERRORS: usize = 100;

/// Position of a package in the acquisition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PackageStage {
    /// Seen in the catalog, not yet on disk.
    Discovered,
    /// Archive on disk, not yet verified.
    Downloaded,
    /// Archive passed the integrity check.
    Verified,
    /// Payloads extracted.
    Extracted,
}

/// One remote archive and its local status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageRecord {
    pub filename: String,
    pub item_id_start: u64,
    pub item_id_end: u64,
    pub size_bytes: u64,
    pub source_url: String,
    pub downloaded: bool,
    pub verified: bool,
    pub extracted: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub payload_count: u64,
}

impl PackageRecord {
    /// Creates a freshly discovered record.
    #[must_use]
    pub fn discovered(
        filename: impl Into<String>,
        item_id_start: u64,
        item_id_end: u64,
        size_bytes: u64,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            item_id_start,
            item_id_end,
            size_bytes,
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    /// Returns the furthest stage this record has reached.
    #[must_use]
    pub const fn stage(&self) -> PackageStage {
        if self.extracted {
            PackageStage::Extracted
        } else if self.verified {
            PackageStage::Verified
        } else if self.downloaded {
            PackageStage::Downloaded
        } else {
            PackageStage::Discovered
        }
    }

    /// Returns true if the record covers `id`.
    #[must_use]
    pub const fn covers(&self, id: u64) -> bool {
        self.item_id_start <= id && id <= self.item_id_end
    }

    /// Checks the status-flag implications.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        (!self.verified || self.downloaded)
            && (!self.extracted || self.verified)
            && (self.payload_count == 0 || self.extracted)
            && self.item_id_start <= self.item_id_end
    }

    /// Repairs flag implications left broken by a hand-edited or partial file.
    fn normalize(&mut self) {
        if !self.downloaded {
            self.verified = false;
            self.downloaded_at = None;
        }
        if !self.verified {
            self.extracted = false;
        }
        if !self.extracted {
            self.payload_count = 0;
        }
    }
}

/// Aggregate counters over all packages, persisted with the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressLedger {
    pub total_packages: u64,
    pub downloaded_packages: u64,
    pub verified_packages: u64,
    pub extracted_packages: u64,
    pub total_payloads: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub errors: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

/// The counters one record contributes to [`ProgressLedger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Contribution {
    packages: u64,
    downloaded: u64,
    verified: u64,
    extracted: u64,
    payloads: u64,
    bytes: u64,
    downloaded_bytes: u64,
}

impl Contribution {
    fn of(record: &PackageRecord) -> Self {
        Self {
            packages: 1,
            downloaded: u64::from(record.downloaded),
            verified: u64::from(record.verified),
            extracted: u64::from(record.extracted),
            payloads: record.payload_count,
            bytes: record.size_bytes,
            downloaded_bytes: if record.downloaded {
                record.size_bytes
            } else {
                0
            },
        }
    }
}

impl ProgressLedger {
    fn add(&mut self, c: Contribution) {
        self.total_packages += c.packages;
        self.downloaded_packages += c.downloaded;
        self.verified_packages += c.verified;
        self.extracted_packages += c.extracted;
        self.total_payloads += c.payloads;
        self.total_bytes += c.bytes;
        self.downloaded_bytes += c.downloaded_bytes;
    }

    fn subtract(&mut self, c: Contribution) {
        self.total_packages = self.total_packages.saturating_sub(c.packages);
        self.downloaded_packages = self.downloaded_packages.saturating_sub(c.downloaded);
        self.verified_packages = self.verified_packages.saturating_sub(c.verified);
        self.extracted_packages = self.extracted_packages.saturating_sub(c.extracted);
        self.total_payloads = self.total_payloads.saturating_sub(c.payloads);
        self.total_bytes = self.total_bytes.saturating_sub(c.bytes);
        self.downloaded_bytes = self.downloaded_bytes.saturating_sub(c.downloaded_bytes);
    }

    /// Returns true if the counters (not errors or timestamps) match `other`.
    #[must_use]
    pub const fn counters_eq(&self, other: &Self) -> bool {
        self.total_packages == other.total_packages
            && self.downloaded_packages == other.downloaded_packages
            && self.verified_packages == other.verified_packages
            && self.extracted_packages == other.extracted_packages
            && self.total_payloads == other.total_payloads
            && self.total_bytes == other.total_bytes
            && self.downloaded_bytes == other.downloaded_bytes
    }
}

/// On-disk shape of the ledger.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct LedgerFile {
    packages: BTreeMap<String, PackageRecord>,
    progress: ProgressLedger,
}

/// Persistent record of every known package and aggregate progress.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    packages: BTreeMap<String, PackageRecord>,
    progress: ProgressLedger,
    path: PathBuf,
}

impl PartialEq for Ledger {
    fn eq(&self, other: &Self) -> bool {
        self.packages == other.packages && self.progress == other.progress
    }
}

impl Ledger {
    /// Creates an empty ledger bound to `path` without touching the disk.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Loads the ledger at `path`, best-effort.
    ///
    /// A missing file yields an empty ledger. A file that does not parse as a
    /// whole is salvaged package by package; if even that fails it is moved
    /// aside to `<name>.corrupt` and an empty ledger is returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if an existing file cannot be read or moved aside.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new(path)),
            Err(e) => return Err(e.into()),
        };

        let file = match serde_json::from_str::<LedgerFile>(&contents) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("State file {} is damaged ({e}), salvaging", path.display());
                match salvage(&contents) {
                    Some(file) => file,
                    None => {
                        let backup = corrupt_backup_path(&path);
                        std::fs::rename(&path, &backup)?;
                        log::warn!(
                            "Could not salvage state file; moved to {} and starting fresh",
                            backup.display()
                        );
                        LedgerFile::default()
                    }
                }
            }
        };

        let mut ledger = Self {
            packages: BTreeMap::new(),
            progress: file.progress,
            path,
        };
        for (key, mut record) in file.packages {
            if record.filename.is_empty() {
                record.filename.clone_from(&key);
            }
            record.normalize();
            ledger.packages.insert(key, record);
        }

        let recomputed = ledger.recomputed();
        if !ledger.progress.counters_eq(&recomputed) {
            log::warn!("Persisted progress counters disagree with packages; recomputing");
            ledger.progress = ProgressLedger {
                errors: std::mem::take(&mut ledger.progress.errors),
                start_time: ledger.progress.start_time,
                last_update: ledger.progress.last_update,
                ..recomputed
            };
        }
        if ledger.progress.errors.len() > MAX_ERRORS {
            let excess = ledger.progress.errors.len() - MAX_ERRORS;
            ledger.progress.errors.drain(..excess);
        }
        Ok(ledger)
    }

    /// Saves the ledger atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.progress.last_update = Some(Utc::now());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = LedgerFileRef {
            packages: &self.packages,
            progress: &self.progress,
        };
        let json = serde_json::to_string_pretty(&file)?;

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Path of the backing state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Aggregate counters.
    #[must_use]
    pub const fn progress(&self) -> &ProgressLedger {
        &self.progress
    }

    /// Looks up a package by filename.
    #[must_use]
    pub fn get(&self, filename: &str) -> Option<&PackageRecord> {
        self.packages.get(filename)
    }

    /// Iterates all packages in filename order.
    pub fn packages(&self) -> impl Iterator<Item = &PackageRecord> {
        self.packages.values()
    }

    /// Number of known packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns true if no package has been discovered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Packages currently at `stage`, in filename order.
    #[must_use]
    pub fn at_stage(&self, stage: PackageStage) -> Vec<PackageRecord> {
        self.packages
            .values()
            .filter(|r| r.stage() == stage)
            .cloned()
            .collect()
    }

    /// Merges a discovered record by filename.
    ///
    /// New filenames are inserted as-is. For known filenames only a
    /// previously unknown size or source URL is filled in; status flags are
    /// never touched. Returns true if the filename was new.
    pub fn merge_discovered(&mut self, record: PackageRecord) -> bool {
        if let Some(existing) = self.packages.get(&record.filename) {
            let needs_size = existing.size_bytes == 0 && record.size_bytes > 0;
            let needs_url = existing.source_url.is_empty() && !record.source_url.is_empty();
            if needs_size || needs_url {
                self.update(&record.filename, |r| {
                    if needs_size {
                        r.size_bytes = record.size_bytes;
                    }
                    if needs_url {
                        r.source_url.clone_from(&record.source_url);
                    }
                });
            }
            return false;
        }

        let mut record = record;
        record.downloaded = false;
        record.verified = false;
        record.extracted = false;
        record.downloaded_at = None;
        record.payload_count = 0;
        self.progress.add(Contribution::of(&record));
        self.packages.insert(record.filename.clone(), record);
        true
    }

    /// Applies `mutate` to one record and adjusts the counters by the delta.
    fn update(&mut self, filename: &str, mutate: impl FnOnce(&mut PackageRecord)) -> bool {
        let Some(record) = self.packages.get_mut(filename) else {
            log::debug!("Ignoring update for unknown package {filename}");
            return false;
        };
        let before = Contribution::of(record);
        mutate(record);
        record.normalize();
        let after = Contribution::of(record);
        self.progress.subtract(before);
        self.progress.add(after);
        true
    }

    /// Records a completed download of `bytes` bytes.
    pub fn mark_downloaded(&mut self, filename: &str, bytes: u64, at: DateTime<Utc>) -> bool {
        self.update(filename, |r| {
            r.downloaded = true;
            r.downloaded_at = Some(at);
            if bytes > 0 {
                r.size_bytes = bytes;
            }
        })
    }

    /// Records a passed integrity check.
    pub fn mark_verified(&mut self, filename: &str) -> bool {
        self.update(filename, |r| {
            if r.downloaded {
                r.verified = true;
            }
        })
    }

    /// Records an extraction result; `extracted` follows `payload_count > 0`.
    pub fn mark_extracted(&mut self, filename: &str, payload_count: u64) -> bool {
        self.update(filename, |r| {
            if r.verified {
                r.extracted = payload_count > 0;
                r.payload_count = payload_count;
            }
        })
    }

    /// Sends a package back to `Discovered` (corrupt or missing archive).
    pub fn revert_to_discovered(&mut self, filename: &str) -> bool {
        self.update(filename, |r| {
            r.downloaded = false;
        })
    }

    /// Appends an error message, keeping only the most recent [`MAX_ERRORS`].
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = format!("{} {}", Utc::now().to_rfc3339(), message.into());
        self.progress.errors.push(message);
        if self.progress.errors.len() > MAX_ERRORS {
            let excess = self.progress.errors.len() - MAX_ERRORS;
            self.progress.errors.drain(..excess);
        }
    }

    /// Sets the batch start time if this is the first batch.
    pub fn start_clock(&mut self, now: DateTime<Utc>) {
        if self.progress.start_time.is_none() {
            self.progress.start_time = Some(now);
        }
    }

    /// Recomputes the counters from scratch over the package set.
    ///
    /// Errors and timestamps are left empty.
    #[must_use]
    pub fn recomputed(&self) -> ProgressLedger {
        let mut progress = ProgressLedger::default();
        for record in self.packages.values() {
            progress.add(Contribution::of(record));
        }
        progress
    }
}

/// Borrowing twin of [`LedgerFile`] so saving does not clone the map.
#[derive(Serialize)]
struct LedgerFileRef<'a> {
    packages: &'a BTreeMap<String, PackageRecord>,
    progress: &'a ProgressLedger,
}

/// Recovers whatever packages still parse from a damaged state file.
fn salvage(contents: &str) -> Option<LedgerFile> {
    let value: serde_json::Value = serde_json::from_str(contents).ok()?;
    let object = value.as_object()?;

    let mut file = LedgerFile::default();
    if let Some(packages) = object.get("packages").and_then(|p| p.as_object()) {
        for (key, entry) in packages {
            match serde_json::from_value::<PackageRecord>(entry.clone()) {
                Ok(record) => {
                    file.packages.insert(key.clone(), record);
                }
                Err(e) => log::warn!("Dropping unreadable ledger entry {key}: {e}"),
            }
        }
    }
    if let Some(progress) = object.get("progress") {
        file.progress = serde_json::from_value(progress.clone()).unwrap_or_default();
    }
    Some(file)
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}
