//! Payload extraction into the sharded output tree.
//!
//! Every member name is checked before anything touches the filesystem:
//! absolute paths, drive prefixes and `..` components are refused so an
//! archive can never write outside the payload root.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::bounds::{parse_item_id, validate_id};
use crate::error::{Error, Result};

/// Largest payload read into memory from one member.
pub const MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Returns true if an archive member name is safe to extract.
///
/// Both `/` and `\` are treated as separators.
#[must_use]
pub fn is_safe_member_path(name: &str) -> bool {
    if name.is_empty() || name.starts_with(['/', '\\']) || name.contains('\0') {
        return false;
    }

    let components: Vec<&str> = name.split(['/', '\\']).collect();
    let last = components.len() - 1;
    for (i, component) in components.iter().enumerate() {
        match *component {
            // A trailing separator marks a directory entry.
            "" if i == last && i > 0 => {}
            "" | "." | ".." => return false,
            c if i == 0 && has_drive_prefix(c) => return false,
            _ => {}
        }
    }
    true
}

/// `C:`-style drive designator.
fn has_drive_prefix(component: &str) -> bool {
    let bytes = component.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Two-level shard directory for an item: thousands range, then hundreds range.
///
/// `160` lands in `0-999/100-199`, `1_234_567` in
/// `1234000-1234999/1234500-1234599`.
#[must_use]
pub fn shard_path(id: u64) -> PathBuf {
    let thousands = (id / 1000) * 1000;
    let hundreds = (id / 100) * 100;
    PathBuf::from(format!("{}-{}", thousands, thousands + 999))
        .join(format!("{}-{}", hundreds, hundreds + 99))
}

/// Describes which members are payloads and how they are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadKind {
    /// Member extension, compared case-insensitively.
    pub extension: &'static str,
    /// Leading bytes every payload must start with.
    pub magic: &'static [u8],
    /// Output file name prefix before the identifier.
    pub prefix: &'static str,
}

impl PayloadKind {
    /// PDF documents stored as `PMC<id>.pdf`.
    #[must_use]
    pub const fn pdf() -> Self {
        Self {
            extension: "pdf",
            magic: b"%PDF-",
            prefix: "PMC",
        }
    }

    fn matches_extension(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(self.extension))
    }

    /// Output file name for an item.
    #[must_use]
    pub fn file_name(&self, id: u64) -> String {
        format!("{}{}.{}", self.prefix, id, self.extension)
    }
}

impl Default for PayloadKind {
    fn default() -> Self {
        Self::pdf()
    }
}

/// Per-archive extraction counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractReport {
    /// `newly_extracted + already_present`.
    pub payloads: u64,
    pub newly_extracted: u64,
    pub already_present: u64,
    /// Members refused by the path check.
    pub unsafe_members: u64,
    /// Members skipped for a bad identifier, size or magic bytes.
    pub rejected_members: u64,
}

/// Writes payloads from package archives into the sharded tree.
#[derive(Debug, Clone)]
pub struct Extractor {
    payload_root: PathBuf,
    kind: PayloadKind,
}

impl Extractor {
    #[must_use]
    pub fn new(payload_root: impl Into<PathBuf>, kind: PayloadKind) -> Self {
        Self {
            payload_root: payload_root.into(),
            kind,
        }
    }

    /// Root of the sharded payload tree.
    #[must_use]
    pub fn payload_root(&self) -> &Path {
        &self.payload_root
    }

    /// Where the payload for `id` lives (whether or not it exists yet).
    #[must_use]
    pub fn payload_path(&self, id: u64) -> PathBuf {
        self.payload_root
            .join(shard_path(id))
            .join(self.kind.file_name(id))
    }

    /// Extracts every valid payload from `archive`.
    ///
    /// Payloads already on disk are counted and left untouched. Unsafe or
    /// malformed members are skipped; they never abort the archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be opened or a payload cannot
    /// be written.
    pub fn extract(&self, archive: &Path) -> Result<ExtractReport> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(file)?;
        let mut report = ExtractReport::default();
        let mut unsafe_names = Vec::new();
        let mut seen_ids = HashSet::new();

        for index in 0..zip.len() {
            let mut member = zip.by_index(index)?;
            let name = member.name().to_string();

            if !is_safe_member_path(&name) || member.enclosed_name().is_none() {
                report.unsafe_members += 1;
                unsafe_names.push(name);
                continue;
            }
            if member.is_dir() || !self.kind.matches_extension(&name) {
                continue;
            }

            let Some(id) = parse_item_id(&name).and_then(|id| validate_id(id).ok()) else {
                log::debug!("{}: no valid identifier in member {name}", archive.display());
                report.rejected_members += 1;
                continue;
            };
            if !seen_ids.insert(id) {
                log::debug!("{}: duplicate payload {id} in member {name}", archive.display());
                report.rejected_members += 1;
                continue;
            }

            let dest = self.payload_path(id);
            if dest.exists() {
                report.already_present += 1;
                continue;
            }

            if member.size() > MAX_PAYLOAD_BYTES {
                log::debug!("{}: member {name} exceeds size limit", archive.display());
                report.rejected_members += 1;
                continue;
            }

            let mut contents = Vec::new();
            member
                .by_ref()
                .take(MAX_PAYLOAD_BYTES + 1)
                .read_to_end(&mut contents)
                .map_err(|e| Error::CorruptArchive {
                    path: archive.display().to_string(),
                    reason: format!("{name}: {e}"),
                })?;
            if contents.len() as u64 > MAX_PAYLOAD_BYTES || !contents.starts_with(self.kind.magic)
            {
                log::debug!("{}: member {name} is not a valid payload", archive.display());
                report.rejected_members += 1;
                continue;
            }

            write_payload(&dest, &contents)?;
            report.newly_extracted += 1;
        }

        if !unsafe_names.is_empty() {
            log::warn!(
                "{}: skipped {} unsafe member path(s): {}",
                archive.display(),
                unsafe_names.len(),
                unsafe_names.join(", ")
            );
        }

        report.payloads = report.newly_extracted + report.already_present;
        Ok(report)
    }
}

/// Writes `contents` to `dest` via a `.part` sibling and rename.
fn write_payload(dest: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut part_name = dest.file_name().unwrap_or_default().to_os_string();
    part_name.push(".part");
    let part = dest.with_file_name(part_name);
    fs::write(&part, contents)?;
    fs::rename(&part, dest)?;
    Ok(())
}
