//! Structural integrity checks for downloaded archives.

use std::fs::File;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use crate::error::{Error, Result};

/// What a full pass over an archive found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveSummary {
    /// Number of entries, directories included.
    pub members: usize,
    /// Sum of decompressed bytes actually read.
    pub uncompressed_bytes: u64,
}

/// Reads every member of the archive at `path` to the end.
///
/// Reading to the end is what makes the zip reader compare the CRC-32 of
/// each member, so a truncated or bit-flipped archive fails here.
///
/// # Errors
///
/// Returns [`Error::CorruptArchive`] for an empty archive or a member that
/// fails to decompress, and [`Error::Io`] / [`Error::Archive`] when the file
/// cannot be opened or is not a ZIP at all.
pub fn inspect_archive(path: &Path) -> Result<ArchiveSummary> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;
    if archive.len() == 0 {
        return Err(Error::CorruptArchive {
            path: path.display().to_string(),
            reason: "archive has no members".to_string(),
        });
    }

    let mut summary = ArchiveSummary::default();
    for index in 0..archive.len() {
        let mut member = archive.by_index(index)?;
        let name = member.name().to_string();
        let read = io::copy(&mut member, &mut io::sink()).map_err(|e| Error::CorruptArchive {
            path: path.display().to_string(),
            reason: format!("{name}: {e}"),
        })?;
        summary.members += 1;
        summary.uncompressed_bytes += read;
    }
    Ok(summary)
}

/// Returns true if the archive at `path` opens, has members, and every
/// member decompresses with a matching checksum. Never errors.
#[must_use]
pub fn verify_archive(path: &Path) -> bool {
    match inspect_archive(path) {
        Ok(summary) => {
            log::debug!(
                "{} verified: {} members, {} bytes",
                path.display(),
                summary.members,
                summary.uncompressed_bytes
            );
            true
        }
        Err(e) => {
            log::debug!("{} failed verification: {e}", path.display());
            false
        }
    }
}
