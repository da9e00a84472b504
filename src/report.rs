//! Read-only status and ETA views over the ledger.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::Ledger;

/// Package counts by stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PackageCounts {
    pub total: u64,
    pub downloaded: u64,
    pub verified: u64,
    pub extracted: u64,
    /// Packages not downloaded yet (`total - downloaded`).
    pub pending: u64,
}

/// Payload counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PayloadCounts {
    pub total: u64,
}

/// Byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteCounts {
    pub total: u64,
    pub downloaded: u64,
}

/// Snapshot of the ledger for display or `--json` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub packages: PackageCounts,
    pub payloads: PayloadCounts,
    pub bytes: ByteCounts,
    pub errors: Vec<String>,
}

/// Builds a status snapshot.
#[must_use]
pub fn status(ledger: &Ledger) -> StatusReport {
    let p = ledger.progress();
    StatusReport {
        packages: PackageCounts {
            total: p.total_packages,
            downloaded: p.downloaded_packages,
            verified: p.verified_packages,
            extracted: p.extracted_packages,
            pending: p.total_packages.saturating_sub(p.downloaded_packages),
        },
        payloads: PayloadCounts {
            total: p.total_payloads,
        },
        bytes: ByteCounts {
            total: p.total_bytes,
            downloaded: p.downloaded_bytes,
        },
        errors: p.errors.clone(),
    }
}

/// Projected completion of the remaining downloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Estimate {
    /// No batch has started or nothing has been downloaded yet.
    NotEstimable,
    Estimable {
        /// Time since the first batch started.
        elapsed: Duration,
        remaining_packages: u64,
        packages_per_hour: f64,
        /// Projected time for the remaining packages.
        remaining_time: Duration,
    },
}

/// Projects the remaining download time from the observed rate.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate(ledger: &Ledger, now: DateTime<Utc>) -> Estimate {
    let p = ledger.progress();
    let Some(start) = p.start_time else {
        return Estimate::NotEstimable;
    };
    if p.downloaded_packages == 0 {
        return Estimate::NotEstimable;
    }
    let Ok(elapsed) = (now - start).to_std() else {
        return Estimate::NotEstimable;
    };
    if elapsed.is_zero() {
        return Estimate::NotEstimable;
    }

    let per_second = p.downloaded_packages as f64 / elapsed.as_secs_f64();
    let remaining_packages = p.total_packages.saturating_sub(p.downloaded_packages);
    Estimate::Estimable {
        elapsed,
        remaining_packages,
        packages_per_hour: per_second * 3600.0,
        remaining_time: Duration::from_secs_f64(remaining_packages as f64 / per_second),
    }
}
