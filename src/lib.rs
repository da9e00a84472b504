//! pmc-harvest - resumable bulk harvesting of the Europe PMC PDF mirror.
//!
//! The library discovers package archives on the mirror's directory
//! indexes, downloads them one at a time under a politeness delay, verifies
//! every archive and extracts its PDFs into a sharded tree. All progress is
//! kept in a JSON ledger so an interrupted run picks up where it stopped.
//!
//! # Example
//!
//! ```no_run
//! use pmc_harvest::{AppConfig, DownloadRequest, Harvester, NoProgress, build_fetcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pmc_harvest::Result<()> {
//! let config = AppConfig::load(None)?;
//! let fetcher = build_fetcher(&config.catalog)?;
//! let mut harvester = Harvester::open(fetcher, config)?;
//! let cancel = CancellationToken::new();
//!
//! harvester.scan(Some(1), &cancel, |_, _, _, _| {}).await?;
//! let request = DownloadRequest { limit: Some(10), extract: true };
//! let summary = harvester
//!     .download_packages(&request, &NoProgress, &cancel)
//!     .await?;
//! println!("Downloaded {} packages", summary.downloaded);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bounds;
pub mod catalog;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod format;
pub mod harvest;
pub mod ledger;
pub mod report;
pub mod verify;

// Re-export main types for convenience
pub use bounds::{IdRange, MAX_ID, MIN_ID};
pub use config::{AppConfig, CatalogConfig, DownloadConfig, FetchStrategy, PathConfig};
pub use download::{DownloadEngine, DownloadOutcome, PolitenessGate};
pub use error::{Error, Result};
pub use extract::{ExtractReport, Extractor, PayloadKind, shard_path};
pub use fetch::{DefaultFetcher, Fetcher, build_fetcher};
pub use format::{format_bytes, format_duration};
pub use harvest::{BatchProgress, DownloadRequest, Harvester, NoProgress};
pub use ledger::{Ledger, PackageRecord, PackageStage};
pub use report::{Estimate, StatusReport};
