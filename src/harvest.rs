//! The download → verify → extract pipeline over the ledger.
//!
//! Every batch re-reads the ledger and only touches packages that have not
//! reached the batch's target stage, so any batch can be interrupted and
//! run again. The ledger is saved after every item.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::bounds::{in_range, validate_id};
use crate::catalog::{CatalogScanner, ScanSummary};
use crate::config::AppConfig;
use crate::download::{DownloadEngine, DownloadOutcome};
use crate::error::{Error, Result};
use crate::extract::{ExtractReport, Extractor, PayloadKind};
use crate::fetch::Fetcher;
use crate::ledger::{Ledger, PackageRecord, PackageStage};
use crate::report::{self, Estimate, StatusReport};
use crate::verify::verify_archive;

/// Which batch a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Verify,
    Extract,
}

impl Stage {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Extract => "extract",
        }
    }
}

/// Trait for receiving batch progress updates.
///
/// All methods have default no-op implementations.
pub trait BatchProgress: Send + Sync {
    /// Called once before the first item with the number of items queued.
    fn on_batch_start(&self, _stage: Stage, _total: usize) {}

    /// Called when work on a package begins.
    fn on_item_start(&self, _stage: Stage, _name: &str) {}

    /// Called when a package finished successfully.
    fn on_item_done(&self, _stage: Stage, _name: &str, _detail: &str) {}

    /// Called when a package failed; the batch continues.
    fn on_item_failed(&self, _stage: Stage, _name: &str, _error: &str) {}

    /// Called once after the last item (also after cancellation).
    fn on_batch_end(&self, _stage: Stage) {}
}

/// A progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl BatchProgress for NoProgress {}

/// Parameters of one download batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadRequest {
    /// Maximum packages to attempt; `None` for all pending.
    pub limit: Option<usize>,
    /// Verify and extract each package right after it is downloaded.
    pub extract: bool,
}

/// Totals of a download batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadSummary {
    pub queued: usize,
    pub downloaded: usize,
    pub already_complete: usize,
    pub failed: usize,
    pub bytes: u64,
    /// Packages that passed verification straight after download.
    pub verified: usize,
    /// Packages deleted after failing verification straight after download.
    pub corrupt: usize,
    /// Payloads counted for packages extracted in this batch.
    pub payloads: u64,
    pub cancelled: bool,
}

/// Totals of a verification batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifySummary {
    pub checked: usize,
    pub passed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Totals of an extraction batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractSummary {
    pub archives: usize,
    pub failed: usize,
    pub payloads: u64,
    pub newly_extracted: u64,
    pub already_present: u64,
    pub unsafe_members: u64,
    pub rejected_members: u64,
    pub cancelled: bool,
}

impl ExtractSummary {
    fn add(&mut self, report: &ExtractReport) {
        self.payloads += report.payloads;
        self.newly_extracted += report.newly_extracted;
        self.already_present += report.already_present;
        self.unsafe_members += report.unsafe_members;
        self.rejected_members += report.rejected_members;
    }
}

/// Where an item lives, as far as the ledger and disk know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindResult {
    pub item_id: u64,
    /// Package whose identifier range covers the item.
    pub package: Option<PackageRecord>,
    /// Where the payload is (or would be) stored.
    pub payload_path: PathBuf,
    /// Whether the payload file exists.
    pub payload_present: bool,
}

/// Drives scanning, downloading, verification and extraction for one
/// output directory.
pub struct Harvester<F: Fetcher> {
    fetcher: F,
    config: AppConfig,
    ledger: Ledger,
    extractor: Extractor,
    packages_dir: PathBuf,
}

impl<F: Fetcher> Harvester<F> {
    /// Validates `config`, creates the output directories and loads the
    /// ledger.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, if the output directories cannot be
    /// created, or if the state file cannot be read.
    pub fn open(fetcher: F, mut config: AppConfig) -> Result<Self> {
        config.validate()?;

        let packages_dir = config.paths.packages_dir();
        let payload_dir = config.paths.payload_dir();
        for dir in [&packages_dir, &payload_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Io(io::Error::new(
                    e.kind(),
                    format!("cannot create {}: {e}", dir.display()),
                ))
            })?;
        }

        let ledger = Ledger::load(config.paths.state_path())?;
        log::debug!(
            "Opened {} with {} known package(s) via {} fetcher",
            ledger.path().display(),
            ledger.len(),
            fetcher.name()
        );

        Ok(Self {
            fetcher,
            extractor: Extractor::new(payload_dir, PayloadKind::pdf()),
            config,
            ledger,
            packages_dir,
        })
    }

    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub const fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Walks the catalog and merges in-range packages into the ledger.
    ///
    /// `max_shards` overrides the configured cap.
    ///
    /// # Errors
    ///
    /// Fails if the catalog root cannot be listed or the ledger cannot be
    /// saved.
    pub async fn scan(
        &mut self,
        max_shards: Option<usize>,
        cancel: &CancellationToken,
        on_progress: impl FnMut(usize, usize, &str, usize),
    ) -> Result<ScanSummary> {
        let scanner = CatalogScanner::new(
            &self.fetcher,
            &self.config.catalog.base_url,
            &self.config.id_ranges,
        );
        scanner
            .scan_all(
                &mut self.ledger,
                max_shards.or(self.config.catalog.max_shards),
                cancel,
                on_progress,
            )
            .await
    }

    /// Downloads pending in-range packages in filename order.
    ///
    /// # Errors
    ///
    /// Only filesystem failures abort the batch; per-package failures are
    /// recorded in the ledger error log.
    pub async fn download_packages(
        &mut self,
        request: &DownloadRequest,
        progress: &dyn BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<DownloadSummary> {
        let queue: Vec<PackageRecord> = self
            .ledger
            .packages()
            .filter(|r| !r.downloaded)
            .filter(|r| in_range(&self.config.id_ranges, r.item_id_start, r.item_id_end))
            .take(request.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        let mut summary = DownloadSummary {
            queued: queue.len(),
            ..DownloadSummary::default()
        };
        if queue.is_empty() {
            log::info!("No pending packages to download");
            return Ok(summary);
        }

        self.ledger.start_clock(Utc::now());
        self.ledger.save()?;
        log::info!("Downloading {} package(s)", queue.len());
        progress.on_batch_start(Stage::Download, queue.len());

        let mut engine = DownloadEngine::new(&self.fetcher, &self.config.download, &self.packages_dir);
        for record in &queue {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let name = record.filename.as_str();
            progress.on_item_start(Stage::Download, name);

            let outcome = match engine.download(record, cancel).await {
                Ok(o) => o,
                Err(e @ Error::InvalidFilename(_)) => {
                    DownloadOutcome::Failed(e.to_string())
                }
                Err(e) => {
                    progress.on_batch_end(Stage::Download);
                    return Err(e);
                }
            };

            let already_verified = match outcome {
                DownloadOutcome::AlreadyComplete => {
                    // The engine only reports this after the archive passed verification.
                    let size = tokio::fs::metadata(engine.package_path(name))
                        .await
                        .map_or(0, |m| m.len());
                    self.ledger.mark_downloaded(name, size, Utc::now());
                    self.ledger.mark_verified(name);
                    summary.already_complete += 1;
                    progress.on_item_done(Stage::Download, name, "already on disk");
                    true
                }
                DownloadOutcome::Downloaded { bytes } => {
                    self.ledger.mark_downloaded(name, bytes, Utc::now());
                    summary.downloaded += 1;
                    summary.bytes += bytes;
                    progress.on_item_done(Stage::Download, name, "downloaded");
                    false
                }
                DownloadOutcome::Failed(reason) => {
                    log::error!("Download of {name} failed: {reason}");
                    self.ledger.record_error(format!("download {name}: {reason}"));
                    summary.failed += 1;
                    progress.on_item_failed(Stage::Download, name, &reason);
                    self.ledger.save()?;
                    continue;
                }
                DownloadOutcome::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            };
            self.ledger.save()?;

            if request.extract {
                let path = engine.package_path(name);
                if already_verified || verify_one(&mut self.ledger, &path, name).await? {
                    summary.verified += 1;
                    if let Some(report) =
                        extract_one(&mut self.ledger, &self.extractor, &path, name).await?
                    {
                        summary.payloads += report.payloads;
                    }
                } else {
                    summary.corrupt += 1;
                }
            }
        }

        progress.on_batch_end(Stage::Download);
        Ok(summary)
    }

    /// Verifies every downloaded but unverified package. Corrupt or missing
    /// archives are deleted and sent back to `Discovered`.
    ///
    /// # Errors
    ///
    /// Fails if a corrupt file cannot be removed or the ledger cannot be
    /// saved.
    pub async fn verify_all_downloads(
        &mut self,
        progress: &dyn BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<VerifySummary> {
        let queue = self.ledger.at_stage(PackageStage::Downloaded);
        let mut summary = VerifySummary::default();
        progress.on_batch_start(Stage::Verify, queue.len());

        for record in &queue {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let name = record.filename.as_str();
            progress.on_item_start(Stage::Verify, name);
            summary.checked += 1;

            let path = self.packages_dir.join(name);
            if verify_one(&mut self.ledger, &path, name).await? {
                summary.passed += 1;
                progress.on_item_done(Stage::Verify, name, "ok");
            } else {
                summary.failed += 1;
                progress.on_item_failed(Stage::Verify, name, "failed verification");
            }
        }

        progress.on_batch_end(Stage::Verify);
        log::info!(
            "Verified {} package(s): {} passed, {} failed",
            summary.checked,
            summary.passed,
            summary.failed
        );
        Ok(summary)
    }

    /// Extracts payloads from every verified but unextracted package.
    ///
    /// # Errors
    ///
    /// Fails if a payload cannot be written or the ledger cannot be saved.
    pub async fn extract_all_payloads(
        &mut self,
        progress: &dyn BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary> {
        let queue = self.ledger.at_stage(PackageStage::Verified);
        let mut summary = ExtractSummary::default();
        progress.on_batch_start(Stage::Extract, queue.len());

        for record in &queue {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let name = record.filename.as_str();
            progress.on_item_start(Stage::Extract, name);

            let path = self.packages_dir.join(name);
            if !tokio::fs::try_exists(&path).await? {
                log::warn!("{name}: archive missing, queued for download again");
                self.ledger.revert_to_discovered(name);
                self.ledger
                    .record_error(format!("extract {name}: archive missing"));
                self.ledger.save()?;
                summary.failed += 1;
                progress.on_item_failed(Stage::Extract, name, "archive missing");
                continue;
            }

            match extract_one(&mut self.ledger, &self.extractor, &path, name).await? {
                Some(report) => {
                    summary.archives += 1;
                    summary.add(&report);
                    progress.on_item_done(
                        Stage::Extract,
                        name,
                        &format!("{} payload(s)", report.payloads),
                    );
                }
                None => {
                    summary.failed += 1;
                    progress.on_item_failed(Stage::Extract, name, "extraction failed");
                }
            }
        }

        progress.on_batch_end(Stage::Extract);
        log::info!(
            "Extracted {} archive(s): {} payload(s), {} new",
            summary.archives,
            summary.payloads,
            summary.newly_extracted
        );
        Ok(summary)
    }

    /// Locates an item in the ledger and the payload tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for identifiers outside the bounds.
    pub fn find(&self, item_id: u64) -> Result<FindResult> {
        let item_id = validate_id(item_id)?;
        let package = self.ledger.packages().find(|r| r.covers(item_id)).cloned();
        let payload_path = self.extractor.payload_path(item_id);
        Ok(FindResult {
            item_id,
            payload_present: payload_path.is_file(),
            package,
            payload_path,
        })
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        report::status(&self.ledger)
    }

    #[must_use]
    pub fn estimate(&self) -> Estimate {
        report::estimate(&self.ledger, Utc::now())
    }
}

/// Verifies one archive and records the result. On failure the file is
/// deleted and the package reverts to `Discovered`.
async fn verify_one(ledger: &mut Ledger, path: &Path, filename: &str) -> Result<bool> {
    let exists = tokio::fs::try_exists(path).await?;
    let valid = if exists {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || verify_archive(&owned))
            .await
            .unwrap_or(false)
    } else {
        false
    };

    if valid {
        ledger.mark_verified(filename);
    } else {
        let reason = if exists {
            match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            "corrupt archive deleted"
        } else {
            "archive missing"
        };
        log::warn!("{filename}: {reason}, queued for download again");
        ledger.revert_to_discovered(filename);
        ledger.record_error(format!("verify {filename}: {reason}"));
    }
    ledger.save()?;
    Ok(valid)
}

/// Extracts one archive and records the payload count. Archive-level
/// problems are logged and yield `None`; filesystem failures propagate.
async fn extract_one(
    ledger: &mut Ledger,
    extractor: &Extractor,
    path: &Path,
    filename: &str,
) -> Result<Option<ExtractReport>> {
    let extractor = extractor.clone();
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || extractor.extract(&owned))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?;

    match result {
        Ok(report) => {
            if report.payloads == 0 {
                log::warn!("{filename}: no payloads found");
            }
            ledger.mark_extracted(filename, report.payloads);
            ledger.save()?;
            Ok(Some(report))
        }
        Err(Error::Io(e)) => Err(Error::Io(e)),
        Err(e) => {
            log::error!("Extraction of {filename} failed: {e}");
            ledger.record_error(format!("extract {filename}: {e}"));
            ledger.save()?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::bounds::IdRange;
    use crate::config::DownloadConfig;
    use crate::extract::shard_path;
    use crate::fetch::mock::{MockFetcher, Reply};
    use crate::verify::fixtures::{pdf, zip_bytes};
    use tempfile::TempDir;

    const BASE: &str = "https://mirror.test/pdf/";

    fn config(dir: &Path, ranges: Vec<IdRange>) -> AppConfig {
        let mut config = AppConfig::new();
        config.catalog.base_url = BASE.to_string();
        config.paths.output_dir = dir.to_path_buf();
        config.download = DownloadConfig::new()
            .with_delay_between_files(Duration::ZERO)
            .with_retry_base_delay(Duration::ZERO)
            .with_extract_after_download(false);
        config.id_ranges = ranges;
        config
    }

    fn mirror() -> MockFetcher {
        let root = r#"<a href="0-999/">0-999/</a>  -
<a href="9000-9999/">9000-9999/</a>  -"#;
        let shard_a = r#"<a href="PMC150.zip">PMC150.zip</a> 1K
<a href="PMC160.zip">PMC160.zip</a> 1K"#;
        let shard_b = r#"<a href="PMC9999.zip">PMC9999.zip</a> 1K"#;
        MockFetcher::new()
            .page(BASE, root)
            .page(&format!("{BASE}0-999/"), shard_a)
            .page(&format!("{BASE}9000-9999/"), shard_b)
            .page(
                &format!("{BASE}0-999/PMC150.zip"),
                zip_bytes(&[("PMC150.pdf", &pdf("150"))]),
            )
            .page(
                &format!("{BASE}0-999/PMC160.zip"),
                zip_bytes(&[("ITEM160.pdf", &pdf("160")), ("../../../etc/passwel.pdf", &pdf("x"))]),
            )
            .page(
                &format!("{BASE}9000-9999/PMC9999.zip"),
                zip_bytes(&[("PMC9999.pdf", &pdf("9999"))]),
            )
    }

    fn filtered(dir: &TempDir) -> Harvester<MockFetcher> {
        let ranges = vec![IdRange::new(100, 200).unwrap()];
        Harvester::open(mirror(), config(dir.path(), ranges)).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_with_range_filter() {
        let dir = TempDir::new().unwrap();
        let mut harvester = filtered(&dir);
        let cancel = CancellationToken::new();

        let scan = harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();
        assert_eq!(scan.packages_retained, 2);
        let names: Vec<_> = harvester.ledger().packages().map(|r| r.filename.clone()).collect();
        assert_eq!(names, vec!["PMC150.zip", "PMC160.zip"]);

        let request = DownloadRequest { limit: None, extract: false };
        let downloads = harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(downloads.downloaded, 2);
        assert_eq!(harvester.fetcher().request_count(&format!("{BASE}9000-9999/PMC9999.zip")), 0);

        let verified = harvester.verify_all_downloads(&NoProgress, &cancel).await.unwrap();
        assert_eq!((verified.checked, verified.passed), (2, 2));

        let extracted = harvester.extract_all_payloads(&NoProgress, &cancel).await.unwrap();
        assert_eq!(extracted.archives, 2);
        assert_eq!(extracted.unsafe_members, 1);

        let payload = dir
            .path()
            .join("payload")
            .join(shard_path(160))
            .join("PMC160.pdf");
        assert_eq!(std::fs::read(&payload).unwrap(), pdf("160"));
        assert!(!dir.path().join("etc").exists());

        let status = harvester.status();
        assert_eq!(status.packages.total, 2);
        assert_eq!(status.packages.extracted, 2);
        assert_eq!(status.packages.pending, 0);
        assert_eq!(status.payloads.total, 2);
        assert!(matches!(harvester.estimate(), Estimate::Estimable { .. }));
    }

    #[tokio::test]
    async fn archive_already_on_disk_is_marked_verified() {
        let dir = TempDir::new().unwrap();
        let mut harvester = filtered(&dir);
        let cancel = CancellationToken::new();
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();

        std::fs::write(
            dir.path().join("packages").join("PMC150.zip"),
            zip_bytes(&[("PMC150.pdf", &pdf("150"))]),
        )
        .unwrap();

        let request = DownloadRequest { limit: Some(1), extract: false };
        let summary = harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.already_complete, 1);
        assert_eq!(harvester.fetcher().request_count(&format!("{BASE}0-999/PMC150.zip")), 0);

        let record = harvester.ledger().get("PMC150.zip").unwrap();
        assert!(record.downloaded);
        assert!(record.verified);
        assert_eq!(record.stage(), PackageStage::Verified);

        let verify = harvester.verify_all_downloads(&NoProgress, &cancel).await.unwrap();
        assert_eq!(verify.checked, 0);
    }

    #[tokio::test]
    async fn resumed_run_skips_completed_work() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        {
            let mut harvester = filtered(&dir);
            harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();
            let request = DownloadRequest { limit: None, extract: true };
            let summary = harvester
                .download_packages(&request, &NoProgress, &cancel)
                .await
                .unwrap();
            assert_eq!(summary.verified, 2);
            assert_eq!(summary.payloads, 2);
        }

        let mut resumed = filtered(&dir);
        assert_eq!(resumed.status().packages.extracted, 2);
        let request = DownloadRequest { limit: None, extract: true };
        let summary = resumed
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.queued, 0);
        assert!(resumed.fetcher().requests().is_empty());
        let verify = resumed.verify_all_downloads(&NoProgress, &cancel).await.unwrap();
        assert_eq!(verify.checked, 0);
    }

    #[tokio::test]
    async fn corrupt_download_is_reverted() {
        let dir = TempDir::new().unwrap();
        let mut harvester = filtered(&dir);
        let cancel = CancellationToken::new();
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();
        let request = DownloadRequest { limit: None, extract: false };
        harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();

        let archive = dir.path().join("packages").join("PMC150.zip");
        std::fs::write(&archive, b"garbage").unwrap();

        let summary = harvester.verify_all_downloads(&NoProgress, &cancel).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(!archive.exists());
        let record = harvester.ledger().get("PMC150.zip").unwrap();
        assert_eq!(record.stage(), PackageStage::Discovered);
        assert!(harvester.ledger().progress().errors[0].contains("PMC150.zip"));

        let again = harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(again.queued, 1);
        assert_eq!(again.downloaded, 1);
    }

    #[tokio::test]
    async fn failed_download_is_isolated() {
        let dir = TempDir::new().unwrap();
        let fetcher = mirror().script(&format!("{BASE}0-999/PMC150.zip"), vec![Reply::Status(503)]);
        let mut harvester = Harvester::open(fetcher, config(dir.path(), vec![])).unwrap();
        let cancel = CancellationToken::new();
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();

        let request = DownloadRequest { limit: None, extract: false };
        let summary = harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.downloaded, 2);
        assert!(!harvester.ledger().get("PMC150.zip").unwrap().downloaded);
        assert_eq!(harvester.status().packages.pending, 1);
        assert_eq!(harvester.ledger().progress().errors.len(), 1);
    }

    #[tokio::test]
    async fn limit_caps_the_batch() {
        let dir = TempDir::new().unwrap();
        let mut harvester = Harvester::open(mirror(), config(dir.path(), vec![])).unwrap();
        let cancel = CancellationToken::new();
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();

        let request = DownloadRequest { limit: Some(1), extract: false };
        let summary = harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.queued, 1);
        assert!(harvester.ledger().get("PMC150.zip").unwrap().downloaded);
        assert!(!harvester.ledger().get("PMC160.zip").unwrap().downloaded);
    }

    #[tokio::test]
    async fn cancelled_batch_stops_before_work() {
        let dir = TempDir::new().unwrap();
        let mut harvester = filtered(&dir);
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = DownloadRequest { limit: None, extract: false };
        let summary = harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.downloaded, 0);
        assert_eq!(harvester.ledger().progress().downloaded_packages, 0);
    }

    #[tokio::test]
    async fn archive_without_payloads_stays_verified() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new()
            .page(BASE, r#"<a href="0-999/">x</a>"#)
            .page(&format!("{BASE}0-999/"), r#"<a href="PMC5.zip">x</a>"#)
            .script(
                &format!("{BASE}0-999/PMC5.zip"),
                vec![Reply::Body(Bytes::from(zip_bytes(&[("readme.txt", b"hi")])))],
            );
        let mut harvester = Harvester::open(fetcher, config(dir.path(), vec![])).unwrap();
        let cancel = CancellationToken::new();
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();

        let request = DownloadRequest { limit: None, extract: true };
        harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        let record = harvester.ledger().get("PMC5.zip").unwrap();
        assert_eq!(record.stage(), PackageStage::Verified);
        assert_eq!(record.payload_count, 0);
    }

    #[tokio::test]
    async fn find_reports_package_and_payload() {
        let dir = TempDir::new().unwrap();
        let mut harvester = filtered(&dir);
        let cancel = CancellationToken::new();
        harvester.scan(None, &CancellationToken::new(), |_, _, _, _| {}).await.unwrap();

        let before = harvester.find(160).unwrap();
        assert_eq!(before.package.as_ref().unwrap().filename, "PMC160.zip");
        assert!(!before.payload_present);

        let request = DownloadRequest { limit: None, extract: true };
        harvester
            .download_packages(&request, &NoProgress, &cancel)
            .await
            .unwrap();
        let after = harvester.find(160).unwrap();
        assert!(after.payload_present);
        assert!(after.payload_path.ends_with("PMC160.pdf"));

        assert!(harvester.find(170).unwrap().package.is_none());
        assert!(matches!(harvester.find(0), Err(Error::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn open_rejects_out_of_range_filters() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), vec![]);
        cfg.id_ranges = vec![IdRange { start: 0, end: 10 }];
        assert!(matches!(Harvester::open(mirror(), cfg), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn open_fails_when_output_dir_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let result = Harvester::open(mirror(), config(&file, vec![]));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
