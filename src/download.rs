//! Package downloads with retry, backoff and a politeness gate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::ledger::PackageRecord;
use crate::verify::verify_archive;

/// How a single package download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// A verified copy was already on disk; nothing was fetched.
    AlreadyComplete,
    /// Fresh copy written to the packages directory.
    Downloaded {
        /// Bytes written.
        bytes: u64,
    },
    /// Every attempt failed; the package stays pending.
    Failed(String),
    /// Cancellation was requested before the download finished.
    Cancelled,
}

/// Keeps consecutive download starts at least `delay` apart.
///
/// Only starts count: the first download of a batch never waits, and time
/// spent downloading or idling since the last start is credited.
#[derive(Debug)]
pub struct PolitenessGate {
    delay: Duration,
    last_start: Option<Instant>,
}

impl PolitenessGate {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_start: None,
        }
    }

    /// Waits until the next start is allowed and records it.
    ///
    /// Returns false if `cancel` fired while waiting; no start is recorded.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        if let Some(last) = self.last_start {
            let Some(ready) = last.checked_add(self.delay) else {
                // Unreachable start time: only cancellation ends the wait.
                cancel.cancelled().await;
                return false;
            };
            if Instant::now() < ready {
                log::debug!(
                    "Waiting {:.1}s before next download",
                    (ready - Instant::now()).as_secs_f64()
                );
                tokio::select! {
                    () = tokio::time::sleep_until(ready) => {}
                    () = cancel.cancelled() => return false,
                }
            }
        }
        self.last_start = Some(Instant::now());
        true
    }
}

/// Backoff before retry number `attempt` (1-based):
/// `base * attempt` plus up to `jitter_factor` of that, scaled by `sample`
/// in `[0, 1]`. Saturates at [`Duration::MAX`].
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32, jitter_factor: f64, sample: f64) -> Duration {
    let step = base.saturating_mul(attempt);
    let scale = jitter_factor.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
    let jitter = Duration::try_from_secs_f64(step.as_secs_f64() * scale).unwrap_or(Duration::MAX);
    step.saturating_add(jitter)
}

/// Rejects names that would resolve outside the packages directory.
fn check_filename(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidFilename(name.to_string()));
    }
    Ok(())
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn remove_part(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            log::debug!("Could not remove {}: {e}", part.display());
        }
        _ => {}
    }
}

/// Downloads packages one at a time into the packages directory.
pub struct DownloadEngine<'a, F: Fetcher + ?Sized> {
    fetcher: &'a F,
    config: DownloadConfig,
    packages_dir: PathBuf,
    gate: PolitenessGate,
}

impl<'a, F: Fetcher + ?Sized> DownloadEngine<'a, F> {
    #[must_use]
    pub fn new(fetcher: &'a F, config: &DownloadConfig, packages_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            gate: PolitenessGate::new(config.delay_between_files()),
            config: config.clone(),
            packages_dir: packages_dir.into(),
        }
    }

    /// Local path of a package archive.
    #[must_use]
    pub fn package_path(&self, filename: &str) -> PathBuf {
        self.packages_dir.join(filename)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::rng().random();
        backoff_delay(
            self.config.retry_base_delay(),
            attempt,
            self.config.jitter_factor,
            sample,
        )
    }

    /// Downloads one package, retrying transient failures.
    ///
    /// A verified archive already on disk short-circuits without any
    /// request. Data is streamed to `<filename>.part` and renamed into place
    /// only once the transfer completed with at least one byte.
    ///
    /// Cancellation also interrupts a transfer in flight rather than letting
    /// it finish; the partial `.part` file is removed and the package stays
    /// pending, so the next run starts it over.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilename`] for names that are not plain file
    /// names, and filesystem errors, which are fatal for the batch. Network
    /// failures are reported as [`DownloadOutcome::Failed`].
    pub async fn download(
        &mut self,
        package: &PackageRecord,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        check_filename(&package.filename)?;
        let dest = self.package_path(&package.filename);

        if tokio::fs::try_exists(&dest).await? {
            let path = dest.clone();
            let valid = tokio::task::spawn_blocking(move || verify_archive(&path))
                .await
                .unwrap_or(false);
            if valid {
                log::debug!("{} already on disk and valid", package.filename);
                return Ok(DownloadOutcome::AlreadyComplete);
            }
            log::info!("{} on disk but invalid, downloading again", package.filename);
        }

        if cancel.is_cancelled() || !self.gate.wait(cancel).await {
            return Ok(DownloadOutcome::Cancelled);
        }

        let part = part_path(&dest);
        let attempts = self.config.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Ok(DownloadOutcome::Cancelled);
            }
            log::debug!(
                "Fetching {} (attempt {attempt}/{attempts})",
                package.source_url
            );

            let result = tokio::select! {
                r = self.fetcher.fetch_to_file(&package.source_url, &part) => r,
                () = cancel.cancelled() => Err(Error::Cancelled),
            };

            let err = match result {
                Ok(0) => Error::EmptyPayload {
                    url: package.source_url.clone(),
                },
                Ok(bytes) => {
                    tokio::fs::rename(&part, &dest).await?;
                    log::info!("Downloaded {} ({bytes} bytes)", package.filename);
                    return Ok(DownloadOutcome::Downloaded { bytes });
                }
                Err(e) => e,
            };
            remove_part(&part).await;

            match err {
                Error::Cancelled => return Ok(DownloadOutcome::Cancelled),
                Error::Io(e) => return Err(Error::Io(e)),
                _ => {}
            }

            log::warn!(
                "{}: attempt {attempt}/{attempts} failed: {err}",
                package.filename
            );
            last_error = err.to_string();
            if !err.is_retryable() {
                break;
            }

            if attempt < attempts {
                let delay = self.retry_delay(attempt);
                log::debug!("Retrying {} in {:.1}s", package.filename, delay.as_secs_f64());
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Ok(DownloadOutcome::Cancelled),
                }
            }
        }

        Ok(DownloadOutcome::Failed(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::mock::{MockFetcher, Reply};
    use crate::verify::fixtures::{pdf, zip_bytes};
    use bytes::Bytes;
    use tempfile::TempDir;

    const URL: &str = "https://mirror.test/pdf/0-999/PMC150.zip";

    fn package() -> PackageRecord {
        PackageRecord::discovered("PMC150.zip", 150, 150, 0, URL)
    }

    fn archive() -> Bytes {
        Bytes::from(zip_bytes(&[("PMC150.pdf", &pdf("150"))]))
    }

    fn config() -> DownloadConfig {
        DownloadConfig::new()
            .with_max_retries(3)
            .with_delay_between_files(Duration::from_secs(30))
            .with_retry_base_delay(Duration::from_secs(5))
    }

    #[test]
    fn backoff_is_linear_with_bounded_jitter() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1, 0.5, 0.0), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2, 0.5, 0.0), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 2, 0.5, 1.0), Duration::from_secs(15));
        assert_eq!(backoff_delay(base, 3, 0.0, 1.0), Duration::from_secs(15));
        assert_eq!(backoff_delay(base, 1, 0.5, 7.0), Duration::from_millis(7500));
    }

    #[test]
    fn filenames_must_be_plain() {
        assert!(check_filename("PMC150.zip").is_ok());
        for bad in ["", ".", "..", "../PMC1.zip", "a/b.zip", "a\\b.zip"] {
            assert!(check_filename(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spaces_starts() {
        let cancel = CancellationToken::new();
        let mut gate = PolitenessGate::new(Duration::from_secs(30));
        let t0 = Instant::now();

        assert!(gate.wait(&cancel).await);
        assert!(t0.elapsed() < Duration::from_millis(1));

        assert!(gate.wait(&cancel).await);
        assert!(t0.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_credits_elapsed_time() {
        let cancel = CancellationToken::new();
        let mut gate = PolitenessGate::new(Duration::from_secs(30));
        assert!(gate.wait(&cancel).await);

        tokio::time::advance(Duration::from_secs(45)).await;
        let t1 = Instant::now();
        assert!(gate.wait(&cancel).await);
        assert!(t1.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_wait_is_cancellable() {
        let cancel = CancellationToken::new();
        let mut gate = PolitenessGate::new(Duration::from_secs(3600));
        assert!(gate.wait(&cancel).await);
        cancel.cancel();
        assert!(!gate.wait(&cancel).await);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let huge = Duration::from_secs(u64::MAX);
        assert_eq!(backoff_delay(huge, 3, 0.5, 1.0), Duration::MAX);
        assert_eq!(backoff_delay(huge, 1, 4.0, 1.0), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_gate_delay_waits_until_cancelled() {
        let cancel = CancellationToken::new();
        let mut gate = PolitenessGate::new(Duration::from_secs(u64::MAX));
        assert!(gate.wait(&cancel).await);

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            waiter.cancel();
        });
        assert!(!gate.wait(&cancel).await);
    }

    #[tokio::test]
    async fn downloads_into_packages_dir() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().script(URL, vec![Reply::Body(archive())]);
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            DownloadOutcome::Downloaded {
                bytes: archive().len() as u64
            }
        );
        assert!(verify_archive(&dir.path().join("PMC150.zip")));
        assert!(!dir.path().join("PMC150.zip.part").exists());
    }

    #[tokio::test]
    async fn valid_local_copy_makes_no_requests() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("PMC150.zip"), archive()).unwrap();
        let fetcher = MockFetcher::new();
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::AlreadyComplete);
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn corrupt_local_copy_is_replaced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("PMC150.zip"), b"truncated").unwrap();
        let fetcher = MockFetcher::new().page(URL, archive());
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Downloaded { .. }));
        assert!(verify_archive(&dir.path().join("PMC150.zip")));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().script(
            URL,
            vec![Reply::Network, Reply::Status(503), Reply::Body(archive())],
        );
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let start = Instant::now();
        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Downloaded { .. }));
        assert_eq!(fetcher.request_count(URL), 3);
        // 5s after the first failure, 10s after the second, plus jitter.
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert!(start.elapsed() <= Duration::from_millis(22_500));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().script(URL, vec![Reply::Status(503)]);
        let cfg = config().with_max_retries(2);
        let mut engine = DownloadEngine::new(&fetcher, &cfg, dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Failed(ref reason) if reason.contains("503")));
        assert_eq!(fetcher.request_count(URL), 2);
        assert!(!dir.path().join("PMC150.zip").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_still_attempts_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().script(URL, vec![Reply::Network]);
        let cfg = config().with_max_retries(0);
        let mut engine = DownloadEngine::new(&fetcher, &cfg, dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Failed(_)));
        assert_eq!(fetcher.request_count(URL), 1);
    }

    #[tokio::test]
    async fn missing_package_fails_fast() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new();
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Failed(_)));
        assert_eq!(fetcher.request_count(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_payload_is_retried_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().script(
            URL,
            vec![Reply::Body(Bytes::new()), Reply::Body(archive())],
        );
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Downloaded { .. }));
        assert_eq!(fetcher.request_count(URL), 2);
        assert!(!dir.path().join("PMC150.zip.part").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_payload_only_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().script(URL, vec![Reply::Body(Bytes::new())]);
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());

        let outcome = engine.download(&package(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Failed(ref r) if r.contains("empty payload")));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn invalid_filename_is_rejected_before_io() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new();
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());
        let evil = PackageRecord::discovered("../PMC150.zip", 150, 150, 0, URL);

        let err = engine.download(&evil, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFilename(_)));
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().page(URL, archive());
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine.download(&package(), &cancel).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_transfer_and_removes_part() {
        let dir = TempDir::new().unwrap();
        let fetcher =
            MockFetcher::new().script(URL, vec![Reply::Stall(Bytes::from_static(b"PK\x03\x04"))]);
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = engine.download(&package(), &cancel).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert_eq!(fetcher.request_count(URL), 1);
        assert!(!dir.path().join("PMC150.zip.part").exists());
        assert!(!dir.path().join("PMC150.zip").exists());
    }

    #[tokio::test]
    async fn filesystem_errors_are_fatal() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new().page(URL, archive());
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path().join("missing"));

        let err = engine.download(&package(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_downloads_respect_delay() {
        let dir = TempDir::new().unwrap();
        let other_url = "https://mirror.test/pdf/0-999/PMC160.zip";
        let fetcher = MockFetcher::new()
            .page(URL, archive())
            .page(other_url, archive());
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());
        let cancel = CancellationToken::new();

        let start = Instant::now();
        engine.download(&package(), &cancel).await.unwrap();
        let second = PackageRecord::discovered("PMC160.zip", 160, 160, 0, other_url);
        engine.download(&second, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn already_complete_does_not_consume_gate() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("PMC150.zip"), archive()).unwrap();
        let other_url = "https://mirror.test/pdf/0-999/PMC160.zip";
        let fetcher = MockFetcher::new().page(other_url, archive());
        let mut engine = DownloadEngine::new(&fetcher, &config(), dir.path());
        let cancel = CancellationToken::new();

        let start = Instant::now();
        assert_eq!(
            engine.download(&package(), &cancel).await.unwrap(),
            DownloadOutcome::AlreadyComplete
        );
        let second = PackageRecord::discovered("PMC160.zip", 160, 160, 0, other_url);
        engine.download(&second, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(30));
    }
}
