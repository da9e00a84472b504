//! Catalog discovery over the mirror's HTML directory indexes.
//!
//! The mirror exposes a root index of shard directories and one index per
//! shard listing the package archives. Listings are parsed with bounded
//! patterns and a hard cap on matches per page.

use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::bounds::{IdRange, in_range, parse_item_range, validate_range};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::format::parse_size;
use crate::ledger::{Ledger, PackageRecord};

/// Most links considered on a single listing page.
pub const MAX_LISTING_MATCHES: usize = 10_000;

/// `href="name/"` with a relative, single-segment directory name.
static DIR_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([A-Za-z0-9._-]{1,128})/""#).expect("valid regex"));

/// `href="name.zip"` with a relative file name.
static ZIP_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href="([A-Za-z0-9._-]{1,128}\.zip)""#).expect("valid regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<>]{0,512}>").expect("valid regex"));

/// What one full catalog pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub shards_total: usize,
    pub shards_scanned: usize,
    pub shards_failed: usize,
    /// Valid packages seen in listings.
    pub packages_found: usize,
    /// Packages inside the configured ranges.
    pub packages_retained: usize,
    /// Retained packages the ledger did not know yet.
    pub new_packages: usize,
    /// The walk stopped early on cancellation.
    pub cancelled: bool,
}

/// Walks the mirror's directory indexes.
pub struct CatalogScanner<'a, F: Fetcher + ?Sized> {
    fetcher: &'a F,
    base_url: String,
    filters: Vec<IdRange>,
}

impl<'a, F: Fetcher + ?Sized> CatalogScanner<'a, F> {
    #[must_use]
    pub fn new(fetcher: &'a F, base_url: &str, filters: &[IdRange]) -> Self {
        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            fetcher,
            base_url,
            filters: filters.to_vec(),
        }
    }

    fn shard_url(&self, shard: &str) -> String {
        format!("{}{shard}/", self.base_url)
    }

    /// Lists shard directory names from the root index, sorted and unique.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Catalog`] if the root index cannot be fetched.
    pub async fn list_shard_directories(&self) -> Result<Vec<String>> {
        let body = self
            .fetcher
            .fetch_text(&self.base_url)
            .await
            .map_err(|e| Error::Catalog(format!("root listing {}: {e}", self.base_url)))?;
        Ok(parse_shard_directories(&body))
    }

    /// Lists the package archives of one shard.
    ///
    /// Entries whose identifier range cannot be parsed or is out of bounds
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns the fetch error if the shard index cannot be retrieved.
    pub async fn list_packages_in_shard(&self, shard: &str) -> Result<Vec<PackageRecord>> {
        let shard_url = self.shard_url(shard);
        let body = self.fetcher.fetch_text(&shard_url).await?;
        Ok(parse_package_listing(&body, &shard_url))
    }

    /// Scans every shard (optionally the first `max_shards`) and merges the
    /// in-range packages into `ledger`, saving it after each shard.
    ///
    /// `on_progress(index, count, shard, found)` is called after each shard.
    /// `cancel` is checked before every request; shards merged so far stay
    /// saved.
    ///
    /// # Errors
    ///
    /// Fails if the root index cannot be fetched or the ledger cannot be
    /// saved. A failing shard is logged and skipped.
    pub async fn scan_all(
        &self,
        ledger: &mut Ledger,
        max_shards: Option<usize>,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(usize, usize, &str, usize),
    ) -> Result<ScanSummary> {
        if cancel.is_cancelled() {
            return Ok(ScanSummary {
                cancelled: true,
                ..ScanSummary::default()
            });
        }
        let mut shards = self.list_shard_directories().await?;
        if let Some(max) = max_shards {
            shards.truncate(max);
        }
        log::info!("Scanning {} shard(s) under {}", shards.len(), self.base_url);

        let mut summary = ScanSummary {
            shards_total: shards.len(),
            ..ScanSummary::default()
        };

        for (index, shard) in shards.iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("Scan interrupted after {index} of {} shard(s)", shards.len());
                summary.cancelled = true;
                break;
            }
            let packages = match self.list_packages_in_shard(shard).await {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Skipping shard {shard}: {e}");
                    ledger.record_error(format!("scan {shard}: {e}"));
                    summary.shards_failed += 1;
                    ledger.save()?;
                    on_progress(index + 1, shards.len(), shard, 0);
                    continue;
                }
            };

            summary.shards_scanned += 1;
            summary.packages_found += packages.len();
            let mut retained = 0;
            for record in packages {
                if !in_range(&self.filters, record.item_id_start, record.item_id_end) {
                    continue;
                }
                retained += 1;
                if ledger.merge_discovered(record) {
                    summary.new_packages += 1;
                }
            }
            summary.packages_retained += retained;
            log::debug!("Shard {shard}: {retained} package(s) in range");

            ledger.save()?;
            on_progress(index + 1, shards.len(), shard, retained);
        }

        log::info!(
            "Scan finished: {} shard(s), {} package(s) in range, {} new",
            summary.shards_scanned,
            summary.packages_retained,
            summary.new_packages
        );
        Ok(summary)
    }
}

/// Extracts shard directory names from a root index page.
fn parse_shard_directories(body: &str) -> Vec<String> {
    let mut names: Vec<String> = DIR_LINK_RE
        .captures_iter(body)
        .take(MAX_LISTING_MATCHES)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|name| *name != "." && *name != "..")
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Extracts package records from one shard index page.
fn parse_package_listing(body: &str, shard_url: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    let mut seen = 0usize;

    'lines: for line in body.lines() {
        // One past the remaining budget so truncation is still noticed.
        let links: Vec<_> = ZIP_LINK_RE
            .captures_iter(line)
            .take(MAX_LISTING_MATCHES - seen + 1)
            .collect();
        for (i, caps) in links.iter().enumerate() {
            if seen == MAX_LISTING_MATCHES {
                log::warn!("Listing {shard_url} truncated at {MAX_LISTING_MATCHES} entries");
                break 'lines;
            }
            seen += 1;

            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str();

            let Some((start, end)) = parse_item_range(name) else {
                log::debug!("Skipping {name}: no identifier range");
                continue;
            };
            let range = match validate_range(start, end) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("Skipping {name}: {e}");
                    continue;
                }
            };

            let tail_end = links
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(line.len(), |m| m.start());
            let size = size_after_link(&line[whole.end()..tail_end]);

            records.push(PackageRecord::discovered(
                name,
                range.start,
                range.end,
                size,
                format!("{shard_url}{name}"),
            ));
        }
    }
    records
}

/// Size column following a link: the last token of the remaining text.
fn size_after_link(tail: &str) -> u64 {
    // Drop the opening of the next tag when the slice ends inside it.
    let tail = match tail.rfind('<') {
        Some(i) if !tail[i..].contains('>') => &tail[..i],
        _ => tail,
    };
    let text = TAG_RE.replace_all(tail, " ");
    text.split_whitespace()
        .last()
        .and_then(parse_size)
        .unwrap_or(0)
}
