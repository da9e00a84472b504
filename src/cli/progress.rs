//! Progress bars and summary reporting for CLI batches.

use std::path::Path;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::catalog::ScanSummary;
use crate::format::{format_bytes, format_duration};
use crate::harvest::{
    BatchProgress, DownloadSummary, ExtractSummary, FindResult, Stage, VerifySummary,
};
use crate::report::{Estimate, StatusReport};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates the bar shown while shard listings are fetched.
pub fn make_scan_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} scan [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress template is valid")
            .progress_chars("━━╌"),
    );
    bar
}

/// Package-level bar driven by [`BatchProgress`] events.
pub struct PackageBar {
    bar: ProgressBar,
}

impl PackageBar {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {prefix:>8} [{bar:40.green/white}] {pos}/{len} ({eta}) {msg}",
            )
            .expect("template valid")
            .progress_chars("━━╌"),
        );
        Self { bar }
    }
}

impl Default for PackageBar {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchProgress for PackageBar {
    fn on_batch_start(&self, stage: Stage, total: usize) {
        self.bar.reset();
        self.bar.set_length(total as u64);
        self.bar.set_prefix(stage.label());
    }

    fn on_item_start(&self, _stage: Stage, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_item_done(&self, _stage: Stage, name: &str, detail: &str) {
        self.bar.println(format!("  {} {name} ({detail})", style("✓").green()));
        self.bar.inc(1);
    }

    fn on_item_failed(&self, _stage: Stage, name: &str, error: &str) {
        self.bar.println(format!("  {} {name}: {error}", style("✗").red()));
        self.bar.inc(1);
    }

    fn on_batch_end(&self, _stage: Stage) {
        self.bar.finish_and_clear();
    }
}

fn heading(title: &str) {
    println!("\n{SEPARATOR}");
    println!("{}", style(title).bold());
    println!("{SEPARATOR}");
}

/// Prints the result of a catalog scan.
pub fn print_scan_summary(summary: &ScanSummary) {
    heading("Catalog Scan");
    println!("  Shards scanned:    {}/{}", summary.shards_scanned, summary.shards_total);
    if summary.shards_failed > 0 {
        println!("  Shards failed:     {}", style(summary.shards_failed).red());
    }
    println!("  Packages listed:   {}", summary.packages_found);
    println!("  In range:          {}", summary.packages_retained);
    println!("  New:               {}", summary.new_packages);
    if summary.cancelled {
        println!("  {}", style("Interrupted; run again to resume").yellow());
    }
    println!("{SEPARATOR}");
}

/// Prints the result of a download batch.
pub fn print_download_summary(summary: &DownloadSummary, elapsed: std::time::Duration) {
    heading("Download Summary");
    println!("  Queued:            {}", summary.queued);
    println!("  Downloaded:        {}", summary.downloaded);
    if summary.already_complete > 0 {
        println!("  Already on disk:   {}", summary.already_complete);
    }
    if summary.failed > 0 {
        println!("  Failed:            {}", style(summary.failed).red());
    }
    println!("  Transferred:       {}", format_bytes(summary.bytes));
    println!("  Time:              {}", format_duration(elapsed));
    if summary.verified > 0 || summary.corrupt > 0 {
        println!("  Verified:          {}", summary.verified);
        println!("  Payloads:          {}", summary.payloads);
    }
    if summary.corrupt > 0 {
        println!("  Corrupt (deleted): {}", style(summary.corrupt).red());
    }
    if summary.cancelled {
        println!("  {}", style("Interrupted; run again to resume").yellow());
    }
    println!("{SEPARATOR}");
}

/// Prints the result of a verification batch.
pub fn print_verify_summary(summary: &VerifySummary) {
    heading("Verification Summary");
    println!("  Checked:           {}", summary.checked);
    println!("  Passed:            {}", style(summary.passed).green());
    if summary.failed > 0 {
        println!(
            "  Failed:            {} (deleted, queued for download)",
            style(summary.failed).red()
        );
    }
    if summary.cancelled {
        println!("  {}", style("Interrupted; run again to resume").yellow());
    }
    println!("{SEPARATOR}");
}

/// Prints the result of an extraction batch.
pub fn print_extract_summary(summary: &ExtractSummary) {
    heading("Extraction Summary");
    println!("  Archives:          {}", summary.archives);
    println!("  Payloads:          {}", summary.payloads);
    println!("  Newly extracted:   {}", summary.newly_extracted);
    println!("  Already present:   {}", summary.already_present);
    if summary.unsafe_members > 0 {
        println!("  Unsafe members:    {}", style(summary.unsafe_members).red());
    }
    if summary.rejected_members > 0 {
        println!("  Rejected members:  {}", summary.rejected_members);
    }
    if summary.failed > 0 {
        println!("  Failed archives:   {}", style(summary.failed).red());
    }
    if summary.cancelled {
        println!("  {}", style("Interrupted; run again to resume").yellow());
    }
    println!("{SEPARATOR}");
}

/// Prints ledger status.
pub fn print_status(report: &StatusReport, state_file: &Path) {
    heading("Harvest Status");
    println!("  State file:        {}", state_file.display());
    println!("  Packages:          {}", report.packages.total);
    println!("    downloaded:      {}", report.packages.downloaded);
    println!("    verified:        {}", report.packages.verified);
    println!("    extracted:       {}", report.packages.extracted);
    println!("    pending:         {}", report.packages.pending);
    println!("  Payloads:          {}", report.payloads.total);
    println!(
        "  Bytes:             {} of {}",
        format_bytes(report.bytes.downloaded),
        format_bytes(report.bytes.total)
    );
    if !report.errors.is_empty() {
        println!("  Recent errors:     {}", style(report.errors.len()).red());
        for error in report.errors.iter().rev().take(5) {
            println!("    {error}");
        }
    }
    println!("{SEPARATOR}");
}

/// Prints the remaining-time projection.
pub fn print_estimate(estimate: &Estimate) {
    heading("Estimate");
    match estimate {
        Estimate::NotEstimable => {
            println!("  Not enough data yet; download at least one package first.");
        }
        Estimate::Estimable {
            elapsed,
            remaining_packages,
            packages_per_hour,
            remaining_time,
        } => {
            println!("  Elapsed:           {}", format_duration(*elapsed));
            println!("  Rate:              {packages_per_hour:.1} packages/hour");
            println!("  Remaining:         {remaining_packages} package(s)");
            println!("  Time remaining:    {}", format_duration(*remaining_time));
        }
    }
    println!("{SEPARATOR}");
}

/// Prints where an item lives.
pub fn print_find(result: &FindResult) {
    heading(&format!("Item {}", result.item_id));
    match &result.package {
        Some(package) => {
            println!("  Package:           {}", package.filename);
            println!(
                "  Covers:            {}-{}",
                package.item_id_start, package.item_id_end
            );
            println!("  Stage:             {:?}", package.stage());
        }
        None => println!("  Package:           {}", style("not in ledger").yellow()),
    }
    if result.payload_present {
        println!("  Payload:           {}", result.payload_path.display());
    } else {
        println!(
            "  Payload:           {} (expected at {})",
            style("missing").yellow(),
            result.payload_path.display()
        );
    }
    println!("{SEPARATOR}");
}
