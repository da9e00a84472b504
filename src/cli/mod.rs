//! CLI mode for pmc-harvest: subcommands over the harvest pipeline.

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;

use crate::bounds::IdRange;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::fetch::{DefaultFetcher, build_fetcher};
use crate::harvest::{DownloadRequest, Harvester};

use progress::{
    PackageBar, make_scan_bar, print_download_summary, print_estimate, print_extract_summary,
    print_find, print_scan_summary, print_status, print_verify_summary,
};

/// Exit status for an interrupted run.
const EXIT_INTERRUPTED: u8 = 130;
/// Exit status when verification found corrupt archives.
const EXIT_VERIFY_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "pmc-harvest",
    version,
    about = "Resumable bulk harvester for the Europe PMC PDF mirror",
    long_about = None
)]
pub struct Cli {
    /// Directory holding packages/, payload/ and the state file
    #[arg(long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Mirror root URL
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Contact address sent in the User-Agent
    #[arg(long, global = true, value_name = "EMAIL")]
    pub contact_email: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan the catalog and record the packages in range
    List {
        /// Visit at most N shards
        #[arg(long, value_name = "N")]
        max_shards: Option<usize>,
        /// Identifier range to keep (repeatable)
        #[arg(long = "range", value_name = "START-END")]
        ranges: Vec<String>,
    },
    /// Download pending packages (scanning first if the ledger is empty)
    Download {
        /// Download at most N packages
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Seconds between two download starts
        #[arg(long, value_name = "SECS")]
        delay: Option<u64>,
        /// Identifier range to keep (repeatable)
        #[arg(long = "range", value_name = "START-END")]
        ranges: Vec<String>,
        /// Attempts per package
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,
        /// Skip verification and extraction after each download
        #[arg(long)]
        no_extract: bool,
        /// Visit at most N shards when scanning
        #[arg(long, value_name = "N")]
        max_shards: Option<usize>,
        /// Scan the catalog again before downloading
        #[arg(long)]
        rescan: bool,
    },
    /// Show ledger counts
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Verify downloaded archives
    Verify,
    /// Extract payloads from verified archives
    Extract,
    /// Project the remaining download time
    Estimate,
    /// Locate an item's package and payload
    Find {
        #[arg(long, value_name = "N")]
        item_id: u64,
    },
}

/// How a successful command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Interrupted,
    VerifyFailed,
}

/// Parses arguments, runs the command and maps the result to an exit code.
pub async fn run() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Received SIGINT, stopping after the current item");
            token.cancel();
        }
    });

    match execute(cli, &cancel).await {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::VerifyFailed) => ExitCode::from(EXIT_VERIFY_FAILED),
        Ok(Outcome::Interrupted) | Err(Error::Cancelled) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "info,pmc_harvest=debug",
        _ => "info,pmc_harvest=trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_secs()
        .init();
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<IdRange>> {
    ranges.iter().map(|r| r.parse()).collect()
}

/// Loads the config file and layers command-line overrides on top.
fn build_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir.clone_from(dir);
    }
    if let Some(url) = &cli.base_url {
        config.catalog.base_url.clone_from(url);
    }
    if let Some(email) = &cli.contact_email {
        config.catalog.contact_email = Some(email.clone());
    }

    match &cli.command {
        Command::List { ranges, .. } if !ranges.is_empty() => {
            config.id_ranges = parse_ranges(ranges)?;
        }
        Command::Download {
            delay,
            ranges,
            max_retries,
            ..
        } => {
            if let Some(secs) = delay {
                config.download = config
                    .download
                    .with_delay_between_files(Duration::from_secs(*secs));
            }
            if let Some(retries) = max_retries {
                config.download = config.download.with_max_retries(*retries);
            }
            if !ranges.is_empty() {
                config.id_ranges = parse_ranges(ranges)?;
            }
        }
        _ => {}
    }
    Ok(config)
}

/// Runs a catalog scan with a progress bar. Returns false if it was
/// interrupted.
async fn scan(
    harvester: &mut Harvester<DefaultFetcher>,
    max_shards: Option<usize>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let bar = make_scan_bar();
    bar.enable_steady_tick(Duration::from_millis(250));
    let result = harvester
        .scan(max_shards, cancel, |index, count, shard, found| {
            bar.set_length(count as u64);
            bar.set_position(index as u64);
            bar.set_message(format!("{shard} ({found} in range)"));
        })
        .await;
    bar.finish_and_clear();
    let summary = result?;
    print_scan_summary(&summary);
    if harvester.fetcher().using_alternate() {
        log::info!("Catalog requests are using the compatibility client");
    }
    Ok(!summary.cancelled)
}

async fn execute(cli: Cli, cancel: &CancellationToken) -> Result<Outcome> {
    let config = build_config(&cli)?;
    let fetcher = build_fetcher(&config.catalog)?;
    let mut harvester = Harvester::open(fetcher, config)?;
    let state_path = harvester.ledger().path().to_path_buf();

    let outcome = match cli.command {
        Command::List { max_shards, .. } => {
            let completed = scan(&mut harvester, max_shards, cancel).await?;
            print_status(&harvester.status(), &state_path);
            if completed {
                Outcome::Done
            } else {
                Outcome::Interrupted
            }
        }
        Command::Download {
            limit,
            no_extract,
            max_shards,
            rescan,
            ..
        } => {
            if (rescan || harvester.ledger().is_empty())
                && !scan(&mut harvester, max_shards, cancel).await?
            {
                return Ok(Outcome::Interrupted);
            }
            let request = DownloadRequest {
                limit,
                extract: !no_extract && harvester.config().download.extract_after_download,
            };
            let started = Instant::now();
            let bar = PackageBar::new();
            let summary = harvester.download_packages(&request, &bar, cancel).await?;
            print_download_summary(&summary, started.elapsed());
            if summary.cancelled {
                Outcome::Interrupted
            } else {
                Outcome::Done
            }
        }
        Command::Status { json } => {
            let report = harvester.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report, &state_path);
            }
            Outcome::Done
        }
        Command::Verify => {
            let summary = harvester
                .verify_all_downloads(&PackageBar::new(), cancel)
                .await?;
            print_verify_summary(&summary);
            if summary.cancelled {
                Outcome::Interrupted
            } else if summary.failed > 0 {
                Outcome::VerifyFailed
            } else {
                Outcome::Done
            }
        }
        Command::Extract => {
            let summary = harvester
                .extract_all_payloads(&PackageBar::new(), cancel)
                .await?;
            print_extract_summary(&summary);
            if summary.cancelled {
                Outcome::Interrupted
            } else {
                Outcome::Done
            }
        }
        Command::Estimate => {
            print_estimate(&harvester.estimate());
            Outcome::Done
        }
        Command::Find { item_id } => {
            print_find(&harvester.find(item_id)?);
            Outcome::Done
        }
    };
    Ok(outcome)
}
