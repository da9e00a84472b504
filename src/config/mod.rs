//! Configuration types for catalog scanning, downloads and output layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bounds::{IdRange, validate_range};
use crate::error::{Error, Result};

/// Default Europe PMC PDF mirror root.
pub const DEFAULT_BASE_URL: &str = "https://europepmc.org/ftp/pdf/";

/// Default ledger file name inside the output directory.
pub const DEFAULT_STATE_FILE: &str = "harvest_state.json";

/// Upper bound for configured delays, in seconds (one day).
pub const MAX_DELAY_SECS: u64 = 86_400;

/// Which HTTP client implementation serves catalog and package requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Only the primary pooled client.
    Primary,
    /// Only the HTTP/1.1 compatibility client.
    Alternate,
    /// Primary first, switching to the alternate client once the primary is blocked.
    #[default]
    Auto,
}

/// Configuration for the remote catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Root URL of the mirror (shard directories live below it).
    pub base_url: String,
    /// Contact address advertised in the `User-Agent`.
    pub contact_email: Option<String>,
    /// Client selection policy.
    pub fetch_strategy: FetchStrategy,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Cap on shards visited per scan.
    pub max_shards: Option<usize>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            contact_email: None,
            fetch_strategy: FetchStrategy::Auto,
            request_timeout_secs: 300,
            max_shards: None,
        }
    }
}

impl CatalogConfig {
    /// Returns the `User-Agent` header value sent with every request.
    #[must_use]
    pub fn user_agent(&self) -> String {
        let base = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        match self.contact_email.as_deref().filter(|e| !e.is_empty()) {
            Some(email) => format!("{base} (+mailto:{email})"),
            None => base,
        }
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration for download operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Attempts per package before giving up for this run.
    pub max_retries: u32,
    /// Minimum spacing between two download starts, in seconds.
    pub delay_between_files_secs: u64,
    /// Backoff unit; attempt `n` waits `n` units plus jitter.
    pub retry_base_delay_secs: u64,
    /// Jitter as a fraction of the backoff delay.
    pub jitter_factor: f64,
    /// Whether each package is verified and extracted right after download.
    pub extract_after_download: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_between_files_secs: 30,
            retry_base_delay_secs: 5,
            jitter_factor: 0.5,
            extract_after_download: true,
        }
    }
}

impl DownloadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of attempts per package.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the politeness delay between downloads.
    #[must_use]
    pub const fn with_delay_between_files(mut self, delay: Duration) -> Self {
        self.delay_between_files_secs = delay.as_secs();
        self
    }

    /// Sets the backoff unit.
    #[must_use]
    pub const fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_secs = delay.as_secs();
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub const fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Sets whether packages are extracted straight after download.
    #[must_use]
    pub const fn with_extract_after_download(mut self, extract: bool) -> Self {
        self.extract_after_download = extract;
        self
    }

    /// Returns the politeness delay.
    #[must_use]
    pub const fn delay_between_files(&self) -> Duration {
        Duration::from_secs(self.delay_between_files_secs)
    }

    /// Returns the backoff unit.
    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    /// Attempts per package, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Output layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root of everything this tool writes.
    pub output_dir: PathBuf,
    /// Ledger file name, relative to `output_dir`.
    pub state_file: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            state_file: DEFAULT_STATE_FILE.to_string(),
        }
    }
}

impl PathConfig {
    /// Directory holding raw downloaded archives.
    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.output_dir.join("packages")
    }

    /// Root of the sharded payload tree.
    #[must_use]
    pub fn payload_dir(&self) -> PathBuf {
        self.output_dir.join("payload")
    }

    /// Full path of the ledger file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join(&self.state_file)
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote catalog settings.
    pub catalog: CatalogConfig,
    /// Download settings.
    pub download: DownloadConfig,
    /// Output layout.
    pub paths: PathConfig,
    /// Identifier ranges to retain; empty retains everything.
    pub id_ranges: Vec<IdRange>,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the default config file location, `<config_dir>/pmc-harvest/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(env!("CARGO_PKG_NAME")).join("config.toml"))
    }

    /// Loads configuration from `path`, or from [`Self::default_path`] if it
    /// exists, or falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file is missing, or any file
    /// read cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };
        let Some(file) = candidate else {
            return Ok(Self::default());
        };
        log::debug!("Loading configuration from {}", file.display());
        let contents = std::fs::read_to_string(&file)?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Checks every field that has constraints. Out-of-range identifier
    /// ranges are fatal here, unlike during scanning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&mut self) -> Result<()> {
        if self.catalog.base_url.trim().is_empty() {
            return Err(Error::Config("catalog.base_url must not be empty".into()));
        }
        if !self.catalog.base_url.starts_with("http://")
            && !self.catalog.base_url.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "catalog.base_url must be an http(s) URL, got {:?}",
                self.catalog.base_url
            )));
        }
        if self.catalog.request_timeout_secs == 0 {
            return Err(Error::Config("catalog.request_timeout_secs must be > 0".into()));
        }
        if self.download.max_retries == 0 {
            return Err(Error::Config("download.max_retries must be >= 1".into()));
        }
        for (field, secs) in [
            ("delay_between_files_secs", self.download.delay_between_files_secs),
            ("retry_base_delay_secs", self.download.retry_base_delay_secs),
        ] {
            if secs > MAX_DELAY_SECS {
                return Err(Error::Config(format!(
                    "download.{field} must be <= {MAX_DELAY_SECS}, got {secs}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.download.jitter_factor) {
            return Err(Error::Config(format!(
                "download.jitter_factor must be within [0, 1], got {}",
                self.download.jitter_factor
            )));
        }
        if self.paths.state_file.is_empty() || self.paths.state_file.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "paths.state_file must be a plain file name, got {:?}",
                self.paths.state_file
            )));
        }

        let mut ranges = Vec::with_capacity(self.id_ranges.len());
        for r in &self.id_ranges {
            let checked = validate_range(r.start, r.end)
                .map_err(|e| Error::Config(format!("id range {r}: {e}")))?;
            ranges.push(checked);
        }
        self.id_ranges = ranges;
        Ok(())
    }
}
