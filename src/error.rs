//! Error types for the pmc-harvest library.

use thiserror::Error;

/// Errors that can occur while scanning, downloading, verifying or
/// extracting archive packages.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure (connection refused, DNS, reset, body read).
    #[error("network error for {url}: {reason}")]
    Network {
        /// URL being fetched.
        url: String,
        /// Underlying failure description.
        reason: String,
    },

    /// Server answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// URL being fetched.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// Request exceeded the configured per-request timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout {
        /// URL being fetched.
        url: String,
        /// Configured timeout.
        timeout_secs: u64,
    },

    /// Transfer completed but produced zero bytes.
    #[error("empty payload from {url}")]
    EmptyPayload {
        /// URL being fetched.
        url: String,
    },

    /// Archive failed structural verification.
    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive {
        /// Local archive path.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Archive member path would escape the extraction root.
    #[error("unsafe member path: {0}")]
    UnsafeMemberPath(String),

    /// Item identifier outside the accepted bounds.
    #[error("identifier {id} outside [{min}, {max}]")]
    OutOfRange {
        /// Rejected identifier.
        id: u64,
        /// Lower bound.
        min: u64,
        /// Upper bound.
        max: u64,
    },

    /// Package filename that cannot be used as a local file name.
    #[error("invalid package filename: {0}")]
    InvalidFilename(String),

    /// Catalog listing could not be fetched or parsed.
    #[error("catalog listing failed: {0}")]
    Catalog(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State file could not be encoded or decoded.
    #[error("state file error: {0}")]
    State(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    /// Archive container error.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns true for failures worth another attempt after a backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::EmptyPayload { .. }
            | Self::Http(_) => true,
            Self::HttpStatus { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true when the server refused to serve this client.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 403 | 429, .. })
    }

    /// Returns true for failures below HTTP (no response received).
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Http(_)
        )
    }
}

/// A specialized `Result` type for pmc-harvest operations.
pub type Result<T> = std::result::Result<T, Error>;
