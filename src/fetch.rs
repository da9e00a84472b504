//! HTTP fetch abstraction.
//!
//! Catalog listings and package archives are both retrieved through the
//! [`Fetcher`] trait so the driver can own a single injected client and tests
//! can substitute a scripted one. Two real implementations exist:
//!
//! - [`HttpFetcher`]: pooled, HTTP/2-capable client, used first.
//! - [`CompatFetcher`]: HTTP/1.1-only client sending browser-style headers,
//!   for mirrors that refuse the primary client.
//!
//! [`FallbackFetcher`] combines them according to a [`FetchStrategy`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use tokio::io::AsyncWriteExt;

use crate::config::{CatalogConfig, FetchStrategy};
use crate::error::{Error, Result};

/// Source of remote listings and archives.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches a listing page as text.
    async fn fetch_text(&self, url: &str) -> Result<String>;

    /// Streams `url` into `dest`, creating or truncating it.
    ///
    /// Returns the number of bytes written.
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64>;

    /// Short name used in log messages.
    fn name(&self) -> &'static str;
}

/// Converts a `reqwest` error into the crate taxonomy.
fn classify(url: &str, timeout: Duration, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            url: url.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    } else if let Some(status) = e.status() {
        Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        Error::Network {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Sends a GET and rejects non-2xx responses.
async fn get_checked(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify(url, timeout, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// Streams a response body into `dest` chunk by chunk.
async fn stream_to_file(
    mut response: reqwest::Response,
    url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| classify(url, timeout, &e))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Primary HTTP client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Builds the primary client from catalog settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(2)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = get_checked(&self.client, url, self.timeout).await?;
        response
            .text()
            .await
            .map_err(|e| classify(url, self.timeout, &e))
    }

    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = get_checked(&self.client, url, self.timeout).await?;
        stream_to_file(response, url, dest, self.timeout).await
    }

    fn name(&self) -> &'static str {
        "primary"
    }
}

/// Alternate HTTP/1.1 client with browser-style request headers.
#[derive(Debug, Clone)]
pub struct CompatFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl CompatFetcher {
    /// Builds the compatibility client from catalog settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/zip,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        // Slower mirrors answer the alternate path; give it extra headroom.
        let timeout = config.request_timeout() + config.request_timeout() / 2;
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .default_headers(headers)
            .http1_only()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Fetcher for CompatFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = get_checked(&self.client, url, self.timeout).await?;
        response
            .text()
            .await
            .map_err(|e| classify(url, self.timeout, &e))
    }

    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = get_checked(&self.client, url, self.timeout).await?;
        stream_to_file(response, url, dest, self.timeout).await
    }

    fn name(&self) -> &'static str {
        "alternate"
    }
}

/// Combines a primary and an alternate fetcher.
///
/// Under [`FetchStrategy::Auto`] a blocked (403/429) or transport-level
/// failure of the primary triggers one attempt with the alternate; after the
/// first such switch the alternate serves all later requests.
pub struct FallbackFetcher<P: Fetcher, A: Fetcher> {
    primary: P,
    alternate: A,
    strategy: FetchStrategy,
    switched: AtomicBool,
}

impl<P: Fetcher, A: Fetcher> FallbackFetcher<P, A> {
    /// Creates a fetcher that follows `strategy`.
    pub const fn new(primary: P, alternate: A, strategy: FetchStrategy) -> Self {
        Self {
            primary,
            alternate,
            strategy,
            switched: AtomicBool::new(false),
        }
    }

    /// Returns true once requests are served by the alternate fetcher.
    pub fn using_alternate(&self) -> bool {
        match self.strategy {
            FetchStrategy::Primary => false,
            FetchStrategy::Alternate => true,
            FetchStrategy::Auto => self.switched.load(Ordering::Relaxed),
        }
    }

    /// Decides whether a primary failure should be retried on the alternate.
    fn should_fall_back(&self, err: &Error) -> bool {
        self.strategy == FetchStrategy::Auto && (err.is_blocked() || err.is_transport())
    }

    fn switch(&self, url: &str, err: &Error) {
        if !self.switched.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Primary client failed for {url} ({err}), switching to {} client",
                self.alternate.name()
            );
        }
    }
}

#[async_trait]
impl<P: Fetcher, A: Fetcher> Fetcher for FallbackFetcher<P, A> {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        if self.using_alternate() {
            return self.alternate.fetch_text(url).await;
        }
        match self.primary.fetch_text(url).await {
            Err(e) if self.should_fall_back(&e) => {
                self.switch(url, &e);
                self.alternate.fetch_text(url).await
            }
            other => other,
        }
    }

    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        if self.using_alternate() {
            return self.alternate.fetch_to_file(url, dest).await;
        }
        match self.primary.fetch_to_file(url, dest).await {
            Err(e) if self.should_fall_back(&e) => {
                self.switch(url, &e);
                self.alternate.fetch_to_file(url, dest).await
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        if self.using_alternate() {
            self.alternate.name()
        } else {
            self.primary.name()
        }
    }
}

/// The fetcher type the CLI builds.
pub type DefaultFetcher = FallbackFetcher<HttpFetcher, CompatFetcher>;

/// Builds the primary/alternate pair described by `config`.
///
/// # Errors
///
/// Returns an error if either HTTP client cannot be constructed.
pub fn build_fetcher(config: &CatalogConfig) -> Result<DefaultFetcher> {
    Ok(FallbackFetcher::new(
        HttpFetcher::new(config)?,
        CompatFetcher::new(config)?,
        config.fetch_strategy,
    ))
}
