//! Byte-level network fetches.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CacheError, FetchError};

/// Downloads the raw bytes behind a URL.
///
/// Cancellation is cooperative: the coordinator drops the `fetch` future
/// when the fetch is cancelled, so implementations must not rely on running
/// to completion.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError>;

    /// Called after every in-flight fetch has been cancelled, so later
    /// fetches start from a clean execution context.
    fn reset(&self) {}
}

/// `reqwest`-backed transport with connection pooling.
pub struct HttpTransport {
    client: RwLock<Client>,
    timeout: Option<Duration>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self, CacheError> {
        let client = Self::build_client(timeout)
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        Ok(Self {
            client: RwLock::new(client),
            timeout,
        })
    }

    fn build_client(timeout: Option<Duration>) -> reqwest::Result<Client> {
        let mut builder = Client::builder().pool_max_idle_per_host(10);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let client = self.client.read().clone();

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        debug!(url = %url, len = bytes.len(), "fetched image bytes");
        Ok(bytes.to_vec())
    }

    fn reset(&self) {
        // Dropping the old client tears down its idle connection pool.
        match Self::build_client(self.timeout) {
            Ok(client) => *self.client.write() = client,
            Err(err) => {
                warn!(
                    %err,
                    "failed to rebuild HTTP client; keeping the old one"
                )
            }
        }
    }
}
