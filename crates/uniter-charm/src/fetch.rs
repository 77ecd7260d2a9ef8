//! Downloading charm bundles from the package repository.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CharmError, Result};

// ============================================================================
// BundleFetcher Trait
// ============================================================================

/// Retrieves charm bundles by URL.
///
/// Implementations do not retry; callers decide based on
/// [`CharmError::is_retriable`].
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    /// Download the bundle at `url`.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Download` if the repository answers with an
    /// unsuccessful status, or `CharmError::Connection` if it cannot be
    /// reached.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// Fetches bundles over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Connection` if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CharmError::Connection {
                url: String::new(),
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Create a fetcher with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BundleFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let connection = |e: reqwest::Error| CharmError::Connection {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(connection)?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %url, status = %status, "Charm download failed");
            return Err(CharmError::Download {
                url: url.to_string(),
                status,
            });
        }

        let body = response.bytes().await.map_err(connection)?;
        tracing::debug!(url = %url, bytes = body.len(), "Downloaded charm bundle");
        Ok(body.to_vec())
    }
}

// ============================================================================
// In-memory Implementation
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! An in-memory fetcher for tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::BundleFetcher;
    use crate::error::{CharmError, Result};

    /// Serves bundles from memory.
    ///
    /// Unknown URLs answer 404. A number of transient 503 failures can be
    /// queued to exercise retry paths.
    #[derive(Debug, Default)]
    pub struct MemoryFetcher {
        bundles: Mutex<HashMap<String, Vec<u8>>>,
        transient_failures: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl MemoryFetcher {
        /// Create an empty fetcher.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Serve `bundle` at `url`.
        pub fn insert(&self, url: impl Into<String>, bundle: Vec<u8>) {
            self.bundles.lock().insert(url.into(), bundle);
        }

        /// Fail the next `count` fetches with a retriable error.
        pub fn fail_next(&self, count: usize) {
            self.transient_failures.store(count, Ordering::SeqCst);
        }

        /// How many fetches have been attempted.
        #[must_use]
        pub fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BundleFetcher for MemoryFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(CharmError::Download {
                    url: url.to_string(),
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                });
            }
            self.bundles
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| CharmError::Download {
                    url: url.to_string(),
                    status: reqwest::StatusCode::NOT_FOUND,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MemoryFetcher;
    use super::*;
    use crate::bundle::{verify_sha256, BundleBuilder};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_fetch_success() {
        let server = MockServer::start().await;
        let bundle = BundleBuilder::new().file("revision", "0\n").build();
        Mock::given(method("GET"))
            .and(path("/charms/dummy-0.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bundle.clone()))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/charms/dummy-0.tar.gz", server.uri());
        let body = fetcher.fetch(&url).await.unwrap();
        assert_eq!(body, bundle);
        verify_sha256(&body, &crate::bundle::sha256_hex(&bundle)).unwrap();
    }

    #[tokio::test]
    async fn http_not_found_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CharmError::Download { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn http_server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch(&format!("{}/busy", server.uri()))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn memory_fetcher_transient_failures() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("mem://c-0", b"bytes".to_vec());
        fetcher.fail_next(2);

        assert!(fetcher.fetch("mem://c-0").await.unwrap_err().is_retriable());
        assert!(fetcher.fetch("mem://c-0").await.unwrap_err().is_retriable());
        assert_eq!(fetcher.fetch("mem://c-0").await.unwrap(), b"bytes");
        assert!(!fetcher.fetch("mem://other").await.unwrap_err().is_retriable());
        assert_eq!(fetcher.fetches(), 4);
    }
}
