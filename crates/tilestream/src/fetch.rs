//! Transports that produce raw tile payloads for the download queue.
//!
//! # Implementations
//!
//! - [`HttpFetcher`]: HTTP(S) via reqwest
//! - [`FileFetcher`]: local filesystem via Tokio
//! - [`MemoryFetcher`]: in-memory map, useful for tests and demos

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::runtime::JobFuture;

/// Fetches raw bytes for a content locator.
///
/// The returned future must own everything it needs, since it runs as a
/// background task after `fetch` returns.
pub trait Fetcher: Send + Sync + 'static {
    /// Start fetching `uri`.
    fn fetch(&self, uri: &str) -> JobFuture<Vec<u8>>;
}

/// Fetches content over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher with a custom HTTP client.
    #[must_use]
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch a URL once, outside of any queue. Used to read the manifest.
    pub async fn get(&self, url: &str) -> crate::Result<Vec<u8>> {
        fetch_url(self.http.clone(), url.to_string()).await
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, uri: &str) -> JobFuture<Vec<u8>> {
        Box::pin(fetch_url(self.http.clone(), uri.to_string()))
    }
}

async fn fetch_url(http: reqwest::Client, url: String) -> crate::Result<Vec<u8>> {
    tracing::debug!(url, "fetching");

    let response = http.get(&url).send().await.map_err(|e| Error::Http {
        url: url.clone(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            url,
            status: status.as_u16(),
        });
    }

    let data = response.bytes().await.map_err(|e| Error::Http {
        url: url.clone(),
        message: e.to_string(),
    })?;
    Ok(data.to_vec())
}

/// Reads content from the filesystem. Relative locators are resolved
/// against `root`.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    /// Create a fetcher rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, uri: &str) -> JobFuture<Vec<u8>> {
        let path = self.root.join(uri.strip_prefix("file://").unwrap_or(uri));
        Box::pin(async move {
            tokio::fs::read(&path).await.map_err(|e| Error::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        })
    }
}

/// Serves content from memory.
///
/// Clones share the same storage, so a test can keep a handle and add
/// payloads after handing the fetcher to a tileset.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    inner: Arc<RwLock<MemoryFetcherInner>>,
}

#[derive(Debug, Default)]
struct MemoryFetcherInner {
    entries: HashMap<String, Vec<u8>>,
    requests: Vec<String>,
}

impl MemoryFetcher {
    /// Create an empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload for `uri`.
    pub fn insert(&self, uri: impl Into<String>, data: Vec<u8>) {
        self.write().entries.insert(uri.into(), data);
    }

    /// Remove the payload for `uri`; later fetches fail with
    /// [`Error::NotFound`].
    pub fn remove(&self, uri: &str) {
        self.write().entries.remove(uri);
    }

    /// Every locator requested so far, in request order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.read().requests.clone()
    }

    /// How many times `uri` was requested.
    #[must_use]
    pub fn request_count(&self, uri: &str) -> usize {
        self.read().requests.iter().filter(|r| *r == uri).count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryFetcherInner> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryFetcherInner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, uri: &str) -> JobFuture<Vec<u8>> {
        let result = {
            let mut inner = self.write();
            inner.requests.push(uri.to_string());
            inner.entries.get(uri).cloned().ok_or_else(|| Error::NotFound {
                uri: uri.to_string(),
            })
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fetcher() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("a.b3dm", vec![1, 2, 3]);

        assert_eq!(fetcher.fetch("a.b3dm").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            fetcher.fetch("b.b3dm").await.unwrap_err(),
            Error::NotFound {
                uri: "b.b3dm".to_string()
            }
        );
        assert_eq!(fetcher.request_count("a.b3dm"), 1);
        assert_eq!(fetcher.requests(), vec!["a.b3dm", "b.b3dm"]);

        fetcher.remove("a.b3dm");
        assert!(fetcher.fetch("a.b3dm").await.is_err());
    }

    #[tokio::test]
    async fn test_file_fetcher_reports_missing_files() {
        let fetcher = FileFetcher::new(std::env::temp_dir());
        let err = fetcher
            .fetch("tilestream-definitely-missing.b3dm")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_files() {
        let dir = std::env::temp_dir().join(format!("tilestream-fetch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tile.pnts"), b"pnts").unwrap();

        let fetcher = FileFetcher::new(&dir);
        assert_eq!(fetcher.fetch("tile.pnts").await.unwrap(), b"pnts");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
