//! Raw page fetching
//!
//! [`HttpFetcher`] paces requests to the source site. [`CachingFetcher`]
//! wraps any fetcher with an on-disk page cache keyed by the SHA-256 of the
//! URL, so reruns over old seasons do not hit the site again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Smallest resumable slice of a dataset (for example one season)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceUnit {
    pub dataset: String,
    pub key: String,
    pub url: String,
}

impl SourceUnit {
    /// Build a unit, substituting `{unit}` in the dataset URL template
    pub fn from_template(dataset: &str, key: &str, url_template: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            key: key.to_string(),
            url: url_template.replace("{unit}", key),
        }
    }
}

/// Fetches the raw page of a source unit
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError>;
}

/// HTTP fetcher with a minimum delay between requests
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str, request_delay: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            request_delay,
            last_request: Mutex::new(None),
        })
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.request_delay;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError> {
        let url = reqwest::Url::parse(&unit.url)
            .map_err(|e| FetchError::InvalidRequest(format!("invalid URL '{}': {}", unit.url, e)))?;
        self.pace().await;

        debug!(dataset = %unit.dataset, unit = %unit.key, url = %url, "Fetching page");
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: unit.url.clone(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: unit.url.clone(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(transport)
    }
}

/// Disk cache in front of another fetcher
pub struct CachingFetcher {
    inner: Arc<dyn Fetcher>,
    dir: PathBuf,
    max_age: Duration,
    refresh: bool,
}

impl CachingFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            inner,
            dir: dir.into(),
            max_age,
            refresh: false,
        }
    }

    /// Ignore cached pages, still writing fresh ones
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Cache file for a URL
    pub fn cache_path(&self, url: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(url.as_bytes()));
        self.dir.join(format!("{}.html", hash))
    }

    async fn read_fresh(&self, path: &Path) -> Option<String> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        if age >= self.max_age {
            debug!(path = %path.display(), age_secs = age.as_secs(), "Cached page expired");
            return None;
        }
        tokio::fs::read_to_string(path).await.ok()
    }

    async fn write(&self, path: &Path, page: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("html.tmp");
        tokio::fs::write(&tmp, page).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[async_trait]
impl Fetcher for CachingFetcher {
    async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError> {
        let path = self.cache_path(&unit.url);
        if !self.refresh {
            if let Some(page) = self.read_fresh(&path).await {
                debug!(dataset = %unit.dataset, unit = %unit.key, "Cache hit");
                return Ok(page);
            }
        }

        let page = self.inner.fetch(unit).await?;
        if let Err(e) = self.write(&path, &page).await {
            warn!(path = %path.display(), error = %e, "Failed to cache page");
        }
        Ok(page)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Counting(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Fetcher for Counting {
        async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(format!("<p>{} #{}</p>", unit.key, n))
        }
    }

    #[test]
    fn test_url_template() {
        let unit = SourceUnit::from_template(
            "team_season",
            "2024",
            "https://stats.example/leagues/NBA_{unit}.html",
        );
        assert_eq!(unit.url, "https://stats.example/leagues/NBA_2024.html");
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retryable() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1), "statbucket-test", Duration::ZERO)
            .unwrap_or_else(|e| panic!("{}", e));
        let unit = SourceUnit::from_template("team_season", "2024", "not a url/{unit}");
        let err = fetcher.fetch(&unit).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cache_serves_second_fetch_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(Counting(Default::default()));
        let fetcher = CachingFetcher::new(inner.clone(), dir.path().join("pages"), Duration::from_secs(60));
        let unit = SourceUnit::from_template("team_season", "2024", "https://stats.example/NBA_{unit}.html");

        let first = fetcher.fetch(&unit).await.unwrap();
        let second = fetcher.fetch(&unit).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(fetcher.cache_path(&unit.url).exists());

        let refreshed = CachingFetcher::new(inner.clone(), dir.path().join("pages"), Duration::from_secs(60))
            .refresh(true)
            .fetch(&unit)
            .await
            .unwrap();
        assert_eq!(refreshed, "<p>2024 #1</p>");
    }

    #[test]
    fn test_cache_path_is_url_hash() {
        let fetcher = CachingFetcher::new(Arc::new(Counting(Default::default())), "/cache", Duration::ZERO);
        let path = fetcher.cache_path("https://stats.example/NBA_2024.html");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".html".len());
        assert_ne!(path, fetcher.cache_path("https://stats.example/NBA_2023.html"));
    }
}
