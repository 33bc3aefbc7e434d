//! HTTP fetcher tests against a local mock server

mod common;

use common::{base_season, definition, fast_settings, init_tracing, DATASET};
use statbucket_ingest::error::FetchError;
use statbucket_ingest::pipeline::{
    CachingFetcher, Fetcher, HttpFetcher, PersistTarget, RunOptions, RunStatus, SourceUnit,
};
use statbucket_ingest::store::MemoryStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER_AGENT: &str = "statbucket-test/1.0";

fn fetcher(delay: Duration) -> anyhow::Result<HttpFetcher> {
    Ok(HttpFetcher::new(Duration::from_secs(5), USER_AGENT, delay)?)
}

fn unit(server: &MockServer, key: &str) -> SourceUnit {
    SourceUnit::from_template(DATASET, key, &format!("{}/leagues/NBA_{{unit}}.html", server.uri()))
}

#[tokio::test]
async fn test_fetches_page_body() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/leagues/NBA_2024.html"))
        .and(header("user-agent", USER_AGENT))
        .respond_with(ResponseTemplate::new(200).set_body_string(base_season(2024)))
        .expect(1)
        .mount(&server)
        .await;

    let body = fetcher(Duration::ZERO)?.fetch(&unit(&server, "2024")).await?;
    assert!(body.contains("Boston Celtics"));
    Ok(())
}

#[tokio::test]
async fn test_status_classification() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(path("/leagues/NBA_1900.html"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/leagues/NBA_2024.html"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/leagues/NBA_2025.html"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let fetcher = fetcher(Duration::ZERO)?;

    let missing = fetcher.fetch(&unit(&server, "1900")).await.unwrap_err();
    assert!(matches!(missing, FetchError::Status { status: 404, .. }));
    assert!(!missing.is_retryable());

    let unavailable = fetcher.fetch(&unit(&server, "2024")).await.unwrap_err();
    assert!(matches!(unavailable, FetchError::Status { status: 503, .. }));
    assert!(unavailable.is_retryable());

    let throttled = fetcher.fetch(&unit(&server, "2025")).await.unwrap_err();
    assert!(throttled.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_invalid_url_is_not_retryable() -> anyhow::Result<()> {
    let fetcher = fetcher(Duration::ZERO)?;
    let err = fetcher
        .fetch(&SourceUnit::from_template(DATASET, "2024", "not a url/{unit}"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidRequest(_)));
    assert!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_requests_are_paced() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<table></table>"))
        .expect(3)
        .mount(&server)
        .await;
    let fetcher = fetcher(Duration::from_millis(150))?;

    let started = Instant::now();
    for key in ["2022", "2023", "2024"] {
        fetcher.fetch(&unit(&server, key)).await?;
    }
    assert!(started.elapsed() >= Duration::from_millis(300));
    Ok(())
}

#[tokio::test]
async fn test_run_over_http() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    for year in [2024u32, 2025] {
        Mock::given(method("GET"))
            .and(path(format!("/leagues/NBA_{}.html", year)))
            .respond_with(ResponseTemplate::new(200).set_body_string(base_season(year)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let mut definition = definition(&["2024", "2025"], false);
    definition.url_template = format!("{}/leagues/NBA_{{unit}}.html", server.uri());
    let store = Arc::new(MemoryStore::new());
    let orchestrator = common::orchestrator(
        Arc::new(fetcher(Duration::ZERO)?),
        store.clone(),
        definition,
        fast_settings(),
    )?;

    let options = RunOptions {
        target: PersistTarget::Destination,
        ..Default::default()
    };
    let report = orchestrator.run(DATASET, options, CancellationToken::new()).await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.rows_persisted, 4);
    assert_eq!(store.rows_for_unit(DATASET, "2025").len(), 2);
    Ok(())
}

async fn mount_counted_page(server: &MockServer, expected: u64) {
    Mock::given(method("GET"))
        .and(path("/leagues/NBA_2024.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(base_season(2024)))
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_cached_page_is_not_fetched_again() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_counted_page(&server, 1).await;
    let dir = tempfile::tempdir()?;
    let cached = CachingFetcher::new(Arc::new(fetcher(Duration::ZERO)?), dir.path(), Duration::from_secs(3600));

    let first = cached.fetch(&unit(&server, "2024")).await?;
    let second = cached.fetch(&unit(&server, "2024")).await?;
    assert_eq!(first, second);
    assert!(second.contains("Boston Celtics"));
    Ok(())
}

#[tokio::test]
async fn test_expired_cache_entry_is_refetched() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_counted_page(&server, 2).await;
    let dir = tempfile::tempdir()?;
    let cached = CachingFetcher::new(Arc::new(fetcher(Duration::ZERO)?), dir.path(), Duration::ZERO);

    cached.fetch(&unit(&server, "2024")).await?;
    cached.fetch(&unit(&server, "2024")).await?;
    Ok(())
}

#[tokio::test]
async fn test_refresh_bypasses_cache_but_rewrites_it() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_counted_page(&server, 2).await;
    let dir = tempfile::tempdir()?;
    let http: Arc<dyn Fetcher> = Arc::new(fetcher(Duration::ZERO)?);

    let cached = CachingFetcher::new(http.clone(), dir.path(), Duration::from_secs(3600));
    cached.fetch(&unit(&server, "2024")).await?;
    let refreshing = CachingFetcher::new(http, dir.path(), Duration::from_secs(3600)).refresh(true);
    refreshing.fetch(&unit(&server, "2024")).await?;

    assert!(cached.cache_path(&unit(&server, "2024").url).exists());
    Ok(())
}
