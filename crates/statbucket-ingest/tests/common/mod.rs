//! Shared helpers for statbucket-ingest integration tests
//!
//! - [`MockFetcher`]: serves canned pages per source unit, with injectable
//!   failures, an optional per-fetch delay and a call log
//! - [`season_page`]: renders a stats-site style HTML table
//! - [`orchestrator`]: an orchestrator over a [`MemoryStore`] with fast retries

#![allow(dead_code)]

use async_trait::async_trait;
use statbucket_ingest::config::DatasetDefinition;
use statbucket_ingest::error::FetchError;
use statbucket_ingest::extract::HandlerSpec;
use statbucket_ingest::pipeline::{DatasetPipeline, Fetcher, Orchestrator, PipelineSettings, RetryPolicy, SourceUnit};
use statbucket_ingest::store::MemoryStore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DATASET: &str = "team_season";
pub const TABLE_ID: &str = "advanced-team";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,statbucket_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Mock Fetcher
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    pages: HashMap<String, String>,
    failures: HashMap<String, VecDeque<FetchError>>,
    calls: Vec<String>,
    delay: Duration,
}

/// Fetcher serving pages keyed by source unit
#[derive(Debug, Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_page(&self, unit: &str, html: impl Into<String>) {
        self.state().pages.insert(unit.to_string(), html.into());
    }

    /// Fail the next `n` fetches of `unit` with `error`
    pub fn fail_next(&self, unit: &str, n: usize, error: FetchError) {
        let mut state = self.state();
        let queue = state.failures.entry(unit.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(n));
    }

    /// Sleep this long (in tokio time) before answering each fetch
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    pub fn calls(&self, unit: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == unit).count()
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError> {
        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.calls.push(unit.key.clone());
        if let Some(error) = state.failures.get_mut(&unit.key).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        state.pages.get(&unit.key).cloned().ok_or_else(|| FetchError::Status {
            url: unit.url.clone(),
            status: 404,
        })
    }
}

pub fn server_error(unit: &str) -> FetchError {
    FetchError::Status {
        url: format!("https://stats.example/leagues/NBA_{}.html", unit),
        status: 503,
    }
}

// ============================================================================
// Pages
// ============================================================================

/// Render a table the way the stats site does: a group header row, a
/// `data-stat` header row and body rows whose first cell is a `th`.
///
/// A cell written as `text|href` becomes a link.
pub fn season_page(headers: &[&str], rows: &[Vec<&str>]) -> String {
    let mut html = String::from("<html><body>\n");
    html.push_str(&format!("<table id=\"{}\">\n<thead>\n", TABLE_ID));
    html.push_str(&format!(
        "<tr class=\"over_header\"><th colspan=\"{}\">Season</th></tr>\n<tr>",
        headers.len()
    ));
    for header in headers {
        html.push_str(&format!("<th data-stat=\"{}\">{}</th>", header, header.to_uppercase()));
    }
    html.push_str("</tr>\n</thead>\n<tbody>\n");
    for row in rows {
        html.push_str("<tr>");
        for (i, cell) in row.iter().enumerate() {
            let tag = if i == 0 { "th" } else { "td" };
            let content = match cell.split_once('|') {
                Some((text, href)) => format!("<a href=\"{}\">{}</a>", href, text),
                None => cell.to_string(),
            };
            html.push_str(&format!("<{tag}>{content}</{tag}>"));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n</body></html>\n");
    html
}

/// Standard three-column season (team, wins, ortg) with two teams
pub fn base_season(year: u32) -> String {
    let wins_a = (50 + year % 10).to_string();
    let wins_b = (30 + year % 10).to_string();
    season_page(
        &["team", "wins", "ortg"],
        &[
            vec!["Boston Celtics", wins_a.as_str(), "118.2"],
            vec!["Chicago Bulls", wins_b.as_str(), "112.9"],
        ],
    )
}

/// The base season plus a new `net_rating` column
pub fn season_with_net_rating(year: u32) -> String {
    let wins_a = (50 + year % 10).to_string();
    let wins_b = (30 + year % 10).to_string();
    season_page(
        &["team", "wins", "ortg", "net_rating"],
        &[
            vec!["Boston Celtics", wins_a.as_str(), "118.2", "11.7"],
            vec!["Chicago Bulls", wins_b.as_str(), "112.9", "-1.4"],
        ],
    )
}

// ============================================================================
// Orchestrator
// ============================================================================

pub fn definition(units: &[&str], auto_add: bool) -> DatasetDefinition {
    let mut definition = DatasetDefinition::new(DATASET, "https://stats.example/leagues/NBA_{unit}.html");
    definition.table_id = Some(TABLE_ID.to_string());
    definition.auto_add = auto_add;
    definition.required_columns = vec!["team".to_string()];
    definition.units = units.iter().map(|u| u.to_string()).collect();
    for column in ["wins", "ortg", "net_rating"] {
        definition
            .handlers
            .insert(column.to_string(), HandlerSpec::Numeric { pattern: None });
    }
    definition
}

pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        },
        lease_ttl: Duration::from_secs(60),
        fetch_concurrency: 2,
        ..Default::default()
    }
}

pub fn orchestrator(
    fetcher: Arc<dyn Fetcher>,
    store: Arc<MemoryStore>,
    definition: DatasetDefinition,
    settings: PipelineSettings,
) -> anyhow::Result<Orchestrator> {
    let mut orchestrator = Orchestrator::new(fetcher, store, settings);
    orchestrator.register(DatasetPipeline::from_definition(definition)?);
    Ok(orchestrator)
}
