//! Configuration management
//!
//! Settings come from an optional TOML file (default `statbucket.toml`)
//! layered with `STATBUCKET__*` environment variables, for example
//! `STATBUCKET__RETRY__MAX_ATTEMPTS=5`. A `.env` file is loaded first.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::IngestError;
use crate::extract::HandlerSpec;
use crate::migration::BackfillConfig;
use crate::pipeline::retry::RetryPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "statbucket.toml";

/// Default location of the persisted ingestion state.
pub const DEFAULT_STATE_PATH: &str = "statbucket-state.json";

/// Default lease timeout for one dataset run (1 hour).
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 3_600;

/// Default number of pages fetched ahead of processing.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 2;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default minimum delay between requests to the source site.
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 3_000;

/// Default age after which a cached page is fetched again (1 day).
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 86_400;

/// Default user agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("statbucket/", env!("CARGO_PKG_VERSION"));

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

fn default_lease_timeout_secs() -> u64 {
    DEFAULT_LEASE_TIMEOUT_SECS
}

fn default_fetch_concurrency() -> usize {
    DEFAULT_FETCH_CONCURRENCY
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_request_delay_ms() -> u64 {
    DEFAULT_REQUEST_DELAY_MS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_cache_max_age_secs() -> u64 {
    DEFAULT_CACHE_MAX_AGE_SECS
}

fn default_enabled() -> bool {
    true
}

/// Top-level ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// PostgreSQL URL; rows go to an in-memory store when unset
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetDefinition>,
}

/// HTTP fetcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Directory for cached pages; caching is off when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: default_user_agent(),
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            cache_dir: None,
            cache_max_age_secs: DEFAULT_CACHE_MAX_AGE_SECS,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }
}

/// One scraped dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub name: String,
    /// Page URL with a `{unit}` placeholder
    pub url_template: String,
    /// `id` of the table to extract; the first table when unset
    #[serde(default)]
    pub table_id: Option<String>,
    /// Destination table; defaults to the dataset name
    #[serde(default)]
    pub destination_table: Option<String>,
    /// Intermediate table; defaults to `{name}_staging`
    #[serde(default)]
    pub intermediate_table: Option<String>,
    #[serde(default)]
    pub auto_add: bool,
    #[serde(default)]
    pub required_columns: Vec<String>,
    /// Handlers keyed by header label
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerSpec>,
    #[serde(default)]
    pub fallback_handler: Option<HandlerSpec>,
    /// Source unit keys in processing order
    #[serde(default)]
    pub units: Vec<String>,
    /// Disabled datasets are skipped by `run --all`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Datasets that must run before this one in `run --all`
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl DatasetDefinition {
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_template: url_template.into(),
            table_id: None,
            destination_table: None,
            intermediate_table: None,
            auto_add: false,
            required_columns: Vec::new(),
            handlers: BTreeMap::new(),
            fallback_handler: None,
            units: Vec::new(),
            enabled: true,
            depends_on: Vec::new(),
        }
    }

    pub fn destination_table(&self) -> String {
        self.destination_table.clone().unwrap_or_else(|| self.name.clone())
    }

    pub fn intermediate_table(&self) -> String {
        self.intermediate_table
            .clone()
            .unwrap_or_else(|| format!("{}_staging", self.name))
    }

    /// Validate the definition, including every handler pattern
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Dataset name cannot be empty");
        }
        if self.url_template.trim().is_empty() {
            anyhow::bail!("Dataset '{}' has an empty url_template", self.name);
        }
        for (label, spec) in &self.handlers {
            spec.build(label)
                .with_context(|| format!("Dataset '{}' handler for '{}'", self.name, label))?;
        }
        if let Some(spec) = &self.fallback_handler {
            spec.build("*")
                .with_context(|| format!("Dataset '{}' fallback handler", self.name))?;
        }
        if self.destination_table() == self.intermediate_table() {
            anyhow::bail!(
                "Dataset '{}' uses '{}' as both destination and intermediate table",
                self.name,
                self.destination_table()
            );
        }
        Ok(())
    }
}

/// Order datasets so each one comes after everything it depends on.
///
/// Independent datasets keep their given order. Disabled datasets are still
/// ordered; callers decide whether to skip them.
pub fn dependency_order<'a>(
    datasets: impl IntoIterator<Item = &'a DatasetDefinition>,
) -> Result<Vec<String>, IngestError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a DatasetDefinition>,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<String>,
    ) -> Result<(), IngestError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(IngestError::DependencyCycle(name.to_string())),
            None => {},
        }
        let definition: &'a DatasetDefinition = by_name
            .get(name)
            .copied()
            .ok_or_else(|| IngestError::UnknownDataset(name.to_string()))?;
        marks.insert(name, Mark::Visiting);
        for dependency in &definition.depends_on {
            visit(dependency, by_name, marks, order)?;
        }
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    let datasets: Vec<&DatasetDefinition> = datasets.into_iter().collect();
    let by_name: HashMap<&str, &DatasetDefinition> = datasets.iter().map(|d| (d.name.as_str(), *d)).collect();
    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(datasets.len());
    for dataset in &datasets {
        visit(&dataset.name, &by_name, &mut marks, &mut order)?;
    }
    Ok(order)
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            database_url: None,
            retry: RetryPolicy::default(),
            lease_timeout_secs: DEFAULT_LEASE_TIMEOUT_SECS,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            backfill: BackfillConfig::default(),
            http: HttpConfig::default(),
            datasets: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Load from `path` (or `statbucket.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("STATBUCKET").separator("__"))
            .build()
            .context("Failed to read configuration")?;

        let config: IngestConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document; used by tests and embedded configs
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        let config: IngestConfig = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!(
                "retry.initial_backoff_ms ({}) cannot be greater than retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms,
                self.retry.max_backoff_ms
            );
        }
        if self.lease_timeout_secs == 0 {
            anyhow::bail!("lease_timeout_secs must be greater than 0");
        }
        if self.fetch_concurrency == 0 {
            anyhow::bail!("fetch_concurrency must be greater than 0");
        }
        if self.backfill.batch_size == 0 {
            anyhow::bail!("backfill.batch_size must be greater than 0");
        }
        if self.backfill.parallelism == 0 {
            anyhow::bail!("backfill.parallelism must be greater than 0");
        }

        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            dataset.validate()?;
            if !seen.insert(dataset.name.as_str()) {
                anyhow::bail!("Duplicate dataset '{}'", dataset.name);
            }
        }

        if self.datasets.is_empty() {
            tracing::warn!("No datasets configured");
        }
        dependency_order(&self.datasets).context("Invalid dataset dependencies")?;

        Ok(())
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetDefinition> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Where the in-memory store keeps its tables between processes
    pub fn memory_tables_path(&self) -> PathBuf {
        self.state_path.with_extension("tables.json")
    }
}
