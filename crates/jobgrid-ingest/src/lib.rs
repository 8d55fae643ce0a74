//! Ingestion run orchestration: concurrent source fetch, entity resolution,
//! idempotent persistence, and run reporting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobgrid_adapters::{adapter_for_source, SourceAdapter, DEFAULT_MAX_LISTINGS};
use jobgrid_core::{NewJobRecord, RawListing};
use jobgrid_store::{
    Catalog, FetchedPage, HttpClientConfig, HttpFetcher, InsertOutcome, PageArchive, PgCatalog,
    StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobgrid-ingest";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; JobGridBot/0.1; +https://jobgrid.example/bot)";

/// Process-level configuration. The store endpoint is injected here once at
/// startup; its absence is a configuration error, never a per-run one.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub artifacts_dir: Option<PathBuf>,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_listings_per_source: usize,
    pub run_deadline_secs: Option<u64>,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set before startup")?;
        Ok(Self {
            database_url,
            artifacts_dir: std::env::var("ARTIFACTS_DIR").ok().map(PathBuf::from),
            sources_path: std::env::var("JOBGRID_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("JOBGRID_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("JOBGRID_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_listings_per_source: std::env::var("JOBGRID_MAX_LISTINGS_PER_SOURCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_LISTINGS),
            run_deadline_secs: std::env::var("JOBGRID_RUN_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            web_port: std::env::var("JOBGRID_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            scheduler_enabled: std::env::var("JOBGRID_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("INGEST_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub max_listings: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(Into::into)
    }

    /// Instantiate an adapter for every enabled source. An enabled source
    /// with no registered adapter is a configuration error.
    pub fn enabled_adapters(&self, default_max: usize) -> Result<Vec<Arc<dyn SourceAdapter>>> {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in self.sources.iter().filter(|s| s.enabled) {
            let adapter = adapter_for_source(
                &source.source_id,
                source.listing_url.as_deref(),
                Some(source.max_listings.unwrap_or(default_max)),
            )
            .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            adapters.push(Arc::new(adapter));
        }
        Ok(adapters)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Fetch,
    ParseEmpty,
    Company,
    Location,
    Category,
    Insert,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureTally {
    pub fetch: usize,
    pub parse_empty: usize,
    pub company: usize,
    pub location: usize,
    pub category: usize,
    pub insert: usize,
}

impl FailureTally {
    fn bump(&mut self, reason: FailureReason) {
        match reason {
            FailureReason::Fetch => self.fetch += 1,
            FailureReason::ParseEmpty => self.parse_empty += 1,
            FailureReason::Company => self.company += 1,
            FailureReason::Location => self.location += 1,
            FailureReason::Category => self.category += 1,
            FailureReason::Insert => self.insert += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingFailure {
    pub source_url: String,
    pub reason: FailureReason,
    pub detail: String,
}

/// Run-level summary returned to the caller. Always produced; a run over
/// zero listings is success with zero processed, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Listings observed before the title/company validity filter.
    pub raw_total: usize,
    /// Listings that entered the pipeline. Conservation invariant:
    /// `processed + duplicates + failed == scraped`.
    pub scraped: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub tally: FailureTally,
    pub fetch_failures: Vec<SourceFailure>,
    pub listing_failures: Vec<ListingFailure>,
}

impl IngestReport {
    /// Error count surfaced to the caller: listing-level failures plus
    /// whole-source fetch failures.
    pub fn errors(&self) -> usize {
        self.failed + self.tally.fetch
    }

    pub fn message(&self) -> String {
        format!(
            "Successfully processed {} jobs with {} errors ({} duplicates skipped)",
            self.processed,
            self.errors(),
            self.duplicates
        )
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("category not found: {0:?}")]
    CategoryNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps free-text names to stable catalog identifiers. Companies and
/// locations are created on first sighting through the store's idempotent
/// upsert; categories are a closed, externally curated set.
pub struct EntityResolver {
    catalog: Arc<dyn Catalog>,
}

impl EntityResolver {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn resolve_company(&self, name: &str) -> Result<Uuid, ResolveError> {
        Ok(self.catalog.company_id_or_create(name).await?)
    }

    pub async fn resolve_location(
        &self,
        city: &str,
        defaults: &jobgrid_core::LocationDefaults,
    ) -> Result<Uuid, ResolveError> {
        Ok(self.catalog.location_id_or_create(city, defaults).await?)
    }

    pub async fn resolve_category(&self, name: &str) -> Result<Uuid, ResolveError> {
        self.catalog
            .category_id(name)
            .await?
            .ok_or_else(|| ResolveError::CategoryNotFound(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub user_agent: String,
    pub http_timeout: Duration,
    pub archive_dir: Option<PathBuf>,
    pub run_deadline: Option<Duration>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout: Duration::from_secs(20),
            archive_dir: None,
            run_deadline: None,
        }
    }
}

impl IngestOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            http_timeout: Duration::from_secs(config.http_timeout_secs),
            archive_dir: config.artifacts_dir.clone(),
            run_deadline: config.run_deadline_secs.map(Duration::from_secs),
        }
    }
}

enum ListingOutcome {
    Inserted,
    Duplicate,
    Failed(FailureReason, String),
}

/// Orchestrates one ingestion run: all adapters fetched concurrently, each
/// listing routed through dedup check, entity resolution, and insert. Every
/// non-fatal failure folds into the report; only an unreachable catalog
/// aborts the run.
pub struct IngestCoordinator {
    catalog: Arc<dyn Catalog>,
    resolver: EntityResolver,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    archive: Option<Arc<PageArchive>>,
    run_deadline: Option<Duration>,
}

impl IngestCoordinator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        options: IngestOptions,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: options.http_timeout,
            user_agent: Some(options.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            resolver: EntityResolver::new(catalog.clone()),
            catalog,
            adapters,
            http: Arc::new(http),
            archive: options.archive_dir.map(|dir| Arc::new(PageArchive::new(dir))),
            run_deadline: options.run_deadline,
        })
    }

    /// Reachability probe for health endpoints.
    pub async fn ping_catalog(&self) -> Result<(), StoreError> {
        self.catalog.ping().await
    }

    pub async fn run(&self) -> Result<IngestReport, StoreError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        // The one fatal precondition: the catalog must be reachable.
        self.catalog.ping().await?;
        info!(%run_id, sources = self.adapters.len(), "starting ingestion run");

        let (pages, fetch_failures) = self.fetch_all().await;

        let mut raw_total = 0usize;
        let mut scraped = 0usize;
        let mut processed = 0usize;
        let mut duplicates = 0usize;
        let mut failed = 0usize;
        let mut tally = FailureTally {
            fetch: fetch_failures.len(),
            ..FailureTally::default()
        };
        let mut listing_failures = Vec::new();

        for (idx, page) in pages {
            let adapter = &self.adapters[idx];
            let listings = adapter.parse(&page.body);
            if listings.is_empty() {
                tally.parse_empty += 1;
                debug!(source_id = adapter.source_id(), "fetched page yielded no listings");
                continue;
            }
            raw_total += listings.len();

            for listing in &listings {
                if !listing.is_ingestible() {
                    debug!(
                        source_id = adapter.source_id(),
                        url = %listing.source_url,
                        "listing missing required fields; discarded"
                    );
                    continue;
                }
                scraped += 1;
                match self.process_listing(adapter.as_ref(), listing).await {
                    ListingOutcome::Inserted => processed += 1,
                    ListingOutcome::Duplicate => duplicates += 1,
                    ListingOutcome::Failed(reason, detail) => {
                        failed += 1;
                        tally.bump(reason);
                        warn!(
                            url = %listing.source_url,
                            ?reason,
                            detail = %detail,
                            "listing failed; continuing with the rest of the run"
                        );
                        listing_failures.push(ListingFailure {
                            source_url: listing.source_url.clone(),
                            reason,
                            detail,
                        });
                    }
                }
            }
        }

        let report = IngestReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            raw_total,
            scraped,
            processed,
            duplicates,
            failed,
            tally,
            fetch_failures,
            listing_failures,
        };
        info!(
            %run_id,
            scraped = report.scraped,
            processed = report.processed,
            duplicates = report.duplicates,
            failed = report.failed,
            "ingestion run finished"
        );
        Ok(report)
    }

    /// Fetch every adapter's listing page concurrently. One adapter's
    /// failure or slowness never blocks another's contribution; a run
    /// deadline abandons whatever is still in flight.
    async fn fetch_all(&self) -> (Vec<(usize, FetchedPage)>, Vec<SourceFailure>) {
        let mut set: JoinSet<(usize, Result<FetchedPage, jobgrid_store::FetchError>)> =
            JoinSet::new();
        for (idx, adapter) in self.adapters.iter().enumerate() {
            let adapter = adapter.clone();
            let http = self.http.clone();
            set.spawn(async move { (idx, adapter.fetch(&http).await) });
        }

        let deadline = self
            .run_deadline
            .map(|d| tokio::time::Instant::now() + d);
        let mut pages = Vec::new();
        let mut failures = Vec::new();
        let mut completed = vec![false; self.adapters.len()];

        loop {
            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, set.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        set.abort_all();
                        for (idx, done) in completed.iter().enumerate() {
                            if !*done {
                                let source_id = self.adapters[idx].source_id().to_string();
                                warn!(%source_id, "run deadline exceeded; abandoning fetch");
                                failures.push(SourceFailure {
                                    error: jobgrid_store::FetchError::DeadlineExceeded {
                                        source_id: source_id.clone(),
                                    }
                                    .to_string(),
                                    source_id,
                                });
                            }
                        }
                        break;
                    }
                },
                None => set.join_next().await,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((idx, Ok(page))) => {
                    completed[idx] = true;
                    self.archive_page(self.adapters[idx].as_ref(), &page).await;
                    pages.push((idx, page));
                }
                Ok((idx, Err(err))) => {
                    completed[idx] = true;
                    let source_id = self.adapters[idx].source_id().to_string();
                    warn!(%source_id, error = %err, "source fetch failed; treating as empty");
                    failures.push(SourceFailure {
                        source_id,
                        error: err.to_string(),
                    });
                }
                Err(join_err) => {
                    warn!(error = %join_err, "adapter task did not complete");
                }
            }
        }

        (pages, failures)
    }

    async fn archive_page(&self, adapter: &dyn SourceAdapter, page: &FetchedPage) {
        let Some(archive) = &self.archive else { return };
        if let Err(err) = archive
            .store_page(page.fetched_at, adapter.source_id(), page.body.as_bytes())
            .await
        {
            warn!(
                source_id = adapter.source_id(),
                error = %err,
                "failed to archive fetched page"
            );
        }
    }

    async fn process_listing(
        &self,
        adapter: &dyn SourceAdapter,
        listing: &RawListing,
    ) -> ListingOutcome {
        match self.catalog.job_exists(&listing.source_url).await {
            Ok(true) => return ListingOutcome::Duplicate,
            Ok(false) => {}
            Err(err) => {
                return ListingOutcome::Failed(
                    FailureReason::Insert,
                    format!("dedup check: {err}"),
                )
            }
        }

        let company_id = match self.resolver.resolve_company(&listing.company_name).await {
            Ok(id) => id,
            Err(err) => return ListingOutcome::Failed(FailureReason::Company, err.to_string()),
        };

        let city = if listing.location_name.trim().is_empty() {
            adapter.home_city()
        } else {
            listing.location_name.as_str()
        };
        let defaults = adapter.location_defaults(city);
        let location_id = match self.resolver.resolve_location(city, &defaults).await {
            Ok(id) => id,
            Err(err) => return ListingOutcome::Failed(FailureReason::Location, err.to_string()),
        };

        let category_id = match self.resolver.resolve_category(&listing.category_name).await {
            Ok(id) => id,
            Err(err) => return ListingOutcome::Failed(FailureReason::Category, err.to_string()),
        };

        let record = NewJobRecord {
            title: listing.title.clone(),
            description: listing.description.clone(),
            company_id,
            location_id,
            category_id,
            source_url: listing.source_url.clone(),
            source_site: listing.source_site.clone(),
            employment_type: listing.employment_type.clone(),
            salary_min: listing.salary_min,
            salary_max: listing.salary_max,
            posted_at: listing.posted_at,
        };

        match self.catalog.insert_job(&record).await {
            Ok(InsertOutcome::Inserted) => ListingOutcome::Inserted,
            // Raced another writer on the URL constraint: already exists.
            Ok(InsertOutcome::DuplicateUrl) => ListingOutcome::Duplicate,
            Err(err) => ListingOutcome::Failed(FailureReason::Insert, err.to_string()),
        }
    }
}

/// Build the production coordinator: Postgres catalog plus every enabled
/// adapter from the source registry.
pub async fn coordinator_from_config(config: &AppConfig) -> Result<Arc<IngestCoordinator>> {
    let catalog = Arc::new(PgCatalog::connect(&config.database_url)?);
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let adapters = registry.enabled_adapters(config.max_listings_per_source)?;
    let coordinator =
        IngestCoordinator::new(catalog, adapters, IngestOptions::from_config(config))?;
    Ok(Arc::new(coordinator))
}

pub async fn run_ingest_once_from_env() -> Result<IngestReport> {
    let config = AppConfig::from_env()?;
    let coordinator = coordinator_from_config(&config).await?;
    coordinator.run().await.map_err(Into::into)
}

/// Optional cron-driven ingestion for long-running deployments.
pub async fn maybe_build_scheduler(
    coordinator: Arc<IngestCoordinator>,
    config: &AppConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.ingest_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match coordinator.run().await {
                Ok(report) => info!(
                    processed = report.processed,
                    duplicates = report.duplicates,
                    failed = report.failed,
                    "scheduled ingestion run finished"
                ),
                Err(err) => warn!(error = %err, "scheduled ingestion run could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_errors_combine_listing_and_fetch_failures() {
        let report = IngestReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            raw_total: 5,
            scraped: 4,
            processed: 2,
            duplicates: 1,
            failed: 1,
            tally: FailureTally {
                fetch: 1,
                category: 1,
                ..FailureTally::default()
            },
            fetch_failures: vec![SourceFailure {
                source_id: "jobstreet".into(),
                error: "http status 503".into(),
            }],
            listing_failures: vec![],
        };
        assert_eq!(report.errors(), 2);
        assert_eq!(report.processed + report.duplicates + report.failed, report.scraped);
        assert!(report.message().contains("2 jobs"));
        assert!(report.message().contains("2 errors"));
    }

    #[test]
    fn registry_parses_and_filters_enabled_sources() {
        let yaml = r#"
sources:
  - source_id: jobstreet
    display_name: JobStreet Singapore
    enabled: true
    listing_url: https://sg.jobstreet.com/jobs?page=1
  - source_id: joimyanmar
    display_name: Joi Myanmar
    enabled: false
"#;
        let registry = SourceRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(registry.sources.len(), 2);
        let adapters = registry.enabled_adapters(25).unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].source_id(), "jobstreet");
        assert_eq!(adapters[0].listing_url(), "https://sg.jobstreet.com/jobs?page=1");
    }

    #[test]
    fn registry_rejects_enabled_source_without_adapter() {
        let yaml = r#"
sources:
  - source_id: craigslist
    display_name: Craigslist
    enabled: true
"#;
        let registry = SourceRegistry::from_yaml_str(yaml).unwrap();
        assert!(registry.enabled_adapters(25).is_err());
    }

    #[test]
    fn failure_tally_buckets_by_reason() {
        let mut tally = FailureTally::default();
        tally.bump(FailureReason::Category);
        tally.bump(FailureReason::Category);
        tally.bump(FailureReason::Insert);
        assert_eq!(tally.category, 2);
        assert_eq!(tally.insert, 1);
        assert_eq!(tally.company, 0);
    }
}
