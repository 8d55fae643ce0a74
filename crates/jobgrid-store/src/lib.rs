//! Catalog persistence and HTTP fetch utilities for jobgrid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobgrid_core::{natural_key, Company, JobCategory, Location, LocationDefaults, NewJobRecord};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobgrid-store";

pub use reqwest::StatusCode as HttpStatusCode;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The catalog cannot be reached at all. The only run-aborting error.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("catalog inconsistency: {0}")]
    Inconsistent(String),
}

/// Result of a job insert under the source-URL uniqueness constraint.
/// A constraint collision is benign idempotence, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateUrl,
}

/// Persistence boundary for the ingestion pipeline. The pipeline only ever
/// inserts into companies/locations/jobs and only ever reads job_categories.
///
/// `*_id_or_create` calls are single idempotent operations: at most one row
/// is ever created per distinct natural key, even under concurrent callers.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;
    async fn company_id_or_create(&self, name: &str) -> Result<Uuid, StoreError>;
    async fn location_id_or_create(
        &self,
        city: &str,
        defaults: &LocationDefaults,
    ) -> Result<Uuid, StoreError>;
    async fn category_id(&self, name: &str) -> Result<Option<Uuid>, StoreError>;
    async fn job_exists(&self, source_url: &str) -> Result<bool, StoreError>;
    async fn insert_job(&self, job: &NewJobRecord) -> Result<InsertOutcome, StoreError>;
}

/// Postgres-backed catalog. Entity creation relies on the unique indexes
/// declared in the migrations: a conflicting insert falls through to a
/// re-read of the winning row, so racing writers converge on one identifier.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Connections are established lazily so a temporarily unreachable store
    /// surfaces through `ping` at run start, not at process start.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect_lazy(database_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_company(&self, name: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT id FROM companies WHERE lower(name) = lower($1) LIMIT 1")
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }

    async fn find_location(&self, city: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT id FROM locations WHERE lower(city) = lower($1) LIMIT 1")
            .bind(city.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn company_id_or_create(&self, name: &str) -> Result<Uuid, StoreError> {
        if let Some(id) = self.find_company(name).await? {
            return Ok(id);
        }
        let inserted = sqlx::query(
            r#"
            INSERT INTO companies (id, name)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(row.try_get("id")?);
        }
        // Lost the insert race: the winner's row is visible once the
        // conflict fired, so the re-read must find it.
        self.find_company(name)
            .await?
            .ok_or_else(|| StoreError::Inconsistent(format!("company vanished after conflict: {name}")))
    }

    async fn location_id_or_create(
        &self,
        city: &str,
        defaults: &LocationDefaults,
    ) -> Result<Uuid, StoreError> {
        if let Some(id) = self.find_location(city).await? {
            return Ok(id);
        }
        let inserted = sqlx::query(
            r#"
            INSERT INTO locations (id, city, state, country)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(city.trim())
        .bind(&defaults.state)
        .bind(&defaults.country)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(row.try_get("id")?);
        }
        self.find_location(city)
            .await?
            .ok_or_else(|| StoreError::Inconsistent(format!("location vanished after conflict: {city}")))
    }

    async fn category_id(&self, name: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT id FROM job_categories WHERE lower(name) = lower($1) LIMIT 1")
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }

    async fn job_exists(&self, source_url: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT id FROM jobs WHERE source_url = $1 LIMIT 1")
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_job(&self, job: &NewJobRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, title, description, company_id, location_id, category_id,
                source_url, source_website, employment_type,
                salary_min, salary_max, posted_date, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, TRUE)
            ON CONFLICT (source_url) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&job.title)
        .bind(&job.description)
        .bind(job.company_id)
        .bind(job.location_id)
        .bind(job.category_id)
        .bind(&job.source_url)
        .bind(&job.source_site)
        .bind(&job.employment_type)
        .bind(job.salary_min)
        .bind(job.salary_max)
        .bind(job.posted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::DuplicateUrl)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    companies: Vec<Company>,
    locations: Vec<Location>,
    categories: Vec<JobCategory>,
    jobs: Vec<NewJobRecord>,
}

/// In-memory catalog for tests. Resolution is serialized behind one mutex,
/// which satisfies the at-most-one-row guarantee trivially.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
    unreachable: bool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let categories = names
            .into_iter()
            .map(|name| JobCategory {
                id: Uuid::new_v4(),
                name: name.into(),
            })
            .collect();
        Self {
            state: Mutex::new(MemoryState {
                categories,
                ..MemoryState::default()
            }),
            unreachable: false,
        }
    }

    /// A catalog whose ping always fails, for exercising the fatal path.
    pub fn unreachable() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            unreachable: true,
        }
    }

    pub async fn company_count(&self) -> usize {
        self.state.lock().await.companies.len()
    }

    pub async fn location_count(&self) -> usize {
        self.state.lock().await.locations.len()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn companies(&self) -> Vec<Company> {
        self.state.lock().await.companies.clone()
    }

    pub async fn locations(&self) -> Vec<Location> {
        self.state.lock().await.locations.clone()
    }

    pub async fn job_urls(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .map(|j| j.source_url.clone())
            .collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.unreachable {
            return Err(StoreError::Unavailable("memory catalog marked unreachable".into()));
        }
        Ok(())
    }

    async fn company_id_or_create(&self, name: &str) -> Result<Uuid, StoreError> {
        let key = natural_key(name);
        let mut state = self.state.lock().await;
        if let Some(existing) = state.companies.iter().find(|c| natural_key(&c.name) == key) {
            return Ok(existing.id);
        }
        let company = Company {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
        };
        let id = company.id;
        state.companies.push(company);
        Ok(id)
    }

    async fn location_id_or_create(
        &self,
        city: &str,
        defaults: &LocationDefaults,
    ) -> Result<Uuid, StoreError> {
        let key = natural_key(city);
        let mut state = self.state.lock().await;
        if let Some(existing) = state.locations.iter().find(|l| natural_key(&l.city) == key) {
            return Ok(existing.id);
        }
        let location = Location {
            id: Uuid::new_v4(),
            city: city.trim().to_string(),
            state: defaults.state.clone(),
            country: defaults.country.clone(),
        };
        let id = location.id;
        state.locations.push(location);
        Ok(id)
    }

    async fn category_id(&self, name: &str) -> Result<Option<Uuid>, StoreError> {
        let key = natural_key(name);
        let state = self.state.lock().await;
        Ok(state
            .categories
            .iter()
            .find(|c| natural_key(&c.name) == key)
            .map(|c| c.id))
    }

    async fn job_exists(&self, source_url: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().any(|j| j.source_url == source_url))
    }

    async fn insert_job(&self, job: &NewJobRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.iter().any(|j| j.source_url == job.source_url) {
            return Ok(InsertOutcome::DuplicateUrl);
        }
        state.jobs.push(job.clone());
        Ok(InsertOutcome::Inserted)
    }
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of fetched listing pages, hash-addressed so a re-run
/// over unchanged markup stores nothing twice.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.html"))
    }

    /// Store page bytes using a hash-addressed path and atomic temp-file
    /// rename.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("run deadline exceeded before {source_id} completed")]
    DeadlineExceeded { source_id: String },
}

/// Shared HTTP client with per-request timeout, exponential backoff on
/// retryable failures, and global + per-source concurrency limits.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_page(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
