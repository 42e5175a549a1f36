//! HTTP fetch, retry, telemetry, result cache, and durable store for fedscout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedscout_core::{
    IngestionCounts, Opportunity, OpportunityStatus, SearchResult, Source,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedscout-storage";

/// Per-source fetch failure taxonomy. Retryability drives the executor.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("{source} request timed out")]
    Timeout { source: Source },
    #[error("{source} returned http {status}")]
    Http { source: Source, status: u16 },
    #[error("{source} payload could not be parsed: {detail}")]
    Parse { source: Source, detail: String },
    #[error("{source} request failed: {detail}")]
    Transport { source: Source, detail: String },
}

impl SourceError {
    pub fn source(&self) -> Source {
        match self {
            SourceError::Timeout { source }
            | SourceError::Http { source, .. }
            | SourceError::Parse { source, .. }
            | SourceError::Transport { source, .. } => *source,
        }
    }

    /// Server-side and transport faults are worth retrying; client errors and
    /// malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Timeout { .. } | SourceError::Transport { .. } => true,
            SourceError::Http { status, .. } => *status >= 500 || *status == 429,
            SourceError::Parse { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "fedscout/0.1 (+https://fedscout.example)".to_string(),
        }
    }
}

/// Thin reqwest wrapper: hard request timeout, descriptive client identifier,
/// JSON in/out with errors mapped into the `SourceError` taxonomy.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        source: Source,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, SourceError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|err| map_reqwest_error(source, err))?;
        Self::decode_json(source, response).await
    }

    pub async fn post_json(
        &self,
        source: Source,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, SourceError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| map_reqwest_error(source, err))?;
        Self::decode_json(source, response).await
    }

    async fn decode_json(
        source: Source,
        response: reqwest::Response,
    ) -> Result<JsonValue, SourceError> {
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                source,
                status: status.as_u16(),
            });
        }
        response.json::<JsonValue>().await.map_err(|err| SourceError::Parse {
            source,
            detail: err.to_string(),
        })
    }
}

fn map_reqwest_error(source: Source, err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout { source }
    } else {
        SourceError::Transport {
            source,
            detail: err.to_string(),
        }
    }
}

/// Bounded retry with pure exponential backoff: delay for attempt `n` (1-based)
/// is `initial_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

/// One attempt (or final outcome) of a source fetch, reported to telemetry.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub source: Source,
    pub attempt: u32,
    pub success: bool,
    pub latency: Duration,
    pub records: Option<usize>,
    pub error: Option<String>,
}

/// Injected telemetry seam. Implementations must be cheap and non-blocking;
/// components never keep module-level counters.
pub trait TelemetrySink: Send + Sync {
    fn record_fetch(&self, event: &FetchEvent);
    fn record_event(&self, name: &str, detail: &str);
}

/// Production sink: structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_fetch(&self, event: &FetchEvent) {
        if event.success {
            info!(
                source = %event.source,
                attempt = event.attempt,
                latency_ms = event.latency.as_millis() as u64,
                records = event.records.unwrap_or(0),
                "source fetch succeeded"
            );
        } else {
            warn!(
                source = %event.source,
                attempt = event.attempt,
                latency_ms = event.latency.as_millis() as u64,
                error = event.error.as_deref().unwrap_or("unknown"),
                "source fetch failed"
            );
        }
    }

    fn record_event(&self, name: &str, detail: &str) {
        info!(event = name, detail, "pipeline event");
    }
}

/// Accumulating sink for assertions in tests and per-request isolation.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    fetches: StdMutex<Vec<FetchEvent>>,
    events: StdMutex<Vec<(String, String)>>,
}

impl RecordingTelemetry {
    pub fn fetches(&self) -> Vec<FetchEvent> {
        self.fetches.lock().expect("telemetry lock poisoned").clone()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().expect("telemetry lock poisoned").clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record_fetch(&self, event: &FetchEvent) {
        self.fetches
            .lock()
            .expect("telemetry lock poisoned")
            .push(event.clone());
    }

    fn record_event(&self, name: &str, detail: &str) {
        self.events
            .lock()
            .expect("telemetry lock poisoned")
            .push((name.to_string(), detail.to_string()));
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts and
/// reporting every attempt to telemetry. Non-retryable errors short-circuit.
/// Exhaustion propagates the last error; swallowing failures into an empty
/// result is the caller's decision, never this function's.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    source: Source,
    telemetry: &dyn TelemetrySink,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error: Option<SourceError> = None;

    for attempt in 1..=attempts {
        let started = Instant::now();
        match op().await {
            Ok(value) => {
                telemetry.record_fetch(&FetchEvent {
                    source,
                    attempt,
                    success: true,
                    latency: started.elapsed(),
                    records: None,
                    error: None,
                });
                return Ok(value);
            }
            Err(err) => {
                telemetry.record_fetch(&FetchEvent {
                    source,
                    attempt,
                    success: false,
                    latency: started.elapsed(),
                    records: None,
                    error: Some(err.to_string()),
                });
                let retryable = err.is_retryable();
                last_error = Some(err);
                if !retryable || attempt == attempts {
                    break;
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }

    Err(last_error.expect("retry loop records an error before exiting"))
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("result cache unavailable: {0}")]
    Unavailable(String),
}

/// Deterministic cache key over the normalized query parameters.
pub fn search_cache_key(query: &str, agency: Option<&str>) -> String {
    let normalized = format!(
        "q={}|agency={}",
        fedscout_core::normalize_text(query),
        fedscout_core::normalize_text(agency.unwrap_or(""))
    );
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("search:{}", hex::encode(hasher.finalize()))
}

/// Keyed search-result cache with a fixed TTL. Failures are always non-fatal
/// to callers; caching is an optimization, not a correctness requirement.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SearchResult>, CacheError>;
    async fn put(&self, key: &str, value: &SearchResult, ttl: Duration)
        -> Result<(), CacheError>;
}

struct CacheEntry {
    expires_at: Instant,
    value: SearchResult,
}

/// In-process TTL cache. Expired entries are dropped opportunistically on
/// read and swept on write.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<SearchResult>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: &SearchResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key.to_string(),
            CacheEntry {
                expires_at: now + ttl,
                value: value.clone(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// One append-only audit row per source ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionLogEntry {
    pub id: Uuid,
    pub source: Source,
    pub status: RunStatus,
    pub counts: IngestionCounts,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Durable opportunity store. Rows are keyed by `(source, external_id)`;
/// writes are per-record and independently retryable.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn find_by_source_key(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<Option<Opportunity>, PersistenceError>;
    async fn insert(&self, record: &Opportunity) -> Result<(), PersistenceError>;
    async fn update(&self, record: &Opportunity) -> Result<(), PersistenceError>;
    async fn append_ingestion_log(
        &self,
        entry: &IngestionLogEntry,
    ) -> Result<(), PersistenceError>;
    /// Delete closed records whose archive date (close date as fallback)
    /// predates `cutoff`. Returns the removed row count.
    async fn delete_closed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, PersistenceError>;
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| PersistenceError::Other(err.to_string()))
    }

    fn row_to_opportunity(row: &sqlx::postgres::PgRow) -> Result<Opportunity, PersistenceError> {
        let source_text: String = row.try_get("source")?;
        let source = source_text
            .parse::<Source>()
            .map_err(|err| PersistenceError::Other(err.to_string()))?;
        let status_text: String = row.try_get("status")?;
        Ok(Opportunity {
            id: row.try_get("id")?,
            source,
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            agency: row.try_get("agency")?,
            agency_code: row.try_get("agency_code")?,
            program: row.try_get("program")?,
            opportunity_type: row.try_get("opportunity_type")?,
            status: OpportunityStatus::from_db(&status_text),
            award_floor_cents: row.try_get("award_floor_cents")?,
            award_ceiling_cents: row.try_get("award_ceiling_cents")?,
            estimated_funding_cents: row.try_get("estimated_funding_cents")?,
            post_date: row.try_get("post_date")?,
            close_date: row.try_get("close_date")?,
            archive_date: row.try_get("archive_date")?,
            eligibility: row.try_get("eligibility")?,
            applicant_types: row.try_get("applicant_types")?,
            funding_categories: row.try_get("funding_categories")?,
            keywords: row.try_get("keywords")?,
            tags: row.try_get("tags")?,
            // Scores are query-dependent and never read back as authoritative.
            matching_score: 0.0,
            data_freshness: row.try_get("data_freshness")?,
            last_verified: row.try_get("last_verified")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn find_by_source_key(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<Option<Opportunity>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, source, external_id, title, description, agency, agency_code,
                   program, opportunity_type, status, award_floor_cents,
                   award_ceiling_cents, estimated_funding_cents, post_date, close_date,
                   archive_date, eligibility, applicant_types, funding_categories,
                   keywords, tags, data_freshness, last_verified, updated_at
              FROM opportunities
             WHERE source = $1 AND external_id = $2
            "#,
        )
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_opportunity(&r)).transpose()
    }

    async fn insert(&self, record: &Opportunity) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, source, external_id, title, description, agency, agency_code,
                program, opportunity_type, status, award_floor_cents,
                award_ceiling_cents, estimated_funding_cents, post_date, close_date,
                archive_date, eligibility, applicant_types, funding_categories,
                keywords, tags, data_freshness, last_verified, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            "#,
        )
        .bind(&record.id)
        .bind(record.source.as_str())
        .bind(&record.external_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.agency)
        .bind(&record.agency_code)
        .bind(&record.program)
        .bind(&record.opportunity_type)
        .bind(record.status.as_str())
        .bind(record.award_floor_cents)
        .bind(record.award_ceiling_cents)
        .bind(record.estimated_funding_cents)
        .bind(record.post_date)
        .bind(record.close_date)
        .bind(record.archive_date)
        .bind(&record.eligibility)
        .bind(&record.applicant_types)
        .bind(&record.funding_categories)
        .bind(&record.keywords)
        .bind(&record.tags)
        .bind(record.data_freshness)
        .bind(record.last_verified)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, record: &Opportunity) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            UPDATE opportunities
               SET title = $3, description = $4, agency = $5, agency_code = $6,
                   program = $7, opportunity_type = $8, status = $9,
                   award_floor_cents = $10, award_ceiling_cents = $11,
                   estimated_funding_cents = $12, post_date = $13, close_date = $14,
                   archive_date = $15, eligibility = $16, applicant_types = $17,
                   funding_categories = $18, keywords = $19, tags = $20,
                   data_freshness = $21, last_verified = $22, updated_at = $23
             WHERE source = $1 AND external_id = $2
            "#,
        )
        .bind(record.source.as_str())
        .bind(&record.external_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.agency)
        .bind(&record.agency_code)
        .bind(&record.program)
        .bind(&record.opportunity_type)
        .bind(record.status.as_str())
        .bind(record.award_floor_cents)
        .bind(record.award_ceiling_cents)
        .bind(record.estimated_funding_cents)
        .bind(record.post_date)
        .bind(record.close_date)
        .bind(record.archive_date)
        .bind(&record.eligibility)
        .bind(&record.applicant_types)
        .bind(&record.funding_categories)
        .bind(&record.keywords)
        .bind(&record.tags)
        .bind(record.data_freshness)
        .bind(record.last_verified)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_ingestion_log(
        &self,
        entry: &IngestionLogEntry,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_log (
                id, source, status, fetched, inserted, updated, skipped, failed,
                started_at, completed_at, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.source.as_str())
        .bind(entry.status.as_str())
        .bind(entry.counts.fetched as i32)
        .bind(entry.counts.inserted as i32)
        .bind(entry.counts.updated as i32)
        .bind(entry.counts.skipped as i32)
        .bind(entry.counts.failed as i32)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_closed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            r#"
            DELETE FROM opportunities
             WHERE status = 'closed'
               AND COALESCE(archive_date, close_date) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Mutex-guarded in-memory store for tests and local dry runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: StdMutex<HashMap<(Source, String), Opportunity>>,
    log: StdMutex<Vec<IngestionLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn log_entries(&self) -> Vec<IngestionLogEntry> {
        self.log.lock().expect("store lock poisoned").clone()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn find_by_source_key(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<Option<Opportunity>, PersistenceError> {
        let rows = self.rows.lock().expect("store lock poisoned");
        Ok(rows.get(&(source, external_id.to_string())).cloned())
    }

    async fn insert(&self, record: &Opportunity) -> Result<(), PersistenceError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        let key = (record.source, record.external_id.clone());
        if rows.contains_key(&key) {
            return Err(PersistenceError::Other(format!(
                "duplicate key {}/{}",
                record.source, record.external_id
            )));
        }
        rows.insert(key, record.clone());
        Ok(())
    }

    async fn update(&self, record: &Opportunity) -> Result<(), PersistenceError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        let key = (record.source, record.external_id.clone());
        match rows.get_mut(&key) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(PersistenceError::Other(format!(
                "missing row {}/{}",
                record.source, record.external_id
            ))),
        }
    }

    async fn append_ingestion_log(
        &self,
        entry: &IngestionLogEntry,
    ) -> Result<(), PersistenceError> {
        self.log
            .lock()
            .expect("store lock poisoned")
            .push(entry.clone());
        Ok(())
    }

    async fn delete_closed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        let before = rows.len();
        rows.retain(|_, record| {
            if record.status != OpportunityStatus::Closed {
                return true;
            }
            match record.archive_date.or(record.close_date) {
                Some(reference) => reference >= cutoff,
                None => true,
            }
        });
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn sample(source: Source, external_id: &str, status: OpportunityStatus) -> Opportunity {
        let observed = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();
        Opportunity {
            id: Opportunity::compose_id(source, external_id),
            source,
            external_id: external_id.to_string(),
            title: format!("Opportunity {external_id}"),
            description: String::new(),
            agency: "Test Agency".into(),
            agency_code: None,
            program: None,
            opportunity_type: None,
            status,
            award_floor_cents: None,
            award_ceiling_cents: None,
            estimated_funding_cents: None,
            post_date: None,
            close_date: Some(observed),
            archive_date: None,
            eligibility: None,
            applicant_types: vec![],
            funding_categories: vec![],
            keywords: vec![],
            tags: vec![],
            matching_score: 0.5,
            data_freshness: observed,
            last_verified: observed,
            updated_at: observed,
        }
    }

    fn search_result(records: Vec<Opportunity>) -> SearchResult {
        SearchResult {
            source_count: 1,
            partial_data: false,
            errors: vec![],
            from_cache: false,
            records,
        }
    }

    #[test]
    fn backoff_is_pure_exponential() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retryability_follows_error_class() {
        let source = Source::GrantsGov;
        assert!(SourceError::Timeout { source }.is_retryable());
        assert!(SourceError::Http { source, status: 503 }.is_retryable());
        assert!(SourceError::Http { source, status: 429 }.is_retryable());
        assert!(!SourceError::Http { source, status: 404 }.is_retryable());
        assert!(!SourceError::Parse {
            source,
            detail: "bad json".into()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let telemetry = RecordingTelemetry::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = execute_with_retry(&policy, Source::SamGov, &telemetry, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::Timeout { source: Source::SamGov })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let fetches = telemetry.fetches();
        assert_eq!(fetches.len(), 3);
        assert!(fetches.last().unwrap().success);
    }

    #[tokio::test]
    async fn retry_exhaustion_propagates_last_error() {
        let telemetry = RecordingTelemetry::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> =
            execute_with_retry(&policy, Source::GrantsGov, &telemetry, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::Timeout { source: Source::GrantsGov }) }
            })
            .await;
        assert!(matches!(result, Err(SourceError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let telemetry = RecordingTelemetry::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> =
            execute_with_retry(&policy, Source::GrantsGov, &telemetry, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SourceError::Http {
                        source: Source::GrantsGov,
                        status: 404,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(SourceError::Http { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_keys_normalize_query_and_agency() {
        assert_eq!(
            search_cache_key("Defense  AI", Some("DOD")),
            search_cache_key("defense ai", Some("dod"))
        );
        assert_ne!(
            search_cache_key("defense ai", None),
            search_cache_key("defense ai", Some("dod"))
        );
    }

    #[tokio::test]
    async fn memory_cache_round_trips_until_expiry() {
        let cache = MemoryCache::new();
        let value = search_result(vec![sample(
            Source::GrantsGov,
            "A-1",
            OpportunityStatus::Active,
        )]);
        let key = search_cache_key("ai", None);

        cache
            .put(&key, &value, Duration::from_secs(60))
            .await
            .unwrap();
        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.records, value.records);

        cache.put(&key, &value, Duration::ZERO).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_upsert_and_lookup() {
        let store = MemoryStore::new();
        let record = sample(Source::SamGov, "S-9", OpportunityStatus::Active);
        store.insert(&record).await.unwrap();
        assert!(store.insert(&record).await.is_err());

        let found = store
            .find_by_source_key(Source::SamGov, "S-9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);

        let mut updated = record.clone();
        updated.title = "Renamed".into();
        store.update(&updated).await.unwrap();
        let found = store
            .find_by_source_key(Source::SamGov, "S-9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "Renamed");
    }

    #[tokio::test]
    async fn cleanup_only_touches_long_closed_rows() {
        let store = MemoryStore::new();
        let cutoff = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).single().unwrap();

        let mut old_closed = sample(Source::GrantsGov, "OLD", OpportunityStatus::Closed);
        old_closed.close_date = Some(cutoff - chrono::Duration::days(10));
        let mut recent_closed = sample(Source::GrantsGov, "NEW", OpportunityStatus::Closed);
        recent_closed.close_date = Some(cutoff + chrono::Duration::days(10));
        let mut active = sample(Source::GrantsGov, "ACT", OpportunityStatus::Active);
        active.close_date = Some(cutoff - chrono::Duration::days(10));

        for record in [&old_closed, &recent_closed, &active] {
            store.insert(record).await.unwrap();
        }

        let removed = store.delete_closed_before(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
        assert!(store
            .find_by_source_key(Source::GrantsGov, "OLD")
            .await
            .unwrap()
            .is_none());
    }
}
