//! Durable snapshot + notification ledger storage and HTTP page fetching for jobwatch.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{compute_identity, ChangeKind, IdentityKey, JobListing, JobRecord, ParseChangeKindError, Snapshot};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
pub use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobwatch-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt ledger row: {0}")]
    InvalidChangeKind(#[from] ParseChangeKindError),
}

/// Presence-checked history of announced changes.
#[async_trait]
pub trait NotificationLedger: Send + Sync {
    /// True iff at least one entry exists for exactly this (key, kind).
    async fn was_notified(&self, key: &IdentityKey, kind: ChangeKind) -> Result<bool, StoreError>;

    /// Appends one entry stamped with the current time.
    async fn mark_notified(&self, key: &IdentityKey, kind: ChangeKind) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEntry {
    pub key: IdentityKey,
    pub kind: ChangeKind,
    pub notified_at: DateTime<Utc>,
}

/// SQLite-backed store holding the latest record per identity key and the
/// append-only notification ledger. Single writer.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Opens (creating if missing) the state database and applies migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Every persisted record, keyed by its stored identity.
    pub async fn load_all(&self) -> Result<Snapshot, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_key, title, location, date, day_of_week, time_range,
                   duration, wage, raw_text, first_seen, last_seen
              FROM jobs
             ORDER BY job_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = Snapshot::new();
        for row in rows {
            let key = IdentityKey::new(row.try_get::<String, _>("job_key")?);
            let listing = JobListing {
                title: row.try_get("title")?,
                location: row.try_get("location")?,
                date: row.try_get("date")?,
                day_of_week: row.try_get("day_of_week")?,
                time_range: row.try_get("time_range")?,
                duration: row.try_get("duration")?,
                wage: row.try_get("wage")?,
                raw_text: row.try_get("raw_text")?,
            };
            let recomputed = compute_identity(&listing);
            if recomputed != key {
                warn!(stored = %key, %recomputed, "stored identity key no longer matches its fields");
            }
            let first_seen: DateTime<Utc> = row.try_get("first_seen")?;
            let last_seen: DateTime<Utc> = row.try_get("last_seen")?;
            snapshot.insert(JobRecord::restore(
                key,
                listing,
                Some(first_seen),
                Some(last_seen),
            ));
        }
        Ok(snapshot)
    }

    pub async fn upsert(&self, records: &[JobRecord]) -> Result<(), StoreError> {
        self.upsert_at(records, Utc::now()).await
    }

    /// Inserts unseen keys with `first_seen = last_seen = now`; for known keys
    /// overwrites every text field and advances `last_seen` only. One
    /// transaction per call.
    pub async fn upsert_at(&self, records: &[JobRecord], now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let listing = record.listing();
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    job_key, title, location, date, day_of_week, time_range,
                    duration, wage, raw_text, first_seen, last_seen
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (job_key) DO UPDATE SET
                    title = excluded.title,
                    location = excluded.location,
                    date = excluded.date,
                    day_of_week = excluded.day_of_week,
                    time_range = excluded.time_range,
                    duration = excluded.duration,
                    wage = excluded.wage,
                    raw_text = excluded.raw_text,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(record.key().as_str())
            .bind(&listing.title)
            .bind(&listing.location)
            .bind(&listing.date)
            .bind(&listing.day_of_week)
            .bind(&listing.time_range)
            .bind(&listing.duration)
            .bind(&listing.wage)
            .bind(&listing.raw_text)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(records = records.len(), "upserted snapshot");
        Ok(())
    }

    pub async fn mark_notified_at(
        &self,
        key: &IdentityKey,
        kind: ChangeKind,
        notified_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (job_key, change_kind, notified_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(key.as_str())
        .bind(kind.as_str())
        .bind(notified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full ledger in insertion order.
    pub async fn load_ledger(&self) -> Result<Vec<NotificationEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_key, change_kind, notified_at
              FROM notifications
             ORDER BY notification_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<NotificationEntry, StoreError> {
                let kind: String = row.try_get("change_kind")?;
                Ok(NotificationEntry {
                    key: IdentityKey::new(row.try_get::<String, _>("job_key")?),
                    kind: kind.parse()?,
                    notified_at: row.try_get("notified_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl NotificationLedger for SnapshotStore {
    async fn was_notified(&self, key: &IdentityKey, kind: ChangeKind) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM notifications
             WHERE job_key = ? AND change_kind = ?
            "#,
        )
        .bind(key.as_str())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn mark_notified(&self, key: &IdentityKey, kind: ChangeKind) -> Result<(), StoreError> {
        self.mark_notified_at(key, kind, Utc::now()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Not-found means the page is gone; every other failure status is retried.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::NOT_FOUND {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Timeouts, connect failures and request-build errors are retried.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    match (err.is_timeout(), err.is_connect(), err.is_request()) {
        (false, false, false) => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
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
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay * 2^retry`, never above `max_delay`.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 2u32.checked_pow(shift))
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor));
        doubled.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "cs,en;q=0.9".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("page not found: {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Source of page text for a watch cycle.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("invalid Accept-Language value")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::NotFound { url: final_url });
                    }
                    if attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(attempt, status = status.as_u16(), "retrying after http status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    debug!(attempt, error = %err, "retrying after request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 26, hour, 0, 0).single().expect("ts")
    }

    fn record(title: &str, wage: &str) -> JobRecord {
        JobRecord::new(JobListing {
            title: title.to_string(),
            location: "Praha".to_string(),
            date: "26.1.2026".to_string(),
            day_of_week: "Po".to_string(),
            time_range: "06:00 - 14:00".to_string(),
            duration: "8".to_string(),
            wage: wage.to_string(),
            raw_text: format!("» {title} Praha 26.1.2026 Po 06:00 - 14:00 (8h) {wage}"),
        })
    }

    async fn open_store(dir: &tempfile::TempDir) -> SnapshotStore {
        SnapshotStore::open(dir.path().join("state.db"))
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips_records_with_sightings() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let job = record("Skladník", "180 Kč/h");

        store.upsert_at(&[job.clone()], ts(6)).await.expect("upsert");
        let snapshot = store.load_all().await.expect("load");

        let loaded = snapshot.get(job.key()).expect("record persisted");
        assert_eq!(loaded.listing(), job.listing());
        assert_eq!(loaded.first_seen(), Some(ts(6)));
        assert_eq!(loaded.last_seen(), Some(ts(6)));
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_first_seen_and_advances_last_seen() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let job = record("Skladník", "180 Kč/h");
        let reformatted = JobRecord::new(JobListing {
            duration: "8.0".to_string(),
            raw_text: "» Skladník Praha (reformatted)".to_string(),
            ..job.listing().clone()
        });
        assert_eq!(job.key(), reformatted.key());

        store.upsert_at(&[job.clone()], ts(6)).await.expect("first upsert");
        store.upsert_at(&[reformatted.clone()], ts(7)).await.expect("second upsert");

        let snapshot = store.load_all().await.expect("load");
        assert_eq!(snapshot.len(), 1);
        let loaded = snapshot.get(job.key()).expect("record");
        assert_eq!(loaded.first_seen(), Some(ts(6)));
        assert_eq!(loaded.last_seen(), Some(ts(7)));
        assert_eq!(loaded.listing().duration, "8.0");
        assert_eq!(loaded.listing().raw_text, reformatted.listing().raw_text);
    }

    #[tokio::test]
    async fn state_survives_reopening_the_database() {
        let dir = tempdir().expect("tempdir");
        let job = record("Pomocník", "200 Kč/h");
        {
            let store = open_store(&dir).await;
            store.upsert(&[job.clone()]).await.expect("upsert");
            store
                .mark_notified(job.key(), ChangeKind::Added)
                .await
                .expect("mark");
            store.close().await;
        }

        let store = open_store(&dir).await;
        assert!(store.load_all().await.expect("load").contains_key(job.key()));
        assert!(store
            .was_notified(job.key(), ChangeKind::Added)
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn ledger_lookup_matches_exact_key_and_kind() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let job = record("Skladník", "180 Kč/h");
        let other = record("Kuchař", "190 Kč/h");

        assert!(!store.was_notified(job.key(), ChangeKind::Added).await.expect("lookup"));

        store.mark_notified(job.key(), ChangeKind::Added).await.expect("mark");

        assert!(store.was_notified(job.key(), ChangeKind::Added).await.expect("lookup"));
        assert!(!store.was_notified(job.key(), ChangeKind::Modified).await.expect("lookup"));
        assert!(!store.was_notified(job.key(), ChangeKind::Removed).await.expect("lookup"));
        assert!(!store.was_notified(other.key(), ChangeKind::Added).await.expect("lookup"));
    }

    #[tokio::test]
    async fn repeated_marks_append_rows_without_changing_the_answer() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let job = record("Skladník", "180 Kč/h");

        store
            .mark_notified_at(job.key(), ChangeKind::Removed, ts(6))
            .await
            .expect("mark");
        store
            .mark_notified_at(job.key(), ChangeKind::Removed, ts(9))
            .await
            .expect("mark again");

        let ledger = store.load_ledger().await.expect("ledger");
        assert_eq!(ledger.len(), 2);
        assert!(ledger.iter().all(|e| e.key == *job.key() && e.kind == ChangeKind::Removed));
        assert_eq!(ledger[0].notified_at, ts(6));
        assert!(store.was_notified(job.key(), ChangeKind::Removed).await.expect("lookup"));
    }

    #[test]
    fn default_backoff_doubles_from_one_second_up_to_eight() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.max_retries, 2);
        let delays: Vec<u64> = (0..6).map(|retry| policy.delay_for_attempt(retry).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(8));
    }

    #[test]
    fn only_not_found_is_final() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        for status in [
            StatusCode::FORBIDDEN,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
        ] {
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{status}");
        }
    }

    /// Serves one canned response per accepted connection, in order.
    async fn serve_responses(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.expect("accept");
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.expect("read");
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.expect("write");
                socket.shutdown().await.ok();
            }
        });
        format!("http://{addr}/cs/mista")
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn fetch_retries_server_errors_until_success() {
        let url = serve_responses(vec![(503, "busy"), (200, "<table></table>")]).await;
        let page = fast_fetcher(2).fetch_page(&url).await.expect("fetch");
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.body, "<table></table>");
    }

    #[tokio::test]
    async fn fetch_gives_up_immediately_on_not_found() {
        let url = serve_responses(vec![(404, "gone")]).await;
        let err = fast_fetcher(2).fetch_page(&url).await.expect_err("404 is final");
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fetch_reports_last_status_when_retries_run_out() {
        let url = serve_responses(vec![(500, "a"), (502, "b")]).await;
        let err = fast_fetcher(1).fetch_page(&url).await.expect_err("retries exhausted");
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
    }
}
