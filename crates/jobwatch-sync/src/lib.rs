//! Watch cycle orchestration: fetch → extract → diff → persist → gate → deliver.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_adapters::{JobTableAdapter, ListingExtractor};
use jobwatch_core::{compute_diff, ChangeKind, DiffCounts, JobDiff, JobListing, JobRecord, Snapshot};
use jobwatch_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, NotificationLedger, PageFetcher, SnapshotStore,
    StoreError,
};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-sync";

pub const DEFAULT_WATCH_URL: &str = "https://brigoska.cz/cs/mista";

const SUBJECT_PREFIX: &str = "[Website Change Catcher]";
const RAW_SNIPPET_CHARS: usize = 200;
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, Clone, Default)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
    pub recipients: Vec<String>,
}

impl SmtpSettings {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.is_none() {
            missing.push("SMTP_HOST");
        }
        if self.username.is_none() {
            missing.push("SMTP_USER");
        }
        if self.password.is_none() {
            missing.push("SMTP_PASS");
        }
        if self.from.is_none() {
            missing.push("EMAIL_FROM");
        }
        if self.recipients.is_empty() {
            missing.push("EMAIL_TO");
        }
        missing
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub watch_url: String,
    pub check_interval: Duration,
    pub state_db_path: PathBuf,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub smtp: SmtpSettings,
}

impl WatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let interval_minutes: u64 = parse_or(var("CHECK_INTERVAL_MINUTES"), 30)
            .context("CHECK_INTERVAL_MINUTES must be a whole number of minutes")?;
        let http_timeout_secs: u64 = parse_or(var("JOBWATCH_HTTP_TIMEOUT_SECS"), 30)
            .context("JOBWATCH_HTTP_TIMEOUT_SECS must be a whole number of seconds")?;
        let http_max_retries: usize = parse_or(var("JOBWATCH_HTTP_MAX_RETRIES"), 2)
            .context("JOBWATCH_HTTP_MAX_RETRIES must be a non-negative integer")?;
        let smtp_port: u16 =
            parse_or(var("SMTP_PORT"), 587).context("SMTP_PORT must be a valid port number")?;

        let recipients = var("EMAIL_TO")
            .map(|to| {
                to.split(',')
                    .map(str::trim)
                    .filter(|addr| !addr.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            watch_url: var("WATCH_URL").unwrap_or_else(|| DEFAULT_WATCH_URL.to_string()),
            check_interval: Duration::from_secs(interval_minutes.saturating_mul(60)),
            state_db_path: var("STATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state.db")),
            http_timeout_secs,
            http_max_retries,
            smtp: SmtpSettings {
                host: var("SMTP_HOST"),
                port: smtp_port,
                username: var("SMTP_USER"),
                password: var("SMTP_PASS"),
                from: var("EMAIL_FROM"),
                recipients,
            },
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> Result<T, T::Err> {
    value.map(|v| v.parse()).unwrap_or(Ok(default))
}

/// Widens `added` to every listing currently on the page. The snapshot is
/// persisted before delivery, so a listing whose first announcement failed is
/// no longer new to the diff; the ledger decides what is still unannounced.
pub fn announcement_candidates(diff: &JobDiff, current: &Snapshot) -> JobDiff {
    JobDiff {
        added: current.records().cloned().collect(),
        removed: diff.removed.clone(),
        modified: diff.modified.clone(),
    }
}

/// Keeps only the changes whose (key, kind) has no ledger entry yet.
/// Modified pairs are looked up under the new record's key.
pub async fn filter_unannounced<L>(diff: &JobDiff, ledger: &L) -> Result<JobDiff, StoreError>
where
    L: NotificationLedger + ?Sized,
{
    let mut pending = JobDiff::default();

    for record in &diff.added {
        if !ledger.was_notified(record.key(), ChangeKind::Added).await? {
            pending.added.push(record.clone());
        }
    }
    for record in &diff.removed {
        if !ledger.was_notified(record.key(), ChangeKind::Removed).await? {
            pending.removed.push(record.clone());
        }
    }
    for (old, new) in &diff.modified {
        if !ledger.was_notified(new.key(), ChangeKind::Modified).await? {
            pending.modified.push((old.clone(), new.clone()));
        }
    }

    Ok(pending)
}

/// Records what the gate let through. Removed and modified entries are never
/// delivered and are always marked; added entries are marked only after a
/// successful delivery so a failed one is retried next cycle.
pub async fn acknowledge<L>(pending: &JobDiff, added_delivered: bool, ledger: &L) -> Result<(), StoreError>
where
    L: NotificationLedger + ?Sized,
{
    if added_delivered {
        for record in &pending.added {
            ledger.mark_notified(record.key(), ChangeKind::Added).await?;
        }
    }
    for record in &pending.removed {
        ledger.mark_notified(record.key(), ChangeKind::Removed).await?;
    }
    for (_, new) in &pending.modified {
        ledger.mark_notified(new.key(), ChangeKind::Modified).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

fn weekday_or_dash(listing: &JobListing) -> &str {
    if listing.day_of_week.is_empty() {
        "-"
    } else {
        &listing.day_of_week
    }
}

/// Plain-text digest of a diff; `None` when there is nothing to report.
pub fn compose_email(diff: &JobDiff, url: &str, checked_at: DateTime<Utc>) -> Option<EmailContent> {
    if diff.is_empty() {
        return None;
    }

    let mut lines: Vec<String> = Vec::new();

    if !diff.added.is_empty() {
        lines.push("=== NEW JOBS ===\n".to_string());
        for record in &diff.added {
            let job = record.listing();
            lines.push(format!("Title: {}", job.title));
            lines.push(format!("Location: {}", job.location));
            lines.push(format!("Date: {}", job.date));
            lines.push(format!("Day of week: {}", weekday_or_dash(job)));
            lines.push(format!("Time: {}", job.time_range));
            lines.push(format!("Duration: {}h", job.duration));
            lines.push(format!("Wage: {}", job.wage));
            lines.push(format!(
                "Raw: {}",
                job.raw_text.chars().take(RAW_SNIPPET_CHARS).collect::<String>()
            ));
            lines.push(String::new());
        }
    }

    if !diff.removed.is_empty() {
        lines.push("=== REMOVED JOBS ===\n".to_string());
        for record in &diff.removed {
            let job = record.listing();
            lines.push(format!("Title: {}", job.title));
            lines.push(format!("Location: {}", job.location));
            lines.push(format!("Date: {}", job.date));
            lines.push(format!("Day of week: {}", weekday_or_dash(job)));
            lines.push(format!("Time: {}", job.time_range));
            lines.push(format!("Wage: {}", job.wage));
            lines.push(String::new());
        }
    }

    if !diff.modified.is_empty() {
        lines.push("=== CHANGED JOBS ===\n".to_string());
        for (old, new) in &diff.modified {
            let (old, new) = (old.listing(), new.listing());
            lines.push(format!("Title: {} -> {}", old.title, new.title));
            lines.push(format!("Location: {} -> {}", old.location, new.location));
            lines.push(format!("Date: {} -> {}", old.date, new.date));
            lines.push(format!(
                "Day of week: {} -> {}",
                weekday_or_dash(old),
                weekday_or_dash(new)
            ));
            lines.push(format!("Time: {} -> {}", old.time_range, new.time_range));
            lines.push(format!("Duration: {}h -> {}h", old.duration, new.duration));
            lines.push(format!("Wage: {} -> {}", old.wage, new.wage));
            lines.push(String::new());
        }
    }

    lines.push(format!("\n---\nChecked at: {}", checked_at.to_rfc3339()));
    lines.push(format!("URL: {url}"));

    let counts = diff.counts();
    Some(EmailContent {
        subject: format!(
            "{SUBJECT_PREFIX} Update: +{} new / -{} removed / ~{} changed",
            counts.added, counts.removed, counts.modified
        ),
        body: lines.join("\n"),
    })
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("smtp settings incomplete, missing {0}")]
    NotConfigured(String),
    #[error("nothing to deliver")]
    EmptyDigest,
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Outward delivery of a change digest.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, diff: &JobDiff, context_url: &str) -> Result<(), DeliveryError>;
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS from the first byte (SMTPS).
    Implicit,
    StartTls,
}

impl TlsMode {
    pub fn for_port(port: u16) -> Self {
        if port == IMPLICIT_TLS_PORT {
            TlsMode::Implicit
        } else {
            TlsMode::StartTls
        }
    }
}

/// App passwords are often pasted with their grouping spaces.
pub fn normalized_password(raw: &str) -> String {
    raw.replace(' ', "")
}

#[derive(Debug, Clone)]
pub struct SmtpNotifier {
    settings: SmtpSettings,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn build_message(&self, from: &str, content: EmailContent) -> Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(from.parse::<Mailbox>()?)
            .subject(content.subject);
        for recipient in &self.settings.recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }
        Ok(builder.header(ContentType::TEXT_PLAIN).body(content.body)?)
    }

    fn transport(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let credentials = Credentials::new(username.to_string(), normalized_password(password));
        let builder = match TlsMode::for_port(self.settings.port) {
            TlsMode::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
        };
        Ok(builder
            .port(self.settings.port)
            .credentials(credentials)
            .build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn deliver(&self, diff: &JobDiff, context_url: &str) -> Result<(), DeliveryError> {
        let settings = &self.settings;
        let (Some(host), Some(username), Some(password), Some(from), false) = (
            settings.host.as_deref(),
            settings.username.as_deref(),
            settings.password.as_deref(),
            settings.from.as_deref(),
            settings.recipients.is_empty(),
        ) else {
            return Err(DeliveryError::NotConfigured(settings.missing_fields().join(", ")));
        };

        let content = compose_email(diff, context_url, Utc::now()).ok_or(DeliveryError::EmptyDigest)?;
        let message = self.build_message(from, content)?;
        let transport = self.transport(host, username, password)?;
        transport.send(message).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    NotNeeded,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listings: usize,
    pub changes: DiffCounts,
    /// Entries written to the ledger this cycle; undelivered additions are not counted.
    pub announced: DiffCounts,
    pub delivery: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(CycleSummary),
    Skipped { cycle_id: Uuid, reason: String },
}

pub struct WatchPipeline {
    config: WatchConfig,
    store: SnapshotStore,
    fetcher: Box<dyn PageFetcher>,
    extractor: Box<dyn ListingExtractor>,
    notifier: Box<dyn Notifier>,
}

impl WatchPipeline {
    pub async fn new(config: WatchConfig) -> Result<Self> {
        let store = SnapshotStore::open(&config.state_db_path)
            .await
            .with_context(|| format!("opening state database {}", config.state_db_path.display()))?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let notifier = SmtpNotifier::new(config.smtp.clone());
        Ok(Self::from_parts(
            config,
            store,
            Box::new(fetcher),
            Box::<JobTableAdapter>::default(),
            Box::new(notifier),
        ))
    }

    pub fn from_parts(
        config: WatchConfig,
        store: SnapshotStore,
        fetcher: Box<dyn PageFetcher>,
        extractor: Box<dyn ListingExtractor>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            extractor,
            notifier,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// One full cycle. Fetch failures skip the cycle; storage failures are
    /// returned before anything is marked or sent.
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let cycle_id = Uuid::new_v4();
        self.run_cycle(cycle_id)
            .instrument(info_span!("watch_cycle", %cycle_id))
            .await
    }

    async fn run_cycle(&self, cycle_id: Uuid) -> Result<CycleOutcome> {
        let started_at = Utc::now();
        let url = self.config.watch_url.as_str();

        info!(url, "fetching listing page");
        let page = match self.fetcher.fetch_page(url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "fetch failed; skipping update");
                return Ok(CycleOutcome::Skipped {
                    cycle_id,
                    reason: err.to_string(),
                });
            }
        };

        let listings = self
            .extractor
            .parse_listing(&page.body)
            .with_context(|| format!("extracting listings from {}", page.final_url))?;
        let extracted = listings.len();
        let current: Snapshot = listings.into_iter().map(JobRecord::new).collect();
        let unique = current.len();
        info!(extracted, unique, "parsed listing page");

        let previous = self.store.load_all().await.context("loading stored snapshot")?;
        let diff = compute_diff(&previous, &current);

        // Persisted before gating: a crash past this point can only repeat an
        // announcement attempt, never lose the snapshot.
        self.store
            .upsert(&current.records().cloned().collect::<Vec<_>>())
            .await
            .context("persisting snapshot")?;

        let candidates = announcement_candidates(&diff, &current);
        let pending = filter_unannounced(&candidates, &self.store)
            .await
            .context("checking notification ledger")?;
        info!(changes = %diff.counts(), to_notify = %pending.counts(), "computed changes");
        for change in pending.changes() {
            debug!(kind = %change.kind(), key = %change.key(), "unannounced change");
        }

        let delivery = if pending.added.is_empty() {
            DeliveryStatus::NotNeeded
        } else {
            match self.notifier.deliver(&pending.added_only(), url).await {
                Ok(()) => {
                    info!(added = pending.added.len(), "delivered new listings");
                    DeliveryStatus::Delivered
                }
                Err(err) => {
                    error!(error = %err, "delivery failed; new listings stay pending");
                    DeliveryStatus::Failed
                }
            }
        };

        let delivered = delivery == DeliveryStatus::Delivered;
        acknowledge(&pending, delivered, &self.store)
            .await
            .context("recording notifications")?;

        let announced = DiffCounts {
            added: if delivered { pending.added.len() } else { 0 },
            ..pending.counts()
        };

        Ok(CycleOutcome::Completed(CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            listings: unique,
            changes: diff.counts(),
            announced,
            delivery,
        }))
    }

    /// Runs cycles back to back, sleeping `check_interval` between them, until
    /// `shutdown` flips to true or its sender is dropped. A running cycle is
    /// always finished first.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let interval = self.config.check_interval;

        loop {
            match self.run_once().await {
                Ok(CycleOutcome::Completed(summary)) => info!(
                    changes = %summary.changes,
                    announced = %summary.announced,
                    delivery = ?summary.delivery,
                    "watch cycle complete"
                ),
                Ok(CycleOutcome::Skipped { reason, .. }) => warn!(%reason, "watch cycle skipped"),
                Err(err) => error!(error = ?err, "watch cycle failed; nothing was notified"),
            }

            if *shutdown.borrow() {
                break;
            }

            info!(seconds = interval.as_secs(), "waiting for next check");
            let stop = tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if stop || *shutdown.borrow() {
                break;
            }
        }

        info!("watch loop stopped");
        Ok(())
    }

    /// `run_until` wired to Ctrl-C.
    pub async fn run_forever(&self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received; stopping after the current cycle");
                    let _ = stop_tx.send(true);
                }
                Err(err) => {
                    error!(error = %err, "cannot listen for ctrl-c");
                    stop_tx.closed().await;
                }
            }
        });
        self.run_until(stop_rx).await
    }
}
