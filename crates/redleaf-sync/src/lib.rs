//! Sync pipeline: fetch, extract, normalize, reconcile, notify, report.
//! Also owns the notices page scrape.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use redleaf_adapters::{AdapterError, SourceConfig, SourceRegistry};
use redleaf_core::{NoticeSnapshot, Record, SourceReport, SyncCounts, SyncReport};
use redleaf_storage::{
    FetchError, Fetcher, Mailer, NoticeStore, RawArchive, RecordStore, SubscriberStore,
};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dispatch;
pub mod identity;
pub mod notices;
pub mod reconcile;

pub use dispatch::{render_email, DispatchSummary, Dispatcher, NotificationContext};
pub use identity::{assign_identity, fingerprint, slug, Identity};
pub use notices::{NoticeError, NoticeScraper, DEFAULT_NOTICES_URL};
pub use reconcile::{ReconcileOutcome, Reconciler};

pub const CRATE_NAME: &str = "redleaf-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources_file: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_deadline_secs: u64,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    pub preferences_url: String,
    pub send_concurrency: usize,
    pub scheduler_enabled: bool,
    /// Six fields, seconds first.
    pub sync_cron: String,
    pub notices_url: String,
    pub notices_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("sources.yaml"),
            artifacts_dir: None,
            reports_dir: None,
            user_agent: "redleaf-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_deadline_secs: 60,
            resend_api_key: None,
            email_from: "RedLeaf Stats <notify@redleafstats.com>".to_string(),
            preferences_url: "https://redleafstats.com/preferences".to_string(),
            send_concurrency: 8,
            scheduler_enabled: false,
            sync_cron: "0 0 3 * * *".to_string(),
            notices_url: DEFAULT_NOTICES_URL.to_string(),
            notices_cron: "0 0 4 * * *".to_string(),
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a number, got {value:?}")),
        None => Ok(default),
    }
}

impl SyncConfig {
    /// Reads the process environment (after loading `.env` when present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Ok(Self {
            sources_file: env_opt("SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            artifacts_dir: env_opt("ARTIFACTS_DIR").map(PathBuf::from),
            reports_dir: env_opt("REPORTS_DIR").map(PathBuf::from),
            user_agent: env_opt("REDLEAF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("REDLEAF_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            fetch_deadline_secs: env_parse(
                "REDLEAF_FETCH_DEADLINE_SECS",
                defaults.fetch_deadline_secs,
            )?,
            resend_api_key: env_opt("RESEND_API_KEY"),
            email_from: env_opt("REDLEAF_EMAIL_FROM").unwrap_or(defaults.email_from),
            preferences_url: env_opt("REDLEAF_PREFERENCES_URL").unwrap_or(defaults.preferences_url),
            send_concurrency: env_parse("REDLEAF_SEND_CONCURRENCY", defaults.send_concurrency)?,
            scheduler_enabled: env_opt("REDLEAF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_opt("SYNC_CRON").unwrap_or(defaults.sync_cron),
            notices_url: env_opt("REDLEAF_NOTICES_URL").unwrap_or(defaults.notices_url),
            notices_cron: env_opt("NOTICES_CRON").unwrap_or(defaults.notices_cron),
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("loading source registry: {0:#}")]
    Registry(anyhow::Error),
    #[error("fetching {source_id}: {source}")]
    Fetch {
        source_id: String,
        #[source]
        source: FetchError,
    },
    #[error("fetching {source_id}: no response within {deadline:?}")]
    FetchTimeout { source_id: String, deadline: Duration },
    #[error("extracting {source_id}: {source}")]
    Extract {
        source_id: String,
        #[source]
        source: AdapterError,
    },
}

impl SyncError {
    /// Upstream could not be reached; the run is safe to retry as-is.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, SyncError::Fetch { .. } | SyncError::FetchTimeout { .. })
    }
}

/// What a run does with records that still owe an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Dispatch,
    /// Seeds an empty store: everything found is marked as announced, nothing is sent.
    Acknowledge,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: Arc<dyn Fetcher>,
    records: Arc<dyn RecordStore>,
    archive: Option<RawArchive>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    notices: Option<NoticeScraper>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        fetcher: Arc<dyn Fetcher>,
        records: Arc<dyn RecordStore>,
        subscribers: Arc<dyn SubscriberStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let archive = config.artifacts_dir.clone().map(RawArchive::new);
        let reconciler = Reconciler::new(records.clone());
        let dispatcher = Dispatcher::new(
            records.clone(),
            subscribers,
            mailer,
            config.send_concurrency,
        );
        Self {
            config,
            fetcher,
            records,
            archive,
            reconciler,
            dispatcher,
            notices: None,
        }
    }

    /// Enables the notices scrape, storing snapshots in `store`.
    pub fn with_notices(mut self, store: Arc<dyn NoticeStore>) -> Self {
        self.notices = Some(NoticeScraper::new(
            self.fetcher.clone(),
            store,
            self.config.notices_url.clone(),
            Duration::from_secs(self.config.fetch_deadline_secs),
        ));
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn records(&self) -> Arc<dyn RecordStore> {
        self.records.clone()
    }

    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        self.run(Delivery::Dispatch).await
    }

    /// One run that records every current draw as already announced. Meant for
    /// the first run against an empty store, so published history is not emailed.
    pub async fn bootstrap(&self) -> Result<SyncReport, SyncError> {
        self.run(Delivery::Acknowledge).await
    }

    pub async fn scrape_notices(&self) -> Result<NoticeSnapshot, NoticeError> {
        match &self.notices {
            Some(notices) => notices.scrape().await,
            None => Err(NoticeError::NotConfigured),
        }
    }

    pub async fn latest_notice(&self) -> Result<Option<NoticeSnapshot>, NoticeError> {
        match &self.notices {
            Some(notices) => notices.latest().await,
            None => Err(NoticeError::NotConfigured),
        }
    }

    async fn run(&self, delivery: Delivery) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        self.run_sources(run_id, delivery)
            .instrument(info_span!("sync_run", %run_id, ?delivery))
            .await
    }

    async fn run_sources(&self, run_id: Uuid, delivery: Delivery) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let registry = self
            .load_source_registry()
            .await
            .map_err(SyncError::Registry)?;

        let mut report = SyncReport {
            run_id,
            started_at,
            finished_at: started_at,
            totals: SyncCounts::default(),
            sources: Vec::new(),
        };
        for source in registry.enabled() {
            let counts = self
                .sync_source(source, delivery)
                .instrument(info_span!("source", source_id = %source.source_id))
                .await?;
            report.totals.absorb(&counts);
            report.sources.push(SourceReport {
                source_id: source.source_id.clone(),
                counts,
            });
        }
        report.finished_at = Utc::now();

        if let Some(dir) = &self.config.reports_dir {
            match write_report(dir, &report).await {
                Ok(path) => debug!(path = %path.display(), "run report written"),
                Err(err) => warn!(error = %err, "run report not written"),
            }
        }
        info!(
            inserted = report.totals.inserted,
            updated = report.totals.updated,
            unchanged = report.totals.unchanged,
            skipped = report.totals.skipped,
            emailed = report.totals.emailed,
            email_failed = report.totals.email_failed,
            "sync run finished"
        );
        Ok(report)
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        delivery: Delivery,
    ) -> Result<SyncCounts, SyncError> {
        let source_id = source.source_id.clone();
        let adapter = source.adapter().map_err(|e| SyncError::Extract {
            source_id: source_id.clone(),
            source: e,
        })?;

        let deadline = Duration::from_secs(self.config.fetch_deadline_secs);
        let page = match tokio::time::timeout(deadline, self.fetcher.fetch(&source.url)).await {
            Ok(Ok(page)) => page,
            Ok(Err(err)) => {
                error!(error = %err, "fetch failed; aborting run");
                return Err(SyncError::Fetch { source_id, source: err });
            }
            Err(_) => {
                error!(?deadline, "fetch deadline exceeded; aborting run");
                return Err(SyncError::FetchTimeout { source_id, deadline });
            }
        };
        let mut counts = SyncCounts {
            fetched: 1,
            ..SyncCounts::default()
        };

        if let Some(archive) = &self.archive {
            match archive.archive(&source.source_id, &page).await {
                Ok(archived) => debug!(
                    path = %archived.relative_path.display(),
                    already_present = archived.already_present,
                    "raw page archived"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "raw page not archived; continuing"),
            }
        }

        let parsed = adapter
            .parse(&page.text(), &page.content_type)
            .map_err(|e| SyncError::Extract {
                source_id: source_id.clone(),
                source: e,
            })?;
        counts.extracted = parsed.extracted;
        counts.normalized = parsed.records.len();
        counts.skipped = parsed.skipped;

        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        for content in parsed.records {
            let identity = assign_identity(&content, source.id_namespace.as_deref());
            if !seen.insert(identity.id.clone()) {
                debug!(id = %identity.id, "duplicate record on page; first occurrence wins");
                counts.skipped += 1;
                continue;
            }
            let id = identity.id.clone();
            match self.reconciler.reconcile(identity, content).await {
                Ok(outcome) => {
                    debug!(%id, action = ?outcome.action, "reconciled");
                    counts.record_action(outcome.action);
                    if outcome.stored.is_eligible_for_notification() {
                        eligible.push(outcome.stored);
                    }
                }
                Err(err) => {
                    warn!(%id, error = %err, "store write failed; record skipped");
                    counts.skipped += 1;
                }
            }
        }

        if !eligible.is_empty() {
            self.deliver(source, delivery, &eligible, &mut counts).await;
        }
        Ok(counts)
    }

    async fn deliver(
        &self,
        source: &SourceConfig,
        delivery: Delivery,
        eligible: &[Record],
        counts: &mut SyncCounts,
    ) {
        match delivery {
            Delivery::Dispatch => {
                let ctx = NotificationContext {
                    program: source.program_label().to_string(),
                    preferences_url: self.config.preferences_url.clone(),
                };
                let summary = self.dispatcher.dispatch_eligible(eligible, &ctx).await;
                counts.emailed = summary.emailed;
                counts.email_failed = summary.failed;
                counts.notified = summary.notified;
            }
            Delivery::Acknowledge => {
                counts.notified = self.dispatcher.acknowledge_silently(eligible).await;
                info!(acknowledged = counts.notified, "bootstrap run; records marked as announced");
            }
        }
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = &self.config.sources_file;
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Cron-driven draw syncs, plus notices scrapes when notices are enabled.
    /// The caller starts the returned scheduler.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = &self.config.sync_cron;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(report) => info!(run_id = %report.run_id, "scheduled sync completed"),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;

        if self.notices.is_some() {
            let pipeline = Arc::clone(self);
            let cron = &self.config.notices_cron;
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    if let Err(err) = pipeline.scrape_notices().await {
                        error!(error = %err, "scheduled notices scrape failed");
                    }
                })
            })
            .with_context(|| format!("creating notices job for cron {cron}"))?;
            sched.add(job).await.context("adding notices job")?;
        }
        Ok(Some(sched))
    }
}

/// Writes `<dir>/<run_id>/sync_report.json`.
pub async fn write_report(dir: &Path, report: &SyncReport) -> Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("sync_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use redleaf_storage::{DryRunMailer, FetchedPage, MemoryStore};

    struct Offline;

    #[async_trait]
    impl Fetcher for Offline {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    fn pipeline(config: SyncConfig) -> SyncPipeline {
        let store = Arc::new(MemoryStore::new());
        SyncPipeline::new(
            config,
            Arc::new(Offline),
            store.clone(),
            store.clone(),
            Arc::new(DryRunMailer),
        )
        .with_notices(store)
    }

    #[test]
    fn fetch_errors_are_flagged_for_retry() {
        let timeout = SyncError::FetchTimeout {
            source_id: "oinp".into(),
            deadline: Duration::from_secs(60),
        };
        assert!(timeout.is_fetch_failure());
        let registry = SyncError::Registry(anyhow::anyhow!("missing"));
        assert!(!registry.is_fetch_failure());
        assert_eq!(registry.to_string(), "loading source registry: missing");
    }

    #[tokio::test]
    async fn default_schedules_are_accepted_by_the_scheduler() {
        let config = SyncConfig {
            scheduler_enabled: true,
            ..SyncConfig::default()
        };
        let pipeline = Arc::new(pipeline(config));
        let sched = pipeline.maybe_build_scheduler().await.unwrap();
        assert!(sched.is_some());
    }

    #[tokio::test]
    async fn scheduler_stays_off_unless_enabled() {
        let pipeline = Arc::new(pipeline(SyncConfig::default()));
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notices_require_a_store() {
        let store = Arc::new(MemoryStore::new());
        let bare = SyncPipeline::new(
            SyncConfig::default(),
            Arc::new(Offline),
            store.clone(),
            store,
            Arc::new(DryRunMailer),
        );
        assert!(matches!(bare.latest_notice().await, Err(NoticeError::NotConfigured)));

        let err = pipeline(SyncConfig::default()).scrape_notices().await.unwrap_err();
        assert!(err.is_fetch_failure());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.sources_file, PathBuf::from("sources.yaml"));
        assert_eq!(config.sync_cron, "0 0 3 * * *");
        assert_eq!(config.notices_cron, "0 0 4 * * *");
        assert_eq!(config.send_concurrency, 8);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.fetch_deadline_secs, 60);
    }
}
