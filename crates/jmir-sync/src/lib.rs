//! Sync orchestration: full and incremental runs, checkpoints, and the scheduler.

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jmir_adapters::{
    FetchOutcome, IssueSource, JiraClient, PaginationFetcher, SourceError, PAGINATION_CEILING,
};
use jmir_core::{
    IssueRecord, SyncHistoryEntry, SyncMode, SyncResult, SyncStatus, UNKNOWN_USER_ID,
};
use jmir_storage::{RecordStore, SqliteRecordStore, StoreError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{AppConfig, ConfigError, DatabaseSettings, JiraSettings, SyncSettings};

pub const CRATE_NAME: &str = "jmir-sync";

pub const NO_PROJECTS_WARNING: &str = "No projects specified for synchronization";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Connection test failed")]
    ConnectionTestFailed,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync cancelled")]
    Cancelled,
}

/// Knobs the orchestrator reads on every run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub project_keys: Vec<String>,
    pub page_size: usize,
    pub batch_size: usize,
    pub lookback: chrono::Duration,
    pub full_sync_on_startup: bool,
}

impl SyncOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            project_keys: config.jira.project_keys.clone(),
            page_size: config.jira.max_results_per_request,
            batch_size: config.sync.batch_size,
            lookback: chrono::Duration::days(config.sync.lookback_days),
            full_sync_on_startup: config.sync.full_sync_on_startup,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Drives the pagination fetcher and the record store for one run at a time.
pub struct SyncService<S, R> {
    source: Arc<S>,
    store: Arc<R>,
    fetcher: PaginationFetcher<Arc<S>>,
    options: SyncOptions,
}

impl<S, R> SyncService<S, R>
where
    S: IssueSource,
    R: RecordStore,
{
    pub fn new(source: Arc<S>, store: Arc<R>, options: SyncOptions) -> Self {
        let fetcher = PaginationFetcher::new(source.clone(), options.page_size);
        Self {
            source,
            store,
            fetcher,
            options,
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Full when asked for or configured on startup, else incremental.
    pub async fn sync(&self, prefer_full: bool, cancel: &CancellationToken) -> SyncResult {
        if prefer_full || self.options.full_sync_on_startup {
            self.full_sync(cancel).await
        } else {
            self.incremental_sync(cancel).await
        }
    }

    pub async fn full_sync(&self, cancel: &CancellationToken) -> SyncResult {
        let mut result = SyncResult::new(SyncMode::Full, Utc::now());
        let span = info_span!("sync_run", mode = "full", run_id = %Uuid::new_v4());
        async {
            info!("starting full synchronization");
            let outcome = self.run_full(&mut result, cancel).await;
            self.settle(&mut result, outcome).await;
        }
        .instrument(span)
        .await;
        result
    }

    /// Catches up from the last checkpoint; the first run ever is a full sync.
    pub async fn incremental_sync(&self, cancel: &CancellationToken) -> SyncResult {
        let mut result = SyncResult::new(SyncMode::Incremental, Utc::now());
        let span = info_span!("sync_run", mode = "incremental", run_id = %Uuid::new_v4());
        let needs_full = async {
            info!("starting incremental synchronization");
            let outcome = match self.checkpoint_after_preflight().await {
                Ok(Some(checkpoint)) => self.run_incremental(&mut result, checkpoint, cancel).await,
                Ok(None) => return true,
                Err(err) => Err(err),
            };
            self.settle(&mut result, outcome).await;
            false
        }
        .instrument(span)
        .await;

        if needs_full {
            warn!("no previous sync found, performing full sync instead");
            return self.full_sync(cancel).await;
        }
        result
    }

    /// Source reachability first, then store health. Failures read as `false`.
    pub async fn test_connections(&self) -> bool {
        info!("testing connections to jira and the record store");
        if !self.source.health_check().await {
            error!("jira connection test failed");
            return false;
        }
        let health = self.store.health().await;
        if !health.healthy {
            error!(problems = %health.problems.join(", "), "record store health check failed");
            return false;
        }
        info!("all connection tests passed");
        true
    }

    pub async fn last_sync_status(&self) -> SyncStatus {
        let health = self.store.health().await;
        let mut status = SyncStatus {
            healthy: health.healthy,
            total_issues: health.total_issues,
            total_projects: health.total_projects,
            last_error: health.problems.first().cloned(),
            ..SyncStatus::default()
        };

        match self.store.last_sync_by_mode(SyncMode::Full).await {
            Ok(ts) => status.last_full_sync = ts,
            Err(err) => {
                warn!(error = %err, "reading last full sync failed");
                status.last_error.get_or_insert_with(|| err.to_string());
            }
        }
        match self.store.last_sync_by_mode(SyncMode::Incremental).await {
            Ok(ts) => status.last_incremental_sync = ts,
            Err(err) => {
                warn!(error = %err, "reading last incremental sync failed");
                status.last_error.get_or_insert_with(|| err.to_string());
            }
        }
        status
    }

    async fn preflight(&self) -> Result<(), SyncError> {
        if !self.test_connections().await {
            return Err(SyncError::ConnectionTestFailed);
        }
        self.store.apply_schema().await?;
        Ok(())
    }

    async fn checkpoint_after_preflight(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.preflight().await?;
        Ok(self.store.last_checkpoint().await?)
    }

    async fn run_full(
        &self,
        result: &mut SyncResult,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.preflight().await?;
        let Some(project_keys) = self.partition_keys(result) else {
            return Ok(());
        };
        let outcome = self.fetcher.fetch_all(project_keys, cancel).await?;
        self.persist(result, outcome, cancel).await
    }

    async fn run_incremental(
        &self,
        result: &mut SyncResult,
        checkpoint: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let since = checkpoint - self.options.lookback;
        info!(%checkpoint, %since, "syncing changes since lookback instant");

        let Some(project_keys) = self.partition_keys(result) else {
            return Ok(());
        };
        let outcome = self
            .fetcher
            .fetch_updated_since(since, project_keys, cancel)
            .await?;
        if outcome.issues.is_empty() {
            info!("no issues found that need updating");
        }
        self.persist(result, outcome, cancel).await
    }

    /// Configured project keys; an empty set is a warning and yields no fetch.
    fn partition_keys(&self, result: &mut SyncResult) -> Option<&[String]> {
        if self.options.project_keys.is_empty() {
            warn!("{NO_PROJECTS_WARNING}");
            result.warn(NO_PROJECTS_WARNING);
            return None;
        }
        Some(&self.options.project_keys)
    }

    /// One store transaction per batch, in fetch order.
    async fn persist(
        &self,
        result: &mut SyncResult,
        outcome: FetchOutcome,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if outcome.truncated {
            result.warn(format!(
                "Pagination ceiling of {PAGINATION_CEILING} issues reached; results truncated"
            ));
        }
        let unidentified = count_unidentified_users(&outcome.issues);
        if unidentified > 0 {
            result.warn(format!(
                "{unidentified} user reference(s) had no account id or username and were stored as '{UNKNOWN_USER_ID}'"
            ));
        }

        let batch_size = self.options.batch_size.max(1);
        let batches = outcome.issues.len().div_ceil(batch_size);
        for (index, batch) in outcome.issues.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let stats = self.store.upsert_issues(batch, cancel).await?;
            result.issues_processed += batch.len();
            result.issues_inserted += stats.inserted;
            result.issues_updated += stats.updated;
            debug!(
                batch = index + 1,
                of = batches,
                size = batch.len(),
                inserted = stats.inserted,
                updated = stats.updated,
                "processed batch"
            );
        }
        Ok(())
    }

    async fn settle(&self, result: &mut SyncResult, outcome: Result<(), SyncError>) {
        let outcome = match outcome {
            Ok(()) => self.commit_checkpoint(result).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => info!(
                processed = result.issues_processed,
                inserted = result.issues_inserted,
                updated = result.issues_updated,
                warnings = result.warnings.len(),
                duration_ms = result.duration().as_millis() as u64,
                "synchronization completed"
            ),
            Err(err) => self.fail(result, err).await,
        }
    }

    async fn commit_checkpoint(&self, result: &mut SyncResult) -> Result<(), SyncError> {
        let finished_at = Utc::now();
        self.store
            .record_sync(&SyncHistoryEntry::completed(result, finished_at))
            .await?;
        result.finish_success(finished_at);
        Ok(())
    }

    async fn fail(&self, result: &mut SyncResult, err: SyncError) {
        result.finish_failure(Utc::now(), err.to_string());
        error!(
            error = %err,
            processed = result.issues_processed,
            duration_ms = result.duration().as_millis() as u64,
            "synchronization failed"
        );
        if let Err(log_err) = self.store.record_sync(&SyncHistoryEntry::failed(result)).await {
            warn!(error = %log_err, "could not record failed sync");
        }
    }
}

fn count_unidentified_users(issues: &[IssueRecord]) -> usize {
    issues
        .iter()
        .flat_map(|issue| [issue.fields.assignee.as_ref(), issue.fields.reporter.as_ref()])
        .flatten()
        .filter(|user| user.is_unidentified())
        .count()
}

pub type JiraSyncService = SyncService<JiraClient, SqliteRecordStore>;

/// Wires the Jira client and the SQLite store from validated configuration.
pub fn build_service(config: &AppConfig) -> Result<JiraSyncService, SyncError> {
    let source = JiraClient::new(config.jira.client_config())?;
    let store = SqliteRecordStore::new(config.database.store_config());
    Ok(SyncService::new(
        Arc::new(source),
        Arc::new(store),
        SyncOptions::from_config(config),
    ))
}

/// Incremental sync on `cron`; a tick that finds the previous run still going is skipped.
pub async fn build_scheduler<S, R>(
    service: Arc<SyncService<S, R>>,
    cron: &str,
    cancel: CancellationToken,
) -> anyhow::Result<JobScheduler>
where
    S: IssueSource + 'static,
    R: RecordStore + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(tokio::sync::Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = service.clone();
        let running = running.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous scheduled sync still running; skipping tick");
                return;
            };
            let result = service.incremental_sync(&cancel).await;
            if result.success {
                info!(
                    mode = %result.mode,
                    processed = result.issues_processed,
                    "scheduled sync finished"
                );
            } else {
                warn!(
                    error = result.error_message.as_deref().unwrap_or("unknown"),
                    "scheduled sync failed"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
