//! Record store (SQLite via sqlx) + HTTP transport utilities for JIRA Mirror.

mod http;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jmir_core::{
    format_timestamp, parse_timestamp, IssueMetric, IssueRecord, IssueType, Priority, Project,
    ProjectSummary, QueryRow, QueryValue, Status, StatusCategory, StoreHealth, StoredIssue,
    SyncHistoryEntry, SyncMode, SyncRunStatus, UpsertStats, User,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, BasicAuth, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "jmir-storage";

/// Embedded schema; every statement is `IF NOT EXISTS`.
pub const SCHEMA_SQL: &str = include_str!("../schema.sql");

pub const IN_MEMORY_PATH: &str = ":memory:";

const UNFILTERED_METRICS_LIMIT: i64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("preparing database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upserting issue {key}: {source}")]
    Upsert {
        key: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("decoding column {column}: {message}")]
    Decode { column: String, message: String },
    #[error("batch cancelled before commit")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file, or [`IN_MEMORY_PATH`].
    pub path: String,
    pub enable_wal: bool,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "jira_data.sqlite".to_string(),
            enable_wal: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            path: IN_MEMORY_PATH.to_string(),
            enable_wal: false,
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }
}

/// Persistence contract the sync orchestrator drives.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn apply_schema(&self) -> Result<(), StoreError>;

    /// Writes the whole batch in one transaction, dependents before each issue row.
    async fn upsert_issues(
        &self,
        issues: &[IssueRecord],
        cancel: &CancellationToken,
    ) -> Result<UpsertStats, StoreError>;

    /// End time of the most recent completed sync.
    async fn last_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn last_sync_by_mode(&self, mode: SyncMode)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Appends one history row; never rewrites earlier rows.
    async fn record_sync(&self, entry: &SyncHistoryEntry) -> Result<(), StoreError>;

    /// Reachability plus row counts. Problems are reported inside the value.
    async fn health(&self) -> StoreHealth;
}

/// SQLite-backed store holding one lazily opened connection for the process.
#[derive(Debug)]
pub struct SqliteRecordStore {
    config: StoreConfig,
    pool: OnceCell<SqlitePool>,
}

impl SqliteRecordStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn pool(&self) -> Result<&SqlitePool, StoreError> {
        self.pool.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<SqlitePool, StoreError> {
        let opts = if self.config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            let path = Path::new(&self.config.path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
            let opts = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            if self.config.enable_wal {
                opts.journal_mode(SqliteJournalMode::Wal)
            } else {
                opts
            }
        };
        let opts = opts
            .foreign_keys(true)
            .busy_timeout(self.config.busy_timeout);

        // One connection: the store is single-writer, and an in-memory
        // database only lives as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        info!(path = %self.config.path, "opened record store");
        Ok(pool)
    }

    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    pub async fn issues_by_keys(&self, keys: &[String]) -> Result<Vec<StoredIssue>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.pool().await?;
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT issue_id, issue_key, project_id, status_id, assignee_id, summary, description, \
             created_date, updated_date, resolved_date, resolution, labels, last_synced \
             FROM issues WHERE issue_key IN (",
        );
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(") ORDER BY issue_key");

        let rows = builder.build().fetch_all(pool).await?;
        rows.iter().map(stored_issue_from_row).collect()
    }

    pub async fn project_summaries(&self) -> Result<Vec<ProjectSummary>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT * FROM project_summary ORDER BY project_name")
            .fetch_all(pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ProjectSummary {
                project_id: row.try_get("project_id")?,
                project_key: row.try_get("project_key")?,
                project_name: row.try_get("project_name")?,
                total_issues: row.try_get("total_issues")?,
                resolved_issues: row.try_get("resolved_issues")?,
                open_issues: row.try_get("open_issues")?,
                in_progress_issues: row.try_get("in_progress_issues")?,
                average_resolution_days: row.try_get("avg_resolution_days")?,
                first_issue_date: optional_ts(&row, "first_issue_date")?,
                last_updated_date: optional_ts(&row, "last_updated_date")?,
            });
        }
        Ok(out)
    }

    pub async fn issue_metrics(
        &self,
        project_key: Option<&str>,
    ) -> Result<Vec<IssueMetric>, StoreError> {
        let pool = self.pool().await?;
        let rows = match project_key {
            Some(key) => {
                sqlx::query(
                    "SELECT * FROM issue_metrics WHERE project_key = ? ORDER BY updated_date DESC",
                )
                .bind(key)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM issue_metrics ORDER BY updated_date DESC LIMIT ?")
                    .bind(UNFILTERED_METRICS_LIMIT)
                    .fetch_all(pool)
                    .await?
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(IssueMetric {
                issue_id: row.try_get("issue_id")?,
                issue_key: row.try_get("issue_key")?,
                project_key: row.try_get("project_key")?,
                project_name: row.try_get("project_name")?,
                issue_type_name: row.try_get("issue_type_name")?,
                status_name: row.try_get("status_name")?,
                status_category: row.try_get("status_category")?,
                priority_name: row.try_get("priority_name")?,
                assignee_name: row.try_get("assignee_name")?,
                reporter_name: row.try_get("reporter_name")?,
                summary: row.try_get("summary")?,
                created: required_ts(&row, "created_date")?,
                updated: required_ts(&row, "updated_date")?,
                resolved_at: optional_ts(&row, "resolved_date")?,
                age_days: row.try_get("age_days")?,
                resolution_days: row.try_get("resolution_days")?,
                labels: json_list(&row, "labels")?,
            });
        }
        Ok(out)
    }

    /// Runs an arbitrary read query, keeping column order and tagging each cell.
    pub async fn query(&self, sql: &str) -> Result<Vec<QueryRow>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(sql).fetch_all(pool).await?;
        rows.iter().map(query_row_from_sqlite).collect()
    }

    /// Writes `issues` in one transaction, asking `stop` before each item.
    async fn upsert_batch(
        &self,
        issues: &[IssueRecord],
        mut stop: impl FnMut(usize) -> bool + Send,
    ) -> Result<UpsertStats, StoreError> {
        if issues.is_empty() {
            return Ok(UpsertStats::default());
        }

        let pool = self.pool().await?;
        let synced_at = Utc::now();
        let mut tx = pool.begin().await?;
        let mut stats = UpsertStats::default();

        for (index, issue) in issues.iter().enumerate() {
            if stop(index) {
                tx.rollback().await?;
                warn!(batch = issues.len(), "batch cancelled; rolled back");
                return Err(StoreError::Cancelled);
            }

            match upsert_issue(&mut tx, issue, synced_at).await {
                Ok(true) => stats.updated += 1,
                Ok(false) => stats.inserted += 1,
                Err(source) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed upsert also failed");
                    }
                    return Err(StoreError::Upsert {
                        key: issue.key.clone(),
                        source,
                    });
                }
            }
        }

        tx.commit().await?;
        debug!(
            inserted = stats.inserted,
            updated = stats.updated,
            "committed issue batch"
        );
        Ok(stats)
    }

    async fn table_exists(&self, pool: &SqlitePool, table: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    async fn count_rows(&self, pool: &SqlitePool, table: &str) -> Result<i64, StoreError> {
        if !self.table_exists(pool, table).await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await?;
        Ok(count)
    }

    async fn collect_health(&self, health: &mut StoreHealth) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(pool).await?;

        if !self.config.is_in_memory() {
            if let Ok(meta) = tokio::fs::metadata(&self.config.path).await {
                health.database_size_bytes = meta.len();
            }
        }
        health.total_issues = self.count_rows(pool, "issues").await?;
        health.total_projects = self.count_rows(pool, "projects").await?;
        if self.table_exists(pool, "sync_history").await? {
            health.last_sync = self.last_checkpoint().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn apply_schema(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
        info!("record store schema applied");
        Ok(())
    }

    async fn upsert_issues(
        &self,
        issues: &[IssueRecord],
        cancel: &CancellationToken,
    ) -> Result<UpsertStats, StoreError> {
        self.upsert_batch(issues, |_| cancel.is_cancelled()).await
    }

    async fn last_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let pool = self.pool().await?;
        let value: Option<String> = sqlx::query_scalar(
            "SELECT MAX(end_time) FROM sync_history WHERE status = ?",
        )
        .bind(SyncRunStatus::Completed.as_str())
        .fetch_one(pool)
        .await?;
        value.as_deref().map(|text| decode_ts("end_time", text)).transpose()
    }

    async fn last_sync_by_mode(
        &self,
        mode: SyncMode,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let pool = self.pool().await?;
        let value: Option<String> = sqlx::query_scalar(
            "SELECT MAX(end_time) FROM sync_history WHERE status = ? AND sync_type = ?",
        )
        .bind(SyncRunStatus::Completed.as_str())
        .bind(mode.as_str())
        .fetch_one(pool)
        .await?;
        value.as_deref().map(|text| decode_ts("end_time", text)).transpose()
    }

    async fn record_sync(&self, entry: &SyncHistoryEntry) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        let records = i64::try_from(entry.records_processed).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO sync_history (
                sync_id, sync_type, start_time, end_time, status, records_processed, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.sync_id.to_string())
        .bind(entry.mode.as_str())
        .bind(format_timestamp(entry.started_at))
        .bind(format_timestamp(entry.finished_at))
        .bind(entry.status.as_str())
        .bind(records)
        .bind(&entry.error_message)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn health(&self) -> StoreHealth {
        let mut health = StoreHealth {
            database_path: self.config.path.clone(),
            ..StoreHealth::default()
        };
        match self.collect_health(&mut health).await {
            Ok(()) => health.healthy = true,
            Err(err) => {
                warn!(error = %err, "record store health check failed");
                health.healthy = false;
                health.problems.push(err.to_string());
            }
        }
        health
    }
}

/// Writes one issue and its dependents. Returns whether the issue row already existed.
async fn upsert_issue(
    conn: &mut SqliteConnection,
    issue: &IssueRecord,
    synced_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let fields = &issue.fields;

    if let Some(project) = &fields.project {
        upsert_project(conn, project, synced_at).await?;
    }
    if let Some(issue_type) = &fields.issue_type {
        upsert_issue_type(conn, issue_type).await?;
    }
    if let Some(status) = &fields.status {
        if let Some(category) = &status.category {
            upsert_status_category(conn, category).await?;
        }
        upsert_status(conn, status).await?;
    }
    if let Some(priority) = &fields.priority {
        upsert_priority(conn, priority).await?;
    }
    if let Some(assignee) = &fields.assignee {
        upsert_user(conn, assignee, synced_at).await?;
    }
    if let Some(reporter) = &fields.reporter {
        upsert_user(conn, reporter, synced_at).await?;
    }

    let existed: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM issues WHERE issue_id = ?)")
            .bind(&issue.id)
            .fetch_one(&mut *conn)
            .await?;

    let labels = to_json_list(fields.labels.iter());
    let components = to_json_list(fields.components.iter());
    let fix_versions = to_json_list(fields.fix_versions.iter());

    // created_date is written on insert only.
    sqlx::query(
        r#"
        INSERT INTO issues (
            issue_id, issue_key, project_id, issue_type_id, status_id, priority_id,
            assignee_id, reporter_id, summary, description, created_date, updated_date,
            resolved_date, resolution, labels, components, fix_versions, last_synced
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(issue_id) DO UPDATE SET
            issue_type_id = excluded.issue_type_id,
            status_id = excluded.status_id,
            priority_id = excluded.priority_id,
            assignee_id = excluded.assignee_id,
            summary = excluded.summary,
            description = excluded.description,
            updated_date = excluded.updated_date,
            resolved_date = excluded.resolved_date,
            resolution = excluded.resolution,
            labels = excluded.labels,
            components = excluded.components,
            fix_versions = excluded.fix_versions,
            last_synced = excluded.last_synced
        "#,
    )
    .bind(&issue.id)
    .bind(&issue.key)
    .bind(fields.project.as_ref().map(|p| p.id.as_str()))
    .bind(fields.issue_type.as_ref().map(|t| t.id.as_str()))
    .bind(fields.status.as_ref().map(|s| s.id.as_str()))
    .bind(fields.priority.as_ref().map(|p| p.id.as_str()))
    .bind(fields.assignee.as_ref().map(User::store_id))
    .bind(fields.reporter.as_ref().map(User::store_id))
    .bind(&fields.summary)
    .bind(&fields.description)
    .bind(format_timestamp(fields.created))
    .bind(format_timestamp(fields.updated))
    .bind(fields.resolved_at.map(format_timestamp))
    .bind(&fields.resolution)
    .bind(labels)
    .bind(components)
    .bind(fix_versions)
    .bind(format_timestamp(synced_at))
    .execute(&mut *conn)
    .await?;

    Ok(existed)
}

async fn upsert_project(
    conn: &mut SqliteConnection,
    project: &Project,
    synced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO projects (project_id, project_key, project_name, updated_date)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(project_id) DO UPDATE SET
            project_name = excluded.project_name,
            updated_date = excluded.updated_date
        "#,
    )
    .bind(&project.id)
    .bind(&project.key)
    .bind(&project.name)
    .bind(format_timestamp(synced_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_issue_type(
    conn: &mut SqliteConnection,
    issue_type: &IssueType,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO issue_types (issue_type_id, issue_type_name, icon_url)
        VALUES (?, ?, ?)
        ON CONFLICT(issue_type_id) DO UPDATE SET
            issue_type_name = excluded.issue_type_name,
            icon_url = excluded.icon_url
        "#,
    )
    .bind(&issue_type.id)
    .bind(&issue_type.name)
    .bind(&issue_type.icon_url)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_status_category(
    conn: &mut SqliteConnection,
    category: &StatusCategory,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO status_categories (status_category_id, category_name, category_key)
        VALUES (?, ?, ?)
        ON CONFLICT(status_category_id) DO UPDATE SET
            category_name = excluded.category_name,
            category_key = excluded.category_key
        "#,
    )
    .bind(category.id)
    .bind(&category.name)
    .bind(&category.key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_status(conn: &mut SqliteConnection, status: &Status) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO statuses (status_id, status_name, status_category_id)
        VALUES (?, ?, ?)
        ON CONFLICT(status_id) DO UPDATE SET
            status_name = excluded.status_name,
            status_category_id = excluded.status_category_id
        "#,
    )
    .bind(&status.id)
    .bind(&status.name)
    .bind(status.category.as_ref().map(|c| c.id))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_priority(
    conn: &mut SqliteConnection,
    priority: &Priority,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO priorities (priority_id, priority_name, icon_url)
        VALUES (?, ?, ?)
        ON CONFLICT(priority_id) DO UPDATE SET
            priority_name = excluded.priority_name,
            icon_url = excluded.icon_url
        "#,
    )
    .bind(&priority.id)
    .bind(&priority.name)
    .bind(&priority.icon_url)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_user(
    conn: &mut SqliteConnection,
    user: &User,
    synced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    if user.is_unidentified() {
        warn!(display_name = %user.display_name, "user without account id or username stored as unknown");
    }
    sqlx::query(
        r#"
        INSERT INTO users (user_id, username, display_name, email_address, updated_date)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            username = excluded.username,
            display_name = excluded.display_name,
            email_address = excluded.email_address,
            updated_date = excluded.updated_date
        "#,
    )
    .bind(user.store_id())
    .bind(&user.username)
    .bind(&user.display_name)
    .bind(&user.email_address)
    .bind(format_timestamp(synced_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn to_json_list<'a>(items: impl Iterator<Item = &'a String>) -> String {
    serde_json::Value::Array(items.cloned().map(serde_json::Value::String).collect()).to_string()
}

fn decode_ts(column: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(text).ok_or_else(|| StoreError::Decode {
        column: column.to_string(),
        message: format!("invalid timestamp {text:?}"),
    })
}

fn required_ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let text: String = row.try_get(column)?;
    decode_ts(column, &text)
}

fn optional_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let text: Option<String> = row.try_get(column)?;
    text.as_deref().map(|t| decode_ts(column, t)).transpose()
}

fn json_list(row: &SqliteRow, column: &str) -> Result<Vec<String>, StoreError> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).map_err(|err| StoreError::Decode {
        column: column.to_string(),
        message: err.to_string(),
    })
}

fn stored_issue_from_row(row: &SqliteRow) -> Result<StoredIssue, StoreError> {
    Ok(StoredIssue {
        id: row.try_get("issue_id")?,
        key: row.try_get("issue_key")?,
        project_id: row.try_get("project_id")?,
        status_id: row.try_get("status_id")?,
        assignee_id: row.try_get("assignee_id")?,
        summary: row.try_get("summary")?,
        description: row.try_get("description")?,
        created: required_ts(row, "created_date")?,
        updated: required_ts(row, "updated_date")?,
        resolved_at: optional_ts(row, "resolved_date")?,
        resolution: row.try_get("resolution")?,
        labels: json_list(row, "labels")?,
        last_synced: required_ts(row, "last_synced")?,
    })
}

fn is_datetime_decl(name: &str) -> bool {
    matches!(
        name.to_ascii_uppercase().as_str(),
        "DATETIME" | "TIMESTAMP" | "DATE"
    )
}

fn query_row_from_sqlite(row: &SqliteRow) -> Result<QueryRow, StoreError> {
    let mut out = QueryRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            out.push(column.name(), QueryValue::Null);
            continue;
        }
        let storage = raw.type_info().name().to_string();
        let value = match storage.as_str() {
            "INTEGER" => QueryValue::Int(row.try_get::<i64, _>(idx)?),
            "REAL" => QueryValue::Float(row.try_get::<f64, _>(idx)?),
            "BLOB" => {
                let bytes: Vec<u8> = row.try_get(idx)?;
                QueryValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => {
                let text: String = row.try_get(idx)?;
                let declared_ts = is_datetime_decl(column.type_info().name());
                match parse_timestamp(&text) {
                    Some(ts) if declared_ts || text.len() == format_timestamp(ts).len() => {
                        QueryValue::Timestamp(ts)
                    }
                    _ => QueryValue::Text(text),
                }
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}
