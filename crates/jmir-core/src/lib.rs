//! Core domain model for JIRA Mirror.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jmir-core";

/// User key written when the source gives neither an account id nor a username.
///
/// Rows keyed by this value collect every unidentified user; this is an
/// accepted degradation so the user upsert never sees a null key.
pub const UNKNOWN_USER_ID: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueType {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCategory {
    pub id: i64,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    pub name: String,
    pub category: Option<StatusCategory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub account_id: Option<String>,
    pub username: Option<String>,
    pub display_name: String,
    pub email_address: Option<String>,
}

impl User {
    /// Store key: account id, else username, else [`UNKNOWN_USER_ID`].
    pub fn store_id(&self) -> &str {
        self.account_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.username.as_deref().filter(|v| !v.trim().is_empty()))
            .unwrap_or(UNKNOWN_USER_ID)
    }

    pub fn is_unidentified(&self) -> bool {
        self.store_id() == UNKNOWN_USER_ID
    }
}

/// Descriptive field bag of an issue as the source reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueFields {
    pub summary: String,
    pub description: Option<String>,
    pub project: Option<Project>,
    pub issue_type: Option<IssueType>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub assignee: Option<User>,
    pub reporter: Option<User>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub labels: BTreeSet<String>,
    pub components: Vec<String>,
    pub fix_versions: Vec<String>,
}

/// One issue fetched from the source, identified by `id` and `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: String,
    pub key: String,
    pub fields: IssueFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run accumulator returned by every sync entry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub issues_processed: usize,
    pub issues_inserted: usize,
    pub issues_updated: usize,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
}

impl SyncResult {
    pub fn new(mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            started_at,
            finished_at: started_at,
            success: false,
            issues_processed: 0,
            issues_inserted: 0,
            issues_updated: 0,
            warnings: Vec::new(),
            error_message: None,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish_success(&mut self, finished_at: DateTime<Utc>) {
        self.success = true;
        self.error_message = None;
        self.finished_at = finished_at;
    }

    pub fn finish_failure(&mut self, finished_at: DateTime<Utc>, message: impl Into<String>) {
        self.success = false;
        self.error_message = Some(message.into());
        self.finished_at = finished_at;
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Snapshot of the store used by status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_incremental_sync: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub total_issues: i64,
    pub total_projects: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Completed,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Row of the append-only sync history; completed rows are checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncHistoryEntry {
    pub sync_id: Uuid,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncRunStatus,
    pub records_processed: usize,
    pub error_message: Option<String>,
}

impl SyncHistoryEntry {
    pub fn completed(result: &SyncResult, finished_at: DateTime<Utc>) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            mode: result.mode,
            started_at: result.started_at,
            finished_at,
            status: SyncRunStatus::Completed,
            records_processed: result.issues_processed,
            error_message: None,
        }
    }

    pub fn failed(result: &SyncResult) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            mode: result.mode,
            started_at: result.started_at,
            finished_at: result.finished_at,
            status: SyncRunStatus::Failed,
            records_processed: result.issues_processed,
            error_message: result.error_message.clone(),
        }
    }
}

/// Counts reported by one upserted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub database_path: String,
    pub database_size_bytes: u64,
    pub total_issues: i64,
    pub total_projects: i64,
    pub last_sync: Option<DateTime<Utc>>,
    pub problems: Vec<String>,
}

/// Issue row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredIssue {
    pub id: String,
    pub key: String,
    pub project_id: Option<String>,
    pub status_id: Option<String>,
    pub assignee_id: Option<String>,
    pub summary: String,
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub labels: Vec<String>,
    pub last_synced: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub project_id: String,
    pub project_key: String,
    pub project_name: String,
    pub total_issues: i64,
    pub resolved_issues: i64,
    pub open_issues: i64,
    pub in_progress_issues: i64,
    pub average_resolution_days: Option<f64>,
    pub first_issue_date: Option<DateTime<Utc>>,
    pub last_updated_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueMetric {
    pub issue_id: String,
    pub issue_key: String,
    pub project_key: Option<String>,
    pub project_name: Option<String>,
    pub issue_type_name: Option<String>,
    pub status_name: Option<String>,
    pub status_category: Option<String>,
    pub priority_name: Option<String>,
    pub assignee_name: Option<String>,
    pub reporter_name: Option<String>,
    pub summary: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub age_days: i64,
    pub resolution_days: Option<i64>,
    pub labels: Vec<String>,
}

/// Tagged cell of an ad-hoc analytical query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum QueryValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Query result row keeping the column order of the statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRow {
    columns: Vec<(String, QueryValue)>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: QueryValue) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&QueryValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Fixed-width UTC text form; lexical order matches chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses RFC 3339 as well as Jira's `2024-01-15T10:30:00.000+0000` form.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(account_id: Option<&str>, username: Option<&str>) -> User {
        User {
            account_id: account_id.map(ToString::to_string),
            username: username.map(ToString::to_string),
            display_name: "Someone".into(),
            email_address: None,
        }
    }

    #[test]
    fn user_key_falls_back_to_username_then_unknown() {
        assert_eq!(user(Some("acc-1"), Some("jdoe")).store_id(), "acc-1");
        assert_eq!(user(None, Some("jdoe")).store_id(), "jdoe");
        assert_eq!(user(Some("  "), Some("jdoe")).store_id(), "jdoe");
        assert_eq!(user(None, None).store_id(), UNKNOWN_USER_ID);
        assert!(user(None, None).is_unidentified());
    }

    #[test]
    fn timestamps_parse_jira_and_rfc3339_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).single().unwrap();
        assert_eq!(parse_timestamp("2024-01-15T10:30:00.000+0000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T12:30:00.000+0200"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T10:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).single().unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(&b), Some(late));
    }

    #[test]
    fn query_row_keeps_column_order() {
        let mut row = QueryRow::new();
        row.push("z_last", QueryValue::Int(1));
        row.push("a_first", QueryValue::Null);
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["z_last", "a_first"]);
        assert_eq!(row.get("z_last"), Some(&QueryValue::Int(1)));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn query_value_serializes_tagged() {
        let json = serde_json::to_value(QueryValue::Text("x".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "value": "x"}));
    }

    #[test]
    fn sync_result_duration_never_negative() {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).single().unwrap();
        let mut result = SyncResult::new(SyncMode::Full, start);
        result.finish_failure(start - chrono::Duration::seconds(5), "clock went back");
        assert_eq!(result.duration(), Duration::ZERO);
        result.finish_success(start + chrono::Duration::seconds(3));
        assert!(result.success);
        assert_eq!(result.error_message, None);
        assert_eq!(result.duration(), Duration::from_secs(3));
    }
}
