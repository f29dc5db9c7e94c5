//! Issue source contract, the Jira REST client, and the pagination fetcher.

mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jmir_core::IssueRecord;
use jmir_storage::{BackoffPolicy, BasicAuth, FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub use wire::{SearchResponse, WireIssue};

pub const CRATE_NAME: &str = "jmir-adapters";

/// Deepest offset the search endpoint serves for one filter.
pub const PAGINATION_CEILING: usize = 10_000;

pub const MAX_PAGE_SIZE: usize = 1_000;

const SEARCH_PATH: &str = "/rest/api/2/search";
const ISSUE_PATH: &str = "/rest/api/2/issue";
const SERVER_INFO_PATH: &str = "/rest/api/2/serverInfo";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(FetchError),
    #[error("issue {key} has invalid {field}: {value:?}")]
    InvalidField {
        key: String,
        field: &'static str,
        value: String,
    },
    #[error("invalid base url {url:?}: {message}")]
    InvalidBaseUrl { url: String, message: String },
    #[error("building http client: {0:#}")]
    Client(anyhow::Error),
    #[error("fetch cancelled")]
    Cancelled,
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Self::Cancelled,
            other => Self::Fetch(other),
        }
    }
}

/// One page of a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub issues: Vec<IssueRecord>,
    /// Matches the source reports for the whole filter.
    pub total: usize,
    /// Page size the source actually applied; 0 when it did not say.
    pub max_results: usize,
}

/// Remote tracker seen through its search, lookup and health endpoints.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn search(
        &self,
        filter: &str,
        start_at: usize,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchPage, SourceError>;

    /// `Ok(None)` when the key does not exist.
    async fn get_by_key(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IssueRecord>, SourceError>;

    async fn health_check(&self) -> bool;
}

#[async_trait]
impl<T: IssueSource + ?Sized> IssueSource for Arc<T> {
    async fn search(
        &self,
        filter: &str,
        start_at: usize,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchPage, SourceError> {
        (**self).search(filter, start_at, max_results, cancel).await
    }

    async fn get_by_key(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IssueRecord>, SourceError> {
        (**self).get_by_key(key, cancel).await
    }

    async fn health_check(&self) -> bool {
        (**self).health_check().await
    }
}

fn quoted_list(keys: &[String]) -> String {
    keys.iter()
        .map(|k| format!("'{}'", k.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `updated >= 'yyyy-MM-dd HH:mm' [AND project IN (...)]`.
///
/// Minute precision floors the instant. Jira reads the literal in the searching user's
/// profile timezone, so for users west of UTC the bound lands later than `since` by that
/// offset; callers widen `since` with a lookback to cover it.
pub fn updated_since_filter(since: DateTime<Utc>, project_keys: &[String]) -> String {
    let mut jql = format!("updated >= '{}'", since.format("%Y-%m-%d %H:%M"));
    if !project_keys.is_empty() {
        jql.push_str(&format!(" AND project IN ({})", quoted_list(project_keys)));
    }
    jql
}

pub fn all_issues_filter(project_keys: &[String]) -> String {
    format!(
        "project IN ({}) ORDER BY updated DESC",
        quoted_list(project_keys)
    )
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub issues: Vec<IssueRecord>,
    pub pages: usize,
    /// The ceiling stopped the loop; later matches were not fetched.
    pub truncated: bool,
}

/// Drives `search` from offset 0 until a short page or the ceiling.
pub struct PaginationFetcher<S> {
    source: S,
    page_size: usize,
    limit: Option<usize>,
}

impl<S: IssueSource> PaginationFetcher<S> {
    pub fn new(source: S, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            limit: None,
        }
    }

    /// Stops after `limit` issues even when more match.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub async fn fetch(
        &self,
        filter: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SourceError> {
        let cap = self
            .limit
            .map_or(PAGINATION_CEILING, |limit| limit.min(PAGINATION_CEILING));
        let mut outcome = FetchOutcome::default();
        let mut start_at = 0usize;
        let mut last_total = 0usize;

        while start_at < cap {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let requested = self.page_size.min(cap - start_at);
            let span = info_span!("search_page", start_at, requested);
            let page = self
                .source
                .search(filter, start_at, requested, cancel)
                .instrument(span)
                .await?;
            outcome.pages += 1;

            // The source may silently apply a smaller page size than requested.
            let expected = match page.max_results {
                0 => requested,
                applied => applied.min(requested),
            };
            let returned = page.issues.len();
            debug!(start_at, returned, total = page.total, "fetched search page");

            last_total = page.total;
            outcome.issues.extend(page.issues);
            start_at += returned;

            if returned == 0 || returned < expected {
                return Ok(outcome);
            }
        }

        if start_at >= PAGINATION_CEILING && last_total > start_at {
            warn!(
                ceiling = PAGINATION_CEILING,
                filter, "pagination ceiling reached; results truncated"
            );
            outcome.truncated = true;
        }
        Ok(outcome)
    }

    pub async fn fetch_all(
        &self,
        project_keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SourceError> {
        let outcome = self.fetch(&all_issues_filter(project_keys), cancel).await?;
        info!(
            count = outcome.issues.len(),
            projects = %project_keys.join(", "),
            "retrieved all issues"
        );
        Ok(outcome)
    }

    pub async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
        project_keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SourceError> {
        let filter = updated_since_filter(since, project_keys);
        let outcome = self.fetch(&filter, cancel).await?;
        info!(count = outcome.issues.len(), %since, "retrieved updated issues");
        Ok(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct JiraClientConfig {
    pub base_url: String,
    pub auth: BasicAuth,
    pub timeout: Duration,
    /// Requested issue fields; empty lets the server choose.
    pub fields: Vec<String>,
    pub expand: Vec<String>,
    pub backoff: BackoffPolicy,
}

impl JiraClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            auth: BasicAuth {
                username: username.into(),
                token: token.into(),
            },
            timeout: Duration::from_secs(30),
            fields: Vec::new(),
            expand: Vec::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Parses an `http`/`https` base address.
pub fn parse_base_url(text: &str) -> Result<Url, SourceError> {
    let url = Url::parse(text.trim()).map_err(|err| SourceError::InvalidBaseUrl {
        url: text.to_string(),
        message: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SourceError::InvalidBaseUrl {
            url: text.to_string(),
            message: format!("unsupported scheme {other}"),
        }),
    }
}

/// Jira Server/Data Center REST v2 client authenticated with a personal access token.
#[derive(Debug)]
pub struct JiraClient {
    base_url: String,
    http: HttpFetcher,
    fields: Vec<String>,
    expand: Vec<String>,
}

impl JiraClient {
    pub fn new(config: JiraClientConfig) -> Result<Self, SourceError> {
        let base_url = parse_base_url(&config.base_url)?
            .as_str()
            .trim_end_matches('/')
            .to_string();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            auth: Some(config.auth),
            backoff: config.backoff,
            ..HttpClientConfig::default()
        })
        .map_err(SourceError::Client)?;
        Ok(Self {
            base_url,
            http,
            fields: config.fields,
            expand: config.expand,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl IssueSource for JiraClient {
    async fn search(
        &self,
        filter: &str,
        start_at: usize,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchPage, SourceError> {
        debug!(jql = filter, start_at, max_results, "searching issues");
        let mut query = vec![
            ("jql", filter.to_string()),
            ("startAt", start_at.to_string()),
            ("maxResults", max_results.to_string()),
        ];
        if !self.fields.is_empty() {
            query.push(("fields", self.fields.join(",")));
        }
        if !self.expand.is_empty() {
            query.push(("expand", self.expand.join(",")));
        }

        let response: SearchResponse = self
            .http
            .get_json(&self.url(SEARCH_PATH), &query, cancel)
            .await?;

        let total = response.total;
        let applied = response.max_results;
        let issues = response
            .issues
            .into_iter()
            .map(IssueRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = issues.len(), total, "search page decoded");

        Ok(SearchPage {
            issues,
            total,
            max_results: applied,
        })
    }

    async fn get_by_key(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IssueRecord>, SourceError> {
        let url = self.url(&format!("{ISSUE_PATH}/{key}"));
        match self.http.get_json::<WireIssue>(&url, &[], cancel).await {
            Ok(wire) => Ok(Some(IssueRecord::try_from(wire)?)),
            Err(err) if err.status() == Some(404) => {
                warn!(key, "issue not found");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn health_check(&self) -> bool {
        match self.http.probe(&self.url(SERVER_INFO_PATH)).await {
            Ok(status) if status.is_success() => {
                info!(base_url = %self.base_url, "connected to jira");
                true
            }
            Ok(status) => {
                warn!(status = status.as_u16(), "jira server info request was rejected");
                false
            }
            Err(err) => {
                warn!(error = %err, "jira is unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use chrono::TimeZone;
    use jmir_core::IssueFields;

    fn record(n: usize) -> IssueRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).single().unwrap();
        IssueRecord {
            id: format!("{}", 10_000 + n),
            key: format!("TEST-{n}"),
            fields: IssueFields {
                summary: format!("Issue {n}"),
                description: None,
                project: None,
                issue_type: None,
                status: None,
                priority: None,
                assignee: None,
                reporter: None,
                created: ts,
                updated: ts,
                resolved_at: None,
                resolution: None,
                labels: BTreeSet::new(),
                components: Vec::new(),
                fix_versions: Vec::new(),
            },
        }
    }

    /// Serves `total` issues; records every (start_at, max_results) request.
    struct FakeSource {
        total: usize,
        applied_page_cap: Option<usize>,
        fail_at: Option<usize>,
        calls: Mutex<Vec<(usize, usize)>>,
    }

    impl FakeSource {
        fn new(total: usize) -> Self {
            Self {
                total,
                applied_page_cap: None,
                fail_at: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(usize, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IssueSource for FakeSource {
        async fn search(
            &self,
            _filter: &str,
            start_at: usize,
            max_results: usize,
            _cancel: &CancellationToken,
        ) -> Result<SearchPage, SourceError> {
            self.calls.lock().unwrap().push((start_at, max_results));
            if self.fail_at == Some(start_at) {
                return Err(SourceError::Fetch(FetchError::HttpStatus {
                    status: 500,
                    url: "fake".into(),
                }));
            }
            let applied = self.applied_page_cap.map_or(max_results, |c| c.min(max_results));
            let end = (start_at + applied).min(self.total);
            Ok(SearchPage {
                issues: (start_at..end).map(record).collect(),
                total: self.total,
                max_results: applied,
            })
        }

        async fn get_by_key(
            &self,
            _key: &str,
            _cancel: &CancellationToken,
        ) -> Result<Option<IssueRecord>, SourceError> {
            Ok(None)
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn filters_quote_project_keys() {
        assert_eq!(
            all_issues_filter(&keys(&["TEST", "OPS"])),
            "project IN ('TEST', 'OPS') ORDER BY updated DESC"
        );
        let since = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 59).single().unwrap();
        assert_eq!(
            updated_since_filter(since, &[]),
            "updated >= '2024-01-15 10:30'"
        );
        assert_eq!(
            updated_since_filter(since, &keys(&["O'NEIL"])),
            "updated >= '2024-01-15 10:30' AND project IN ('O\\'NEIL')"
        );
    }

    #[tokio::test]
    async fn short_final_page_stops_the_loop() {
        let source = Arc::new(FakeSource::new(25));
        let fetcher = PaginationFetcher::new(source.clone(), 10);
        let outcome = fetcher
            .fetch("project = TEST", &CancellationToken::new())
            .await
            .expect("fetch");

        assert_eq!(outcome.issues.len(), 25);
        assert_eq!(outcome.pages, 3);
        assert!(!outcome.truncated);
        assert_eq!(source.calls(), vec![(0, 10), (10, 10), (20, 10)]);
        let keys: Vec<_> = outcome.issues.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys.first().map(String::as_str), Some("TEST-0"));
        assert_eq!(keys.last().map(String::as_str), Some("TEST-24"));
    }

    #[tokio::test]
    async fn exact_multiple_needs_one_empty_page() {
        let source = Arc::new(FakeSource::new(20));
        let outcome = PaginationFetcher::new(source.clone(), 10)
            .fetch("f", &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(outcome.issues.len(), 20);
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn cursor_follows_server_applied_page_size() {
        let source = Arc::new(FakeSource {
            applied_page_cap: Some(4),
            ..FakeSource::new(10)
        });
        let outcome = PaginationFetcher::new(source.clone(), 50)
            .fetch("f", &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(outcome.issues.len(), 10);
        assert_eq!(
            source.calls().iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![0, 4, 8]
        );
    }

    #[tokio::test]
    async fn ceiling_truncates_without_error() {
        let source = Arc::new(FakeSource::new(25_000));
        let outcome = PaginationFetcher::new(source.clone(), MAX_PAGE_SIZE)
            .fetch("f", &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(outcome.issues.len(), PAGINATION_CEILING);
        assert!(outcome.truncated);
        assert_eq!(outcome.pages, PAGINATION_CEILING / MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn exactly_ceiling_matches_is_not_truncated() {
        let source = Arc::new(FakeSource::new(PAGINATION_CEILING));
        let outcome = PaginationFetcher::new(source.clone(), MAX_PAGE_SIZE)
            .fetch("f", &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(outcome.issues.len(), PAGINATION_CEILING);
        assert!(!outcome.truncated);
        assert_eq!(source.calls().len(), PAGINATION_CEILING / MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn limit_caps_the_request_size() {
        let source = Arc::new(FakeSource::new(100));
        let outcome = PaginationFetcher::new(source.clone(), 10)
            .with_limit(Some(15))
            .fetch("f", &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(outcome.issues.len(), 15);
        assert!(!outcome.truncated);
        assert_eq!(source.calls(), vec![(0, 10), (10, 5)]);
    }

    #[tokio::test]
    async fn failed_page_discards_earlier_pages() {
        let source = Arc::new(FakeSource {
            fail_at: Some(20),
            ..FakeSource::new(50)
        });
        let err = PaginationFetcher::new(source, 10)
            .fetch("f", &CancellationToken::new())
            .await
            .expect_err("page 3 fails");
        assert!(matches!(err, SourceError::Fetch(_)));
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_each_page() {
        let source = Arc::new(FakeSource::new(50));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = PaginationFetcher::new(source.clone(), 10)
            .fetch("f", &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SourceError::Cancelled));
        assert!(source.calls().is_empty());
    }

    #[test]
    fn page_size_is_clamped() {
        let source = Arc::new(FakeSource::new(0));
        assert_eq!(PaginationFetcher::new(source.clone(), 0).page_size(), 1);
        assert_eq!(PaginationFetcher::new(source, 5_000).page_size(), MAX_PAGE_SIZE);
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(parse_base_url("https://jira.example.com").is_ok());
        assert!(matches!(
            parse_base_url("ftp://jira.example.com"),
            Err(SourceError::InvalidBaseUrl { .. })
        ));
        assert!(parse_base_url("not a url").is_err());
    }

    #[test]
    fn cancelled_fetch_error_maps_to_cancelled() {
        assert!(matches!(
            SourceError::from(FetchError::Cancelled),
            SourceError::Cancelled
        ));
    }
}
