//! Application configuration: optional YAML file, then environment overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jmir_adapters::{parse_base_url, JiraClientConfig};
use jmir_storage::StoreConfig;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "JMIR_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment variable {key} has invalid value {value:?}")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct JiraSettings {
    pub base_url: String,
    pub username: String,
    #[serde(alias = "token")]
    pub personal_access_token: String,
    pub project_keys: Vec<String>,
    pub timeout_secs: u64,
    pub max_results_per_request: usize,
}

impl Default for JiraSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            personal_access_token: String::new(),
            project_keys: Vec::new(),
            timeout_secs: 30,
            max_results_per_request: 100,
        }
    }
}

impl fmt::Debug for JiraSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JiraSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("personal_access_token", &"<redacted>")
            .field("project_keys", &self.project_keys)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_results_per_request", &self.max_results_per_request)
            .finish()
    }
}

impl JiraSettings {
    pub fn client_config(&self) -> JiraClientConfig {
        let mut config = JiraClientConfig::new(
            self.base_url.clone(),
            self.username.clone(),
            self.personal_access_token.clone(),
        );
        config.timeout = Duration::from_secs(self.timeout_secs);
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
    pub enable_wal: bool,
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            path: store.path,
            enable_wal: store.enable_wal,
            busy_timeout_secs: store.busy_timeout.as_secs(),
        }
    }
}

impl DatabaseSettings {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.path.clone(),
            enable_wal: self.enable_wal,
            busy_timeout: Duration::from_secs(self.busy_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub lookback_days: i64,
    pub full_sync_on_startup: bool,
    pub scheduler_enabled: bool,
    /// Six-field cron (with seconds) for the scheduler.
    pub cron: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lookback_days: 7,
            full_sync_on_startup: false,
            scheduler_enabled: false,
            cron: "0 */30 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub jira: JiraSettings,
    pub database: DatabaseSettings,
    pub sync: SyncSettings,
}

impl AppConfig {
    /// File (explicit path, else `JMIR_CONFIG`), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields from variables returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("JIRA_BASE_URL") {
            self.jira.base_url = v;
        }
        if let Some(v) = lookup("JIRA_USERNAME") {
            self.jira.username = v;
        }
        if let Some(v) = lookup("JIRA_TOKEN") {
            self.jira.personal_access_token = v;
        }
        if let Some(v) = lookup("JIRA_PROJECT_KEYS") {
            self.jira.project_keys = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(v) = lookup("JIRA_MAX_RESULTS") {
            self.jira.max_results_per_request = parse_env("JIRA_MAX_RESULTS", v)?;
        }
        if let Some(v) = lookup("JIRA_TIMEOUT_SECS") {
            self.jira.timeout_secs = parse_env("JIRA_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("JMIR_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("JMIR_BATCH_SIZE") {
            self.sync.batch_size = parse_env("JMIR_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("JMIR_LOOKBACK_DAYS") {
            self.sync.lookback_days = parse_env("JMIR_LOOKBACK_DAYS", v)?;
        }
        if let Some(v) = lookup("JMIR_FULL_SYNC_ON_STARTUP") {
            self.sync.full_sync_on_startup = parse_flag("JMIR_FULL_SYNC_ON_STARTUP", v)?;
        }
        if let Some(v) = lookup("JMIR_SCHEDULER_ENABLED") {
            self.sync.scheduler_enabled = parse_flag("JMIR_SCHEDULER_ENABLED", v)?;
        }
        if let Some(v) = lookup("JMIR_SYNC_CRON") {
            self.sync.cron = v;
        }
        Ok(())
    }

    /// Collects every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.jira.base_url.trim().is_empty() {
            problems.push("jira.base_url is required".to_string());
        } else if let Err(err) = parse_base_url(&self.jira.base_url) {
            problems.push(format!("jira.base_url: {err}"));
        }
        if self.jira.username.trim().is_empty() {
            problems.push("jira.username is required".to_string());
        }
        if self.jira.personal_access_token.trim().is_empty() {
            problems.push("jira.personal_access_token is required".to_string());
        }
        if !(1..=300).contains(&self.jira.timeout_secs) {
            problems.push(format!(
                "jira.timeout_secs must be between 1 and 300, got {}",
                self.jira.timeout_secs
            ));
        }
        if !(1..=1000).contains(&self.jira.max_results_per_request) {
            problems.push(format!(
                "jira.max_results_per_request must be between 1 and 1000, got {}",
                self.jira.max_results_per_request
            ));
        }
        if self.database.path.trim().is_empty() {
            problems.push("database.path is required".to_string());
        }
        if !(1..=1000).contains(&self.sync.batch_size) {
            problems.push(format!(
                "sync.batch_size must be between 1 and 1000, got {}",
                self.sync.batch_size
            ));
        }
        if !(1..=90).contains(&self.sync.lookback_days) {
            problems.push(format!(
                "sync.lookback_days must be between 1 and 90, got {}",
                self.sync.lookback_days
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn valid() -> AppConfig {
        let mut config = AppConfig::default();
        config.jira.base_url = "https://jira.example.com".into();
        config.jira.username = "svc-jira".into();
        config.jira.personal_access_token = "s3cr3t".into();
        config.jira.project_keys = vec!["TEST".into()];
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.jira.timeout_secs, 30);
        assert_eq!(config.jira.max_results_per_request, 100);
        assert_eq!(config.database.path, "jira_data.sqlite");
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.lookback_days, 7);
        assert!(!config.sync.full_sync_on_startup);
        assert!(!config.sync.scheduler_enabled);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = AppConfig::default();
        config.jira.base_url = "ftp://jira".into();
        config.jira.timeout_secs = 0;
        config.sync.batch_size = 5000;
        config.sync.lookback_days = 120;

        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert_eq!(problems.len(), 6, "{problems:?}");
        assert!(problems.iter().any(|p| p.starts_with("jira.base_url")));
        assert!(problems.iter().any(|p| p.contains("username")));
        assert!(problems.iter().any(|p| p.contains("personal_access_token")));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn yaml_file_then_env_overrides() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jmir.yaml");
        std::fs::write(
            &path,
            "jira:\n  base_url: https://jira.example.com\n  username: file-user\n  token: file-token\n  project_keys: [A]\nsync:\n  batch_size: 25\n",
        )
        .expect("write");

        let mut config = AppConfig::from_yaml_file(&path).expect("yaml");
        assert_eq!(config.jira.username, "file-user");
        assert_eq!(config.jira.personal_access_token, "file-token");
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.lookback_days, 7);

        let env = HashMap::from([
            ("JIRA_PROJECT_KEYS", " TEST, OPS ,,"),
            ("JMIR_LOOKBACK_DAYS", "3"),
            ("JMIR_FULL_SYNC_ON_STARTUP", "true"),
        ]);
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .expect("env");
        assert_eq!(config.jira.project_keys, vec!["TEST", "OPS"]);
        assert_eq!(config.sync.lookback_days, 3);
        assert!(config.sync.full_sync_on_startup);
        assert_eq!(config.jira.username, "file-user");
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let mut config = valid();
        let err = config
            .apply_env(|key| (key == "JMIR_BATCH_SIZE").then(|| "ten".to_string()))
            .expect_err("not a number");
        assert!(matches!(err, ConfigError::Env { key: "JMIR_BATCH_SIZE", .. }));
    }

    #[test]
    fn debug_output_redacts_token() {
        let text = format!("{:?}", valid());
        assert!(!text.contains("s3cr3t"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = AppConfig::from_yaml_file(Path::new("/nonexistent/jmir.yaml"))
            .expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
