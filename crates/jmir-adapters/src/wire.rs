//! JSON shapes of the Jira REST v2 search and issue endpoints.

use std::collections::BTreeSet;

use jmir_core::{
    parse_timestamp, IssueFields, IssueRecord, IssueType, Priority, Project, Status,
    StatusCategory, User,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::SourceError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub start_at: usize,
    #[serde(default)]
    pub max_results: usize,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub issues: Vec<WireIssue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireIssue {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub fields: WireFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFields {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Option<JsonValue>,
    #[serde(default, rename = "issuetype")]
    pub issue_type: Option<WireIssueType>,
    #[serde(default)]
    pub status: Option<WireStatus>,
    #[serde(default)]
    pub priority: Option<WirePriority>,
    #[serde(default)]
    pub assignee: Option<WireUser>,
    #[serde(default)]
    pub reporter: Option<WireUser>,
    #[serde(default)]
    pub project: Option<WireProject>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default, rename = "resolutiondate")]
    pub resolution_date: Option<String>,
    #[serde(default)]
    pub resolution: Option<WireNamed>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub components: Vec<WireNamed>,
    #[serde(default)]
    pub fix_versions: Vec<WireNamed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireIssueType {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status_category: Option<WireStatusCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStatusCategory {
    pub id: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePriority {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUser {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireProject {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireNamed {
    #[serde(default)]
    pub name: String,
}

impl TryFrom<WireIssue> for IssueRecord {
    type Error = SourceError;

    fn try_from(wire: WireIssue) -> Result<Self, Self::Error> {
        let WireIssue { id, key, fields } = wire;

        let created = required_timestamp(&key, "created", fields.created.as_deref())?;
        let updated = required_timestamp(&key, "updated", fields.updated.as_deref())?;
        let resolved_at = match fields.resolution_date.as_deref() {
            Some(text) if !text.trim().is_empty() => {
                Some(required_timestamp(&key, "resolutiondate", Some(text))?)
            }
            _ => None,
        };

        let fields = IssueFields {
            summary: fields.summary,
            description: fields.description.and_then(description_text),
            project: fields.project.map(|p| Project {
                id: p.id,
                key: p.key,
                name: p.name,
            }),
            issue_type: fields.issue_type.map(|t| IssueType {
                id: t.id,
                name: t.name,
                icon_url: t.icon_url,
            }),
            status: fields.status.map(|s| Status {
                id: s.id,
                name: s.name,
                category: s.status_category.map(|c| StatusCategory {
                    id: c.id,
                    key: c.key,
                    name: c.name,
                }),
            }),
            priority: fields.priority.map(|p| Priority {
                id: p.id,
                name: p.name,
                icon_url: p.icon_url,
            }),
            assignee: fields.assignee.map(User::from),
            reporter: fields.reporter.map(User::from),
            created,
            updated,
            resolved_at,
            resolution: fields
                .resolution
                .map(|r| r.name)
                .filter(|name| !name.is_empty()),
            labels: fields.labels.into_iter().collect::<BTreeSet<_>>(),
            components: fields.components.into_iter().map(|c| c.name).collect(),
            fix_versions: fields.fix_versions.into_iter().map(|v| v.name).collect(),
        };

        Ok(IssueRecord { id, key, fields })
    }
}

impl From<WireUser> for User {
    fn from(wire: WireUser) -> Self {
        let display_name = wire
            .display_name
            .or_else(|| wire.name.clone())
            .unwrap_or_default();
        User {
            account_id: wire.account_id,
            username: wire.name,
            display_name,
            email_address: wire.email_address,
        }
    }
}

fn required_timestamp(
    key: &str,
    field: &'static str,
    value: Option<&str>,
) -> Result<chrono::DateTime<chrono::Utc>, SourceError> {
    let text = value.unwrap_or_default();
    parse_timestamp(text).ok_or_else(|| SourceError::InvalidField {
        key: key.to_string(),
        field,
        value: text.to_string(),
    })
}

// v2 returns plain text; rich-text documents are kept as their JSON.
fn description_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}
