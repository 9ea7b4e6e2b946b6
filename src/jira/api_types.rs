//! Serde-deserializable types matching Jira search responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping [`Ticket`] focused on what the alert rules need.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Ticket, NO_PRIORITY, UNASSIGNED};

/// Fields requested from the search endpoint.
pub const SEARCH_FIELDS: &str =
  "summary,assignee,status,priority,duedate,components,issuetype,created,updated";

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiStatus {
  #[serde(default)]
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiIssueType {
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
  #[serde(rename = "displayName")]
  pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPriority {
  pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiComponent {
  #[serde(default)]
  pub name: String,
}

// ============================================================================
// Issue fields
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiIssueFields {
  #[serde(default)]
  pub summary: String,
  pub status: Option<ApiStatus>,
  #[serde(rename = "issuetype")]
  pub issue_type: Option<ApiIssueType>,
  pub assignee: Option<ApiUser>,
  pub priority: Option<ApiPriority>,
  #[serde(rename = "duedate")]
  pub due_date: Option<String>,
  #[serde(default)]
  pub components: Vec<ApiComponent>,
  pub created: Option<String>,
  pub updated: Option<String>,
  // Catch-all for custom fields (story points and friends)
  #[serde(flatten)]
  pub extra: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiIssue {
  pub key: String,
  #[serde(default)]
  pub fields: ApiIssueFields,
}

// ============================================================================
// Search endpoint response
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSearchResponse {
  #[serde(default)]
  pub issues: Vec<ApiIssue>,
  #[serde(rename = "startAt", default)]
  pub start_at: u64,
  #[serde(rename = "maxResults", default)]
  pub max_results: u64,
  #[serde(default)]
  pub total: u64,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl ApiIssue {
  /// Map the wire record to a [`Ticket`], substituting sentinels for the
  /// fields the tracker left empty.
  pub fn into_ticket(self, story_points_field: Option<&str>) -> Ticket {
    let f = self.fields;
    let story_points =
      story_points_field.and_then(|name| f.extra.get(name).and_then(|v| v.as_f64()));
    Ticket {
      key: self.key,
      summary: f.summary,
      assignee: f
        .assignee
        .map(|u| u.display_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNASSIGNED.to_string()),
      status: f.status.map(|s| s.name).unwrap_or_default(),
      priority: f
        .priority
        .map(|p| p.name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| NO_PRIORITY.to_string()),
      due_date: f.due_date.as_deref().and_then(parse_due_date),
      component: f
        .components
        .into_iter()
        .next()
        .map(|c| c.name)
        .filter(|name| !name.is_empty()),
      issue_type: f.issue_type.map(|t| t.name).unwrap_or_default(),
      created: f.created.as_deref().and_then(parse_timestamp),
      updated: f.updated.as_deref().and_then(parse_timestamp),
      story_points,
    }
  }
}

// ============================================================================
// Helpers
// ============================================================================

/// Due dates arrive as `YYYY-MM-DD`, occasionally with a time suffix.
fn parse_due_date(value: &str) -> Option<NaiveDate> {
  let date_part = value.get(..10).unwrap_or(value);
  NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Jira timestamps look like `2025-01-15T10:30:00.000+0000`; RFC 3339 is
/// accepted too.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
    .or_else(|_| DateTime::parse_from_rfc3339(value))
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
}
