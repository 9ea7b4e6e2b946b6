use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Assignee shown when the tracker has nobody on the ticket.
pub const UNASSIGNED: &str = "Unassigned";

/// Priority shown when the tracker reports none.
pub const NO_PRIORITY: &str = "None";

/// Normalized, read-only projection of one tracker issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
  pub key: String,
  pub summary: String,
  pub assignee: String,
  pub status: String,
  pub priority: String,
  pub due_date: Option<NaiveDate>,
  /// `None` means the issue has no component at all, which the rules treat
  /// differently from any named component.
  pub component: Option<String>,
  pub issue_type: String,
  pub created: Option<DateTime<Utc>>,
  pub updated: Option<DateTime<Utc>>,
  pub story_points: Option<f64>,
}

impl Ticket {
  pub fn is_unassigned(&self) -> bool {
    self.assignee == UNASSIGNED
  }

  pub fn is_missing_component(&self) -> bool {
    self.component.is_none()
  }

  /// Whole days past the due date as of `today`, never negative.
  pub fn days_overdue(&self, today: NaiveDate) -> i64 {
    self
      .due_date
      .map(|due| (today - due).num_days().max(0))
      .unwrap_or(0)
  }
}

/// One point-in-time result set for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
  pub query: String,
  pub issues: Vec<Ticket>,
  /// Count reported by the tracker; may exceed `issues.len()`.
  pub total: u64,
  pub captured_at: DateTime<Utc>,
  pub partial: bool,
}

impl Snapshot {
  /// Build a snapshot, deriving `partial` from the reported total.
  pub fn new(
    query: impl Into<String>,
    issues: Vec<Ticket>,
    total: u64,
    captured_at: DateTime<Utc>,
  ) -> Self {
    let total = total.max(issues.len() as u64);
    let partial = (issues.len() as u64) < total;
    Self {
      query: query.into(),
      issues,
      total,
      captured_at,
      partial,
    }
  }

  pub fn len(&self) -> usize {
    self.issues.len()
  }

  pub fn is_empty(&self) -> bool {
    self.issues.is_empty()
  }

  pub fn get(&self, key: &str) -> Option<&Ticket> {
    self.issues.iter().find(|t| t.key == key)
  }
}
