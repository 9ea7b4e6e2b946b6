//! TTL tier selection by inspecting query text.

use chrono::Duration;
use serde::Serialize;

use crate::config::{CacheConfig, MAX_TTL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
  /// Overdue, missing-component and bottleneck queries.
  Critical,
  /// Broad unscoped "everything, newest first" queries.
  BroadAll,
  /// Anything not recognized.
  Normal,
}

/// Lifetimes per tier.
#[derive(Debug, Clone, Copy)]
pub struct TtlTiers {
  pub critical: Duration,
  pub broad_all: Duration,
  pub normal: Duration,
}

impl TtlTiers {
  /// TTLs above [`MAX_TTL_SECS`] are clamped; `Config::validate` rejects them.
  pub fn from_config(config: &CacheConfig) -> Self {
    let secs = |v: u64| Duration::seconds(v.min(MAX_TTL_SECS) as i64);
    Self {
      critical: secs(config.critical_ttl_secs),
      broad_all: secs(config.broad_ttl_secs),
      normal: secs(config.normal_ttl_secs),
    }
  }

  pub fn ttl(&self, tier: TtlTier) -> Duration {
    match tier {
      TtlTier::Critical => self.critical,
      TtlTier::BroadAll => self.broad_all,
      TtlTier::Normal => self.normal,
    }
  }
}

impl Default for TtlTiers {
  fn default() -> Self {
    Self {
      critical: Duration::seconds(60),
      broad_all: Duration::seconds(120),
      normal: Duration::seconds(300),
    }
  }
}

/// Heuristic classifier: substring markers in the JQL pick the tier.
///
/// Matching is case-insensitive and never fails; unrecognized shapes land in
/// [`TtlTier::Normal`].
#[derive(Debug, Clone)]
pub struct QueryClassifier {
  bottleneck_status: String,
}

impl QueryClassifier {
  pub fn new(bottleneck_status: impl Into<String>) -> Self {
    Self {
      bottleneck_status: bottleneck_status.into().to_lowercase(),
    }
  }

  pub fn classify(&self, jql: &str) -> TtlTier {
    let jql = jql.to_lowercase();

    let overdue = jql.contains("duedate < now()");
    let missing_component = jql.contains("component is empty");
    let bottleneck = !self.bottleneck_status.is_empty() && jql.contains(&self.bottleneck_status);
    if overdue || missing_component || bottleneck {
      return TtlTier::Critical;
    }

    if jql.contains("order by updated desc") && !jql.contains("status =") {
      return TtlTier::BroadAll;
    }

    TtlTier::Normal
  }
}
