//! Per-query baselines: the last accepted snapshot and what was derived from it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::alerts::Aggregates;
use crate::jira::types::Snapshot;

/// Comparison input for the next differ cycle.
#[derive(Debug, Clone)]
pub struct Baseline {
  pub snapshot: Arc<Snapshot>,
  pub aggregates: Aggregates,
  /// Instant the snapshot was evaluated at. Date-based rules judge the
  /// baseline's tickets against this, not against the current time.
  pub evaluated_at: DateTime<Utc>,
}

/// Holds exactly one baseline per query name. Puts replace wholesale.
#[derive(Debug, Default)]
pub struct SnapshotStore {
  baselines: Mutex<HashMap<String, Arc<Baseline>>>,
}

impl SnapshotStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, query_name: &str) -> Option<Arc<Baseline>> {
    self
      .baselines
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(query_name)
      .cloned()
  }

  pub fn put(&self, query_name: &str, baseline: Baseline) {
    self
      .baselines
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(query_name.to_string(), Arc::new(baseline));
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .baselines
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect();
    names.sort();
    names
  }
}
