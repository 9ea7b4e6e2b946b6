//! Paginated retrieval of a complete result set for one query.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::SyncResult;
use crate::jira::api_types::ApiSearchResponse;
use crate::jira::types::{Snapshot, Ticket};

/// One page of search results from the tracker.
#[async_trait]
pub trait PageSource: Send + Sync {
  async fn search_page(
    &self,
    jql: &str,
    start_at: u64,
    max_results: u64,
  ) -> SyncResult<ApiSearchResponse>;
}

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
  pub page_size: u64,
  /// Hard ceiling on records accumulated per query.
  pub max_records: u64,
}

impl Default for FetchLimits {
  fn default() -> Self {
    Self {
      page_size: 100,
      max_records: 50_000,
    }
  }
}

/// Walks the search endpoint page by page until the result set is exhausted.
pub struct Fetcher<S> {
  source: S,
  limits: FetchLimits,
  story_points_field: Option<String>,
  clock: Arc<dyn Clock>,
}

impl<S: PageSource> Fetcher<S> {
  pub fn new(source: S, limits: FetchLimits, clock: Arc<dyn Clock>) -> Self {
    Self {
      source,
      limits,
      story_points_field: None,
      clock,
    }
  }

  pub fn with_story_points_field(mut self, field: Option<String>) -> Self {
    self.story_points_field = field;
    self
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Fetch every record matching `jql`.
  ///
  /// Any failed page aborts the whole fetch. Hitting the record ceiling is not
  /// an error: the snapshot comes back truncated with `partial` set.
  ///
  /// Offset paging over a result set that changes mid-fetch can serve a record
  /// twice; only its first occurrence is kept.
  pub async fn fetch_all(&self, jql: &str) -> SyncResult<Snapshot> {
    let page_size = self.limits.page_size.max(1);
    let ceiling = self.limits.max_records.max(1) as usize;

    let mut tickets: Vec<Ticket> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut start_at = 0u64;
    let mut total = 0u64;
    let mut pages = 0usize;

    loop {
      let page = self.source.search_page(jql, start_at, page_size).await?;
      pages += 1;
      // Counts can shift mid-pagination; the latest one wins.
      total = page.total;

      if page.issues.is_empty() {
        break;
      }

      let received = page.issues.len();
      let mut duplicates = 0usize;
      for issue in page.issues {
        if !seen.insert(issue.key.clone()) {
          duplicates += 1;
          continue;
        }
        tickets.push(issue.into_ticket(self.story_points_field.as_deref()));
      }
      if duplicates > 0 {
        tracing::debug!(jql, start_at, duplicates, "Skipped records already fetched");
      }
      tracing::debug!(
        jql,
        start_at,
        received,
        fetched = tickets.len(),
        total,
        "Fetched page"
      );

      if tickets.len() >= ceiling {
        if (tickets.len() as u64) < total || tickets.len() > ceiling {
          tracing::warn!(
            jql,
            ceiling,
            total,
            "Reached record ceiling, returning partial snapshot"
          );
          tickets.truncate(ceiling);
          total = total.max(tickets.len() as u64 + 1);
        }
        break;
      }

      if tickets.len() as u64 >= total {
        break;
      }
      start_at += page_size;
    }

    let snapshot = Snapshot::new(jql, tickets, total, self.clock.now());
    if snapshot.partial {
      tracing::warn!(
        jql,
        fetched = snapshot.len(),
        total = snapshot.total,
        "Snapshot is partial"
      );
    }
    tracing::debug!(jql, pages, fetched = snapshot.len(), "Fetch complete");
    Ok(snapshot)
  }
}
