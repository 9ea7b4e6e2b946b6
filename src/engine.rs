//! One refresh cycle per watched query: fetch through the cache, diff against
//! the baseline, publish alerts, then replace the baseline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::alerts::{Aggregates, AlertEvent, Differ};
use crate::cache::{CacheSource, CacheStats, QueryCache, QueryClassifier, TtlTiers};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::jira::fetcher::{FetchLimits, Fetcher, PageSource};
use crate::jira::queries::{self, WatchedQuery};
use crate::jira::types::Snapshot;
use crate::store::{Baseline, SnapshotStore};

/// Cache endpoint for every search query.
pub const SEARCH_ENDPOINT: &str = "search";

const ALERT_CHANNEL_CAPACITY: usize = 256;
const MAX_PENDING_ALERTS: usize = 1000;

/// What one refresh cycle did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleOutcome {
  pub query: String,
  pub source: CacheSource,
  pub fetched: usize,
  pub partial: bool,
  pub aggregates: Aggregates,
  pub alerts: Vec<AlertEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
  pub at: DateTime<Utc>,
  pub message: String,
}

/// Lets the presentation layer tell "never succeeded" from "last cycle failed".
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatus {
  pub last_success: Option<DateTime<Utc>>,
  pub last_failure: Option<QueryFailure>,
}

impl QueryStatus {
  pub fn has_succeeded(&self) -> bool {
    self.last_success.is_some()
  }

  /// True when the most recent cycle failed.
  pub fn is_stale(&self) -> bool {
    match (&self.last_success, &self.last_failure) {
      (_, None) => false,
      (None, Some(_)) => true,
      (Some(ok), Some(failed)) => failed.at >= *ok,
    }
  }
}

struct Published {
  snapshot: Arc<Snapshot>,
  aggregates: Aggregates,
}

pub struct SyncEngine<S> {
  fetcher: Arc<Fetcher<S>>,
  cache: QueryCache,
  store: SnapshotStore,
  differ: Differ,
  queries: Vec<WatchedQuery>,
  clock: Arc<dyn Clock>,
  /// Serializes cycles per query name
  cycle_locks: HashMap<String, tokio::sync::Mutex<()>>,
  latest: Mutex<HashMap<String, Published>>,
  status: Mutex<HashMap<String, QueryStatus>>,
  alerts_tx: broadcast::Sender<AlertEvent>,
  pending: Mutex<VecDeque<AlertEvent>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: PageSource + 'static> SyncEngine<S> {
  pub fn new(
    fetcher: Fetcher<S>,
    cache: QueryCache,
    differ: Differ,
    queries: Vec<WatchedQuery>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (alerts_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
    let cycle_locks = queries
      .iter()
      .map(|q| (q.name.clone(), tokio::sync::Mutex::new(())))
      .collect();

    Self {
      fetcher: Arc::new(fetcher),
      cache,
      store: SnapshotStore::new(),
      differ,
      queries,
      clock,
      cycle_locks,
      latest: Mutex::new(HashMap::new()),
      status: Mutex::new(HashMap::new()),
      alerts_tx,
      pending: Mutex::new(VecDeque::new()),
    }
  }

  /// Wire fetcher, cache, differ and watched queries from configuration.
  pub fn from_config(config: &Config, source: S, clock: Arc<dyn Clock>) -> Self {
    let fetcher = Fetcher::new(
      source,
      FetchLimits {
        page_size: config.fetch.page_size,
        max_records: config.fetch.max_records,
      },
      Arc::clone(&clock),
    )
    .with_story_points_field(config.jira.story_points_field.clone());

    let cache = QueryCache::new(
      TtlTiers::from_config(&config.cache),
      QueryClassifier::new(&config.rules.bottleneck_status),
      Arc::clone(&clock),
    )
    .with_serve_stale_on_error(config.cache.serve_stale_on_error);

    let differ = Differ::new(config.rules.clone(), Arc::clone(&clock));
    Self::new(fetcher, cache, differ, queries::from_config(config), clock)
  }

  /// Keep only the named query.
  pub fn restrict_to(mut self, name: &str) -> SyncResult<Self> {
    self.query(name)?;
    self.queries.retain(|q| q.name == name);
    self.cycle_locks.retain(|n, _| n == name);
    Ok(self)
  }

  pub fn queries(&self) -> &[WatchedQuery] {
    &self.queries
  }

  pub fn query_names(&self) -> Vec<String> {
    self.queries.iter().map(|q| q.name.clone()).collect()
  }

  pub fn query(&self, name: &str) -> SyncResult<&WatchedQuery> {
    self
      .queries
      .iter()
      .find(|q| q.name == name)
      .ok_or_else(|| SyncError::UnknownQuery(name.to_string()))
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn store(&self) -> &SnapshotStore {
    &self.store
  }

  /// Run one cycle for `name`.
  ///
  /// On failure the previous snapshot, aggregates and baseline stay in place;
  /// only the query status records the failure.
  pub async fn refresh(&self, name: &str) -> SyncResult<CycleOutcome> {
    let query = self.query(name)?;
    let _cycle = match self.cycle_locks.get(name) {
      Some(m) => m.lock().await,
      None => return Err(SyncError::UnknownQuery(name.to_string())),
    };

    let fetcher = Arc::clone(&self.fetcher);
    let jql = query.jql.clone();
    let fetched = self
      .cache
      .get_or_fetch(SEARCH_ENDPOINT, &query.jql, move || async move {
        fetcher.fetch_all(&jql).await
      })
      .await;

    let result = match fetched {
      Ok(result) => result,
      Err(err) => {
        tracing::warn!(query = name, error = %err, "Refresh failed, keeping previous state");
        self.record_failure(name, err.to_string());
        return Err(err);
      }
    };

    if result.is_offline() {
      tracing::warn!(
        query = name,
        cached_at = ?result.cached_at,
        "Refresh failed, expired entry served; skipping diff"
      );
      self.record_failure(name, "fetch failed, serving expired entry".to_string());
      return Ok(CycleOutcome {
        query: name.to_string(),
        source: result.source,
        fetched: result.data.len(),
        partial: result.data.partial,
        aggregates: self.differ.aggregates(&result.data, self.clock.now()),
        alerts: Vec::new(),
      });
    }

    let snapshot = result.data;
    let baseline = self.store.get(name);
    let evaluation = self
      .differ
      .evaluate(&snapshot, baseline.as_deref(), &query.rules);

    self.publish(name, &snapshot, &evaluation.aggregates, &evaluation.alerts);
    self.store.put(
      name,
      Baseline {
        snapshot: Arc::clone(&snapshot),
        aggregates: evaluation.aggregates.clone(),
        evaluated_at: evaluation.evaluated_at,
      },
    );
    lock(&self.status)
      .entry(name.to_string())
      .or_default()
      .last_success = Some(evaluation.evaluated_at);

    tracing::info!(
      query = name,
      source = ?result.source,
      fetched = snapshot.len(),
      partial = snapshot.partial,
      alerts = evaluation.alerts.len(),
      "Refresh complete"
    );

    Ok(CycleOutcome {
      query: name.to_string(),
      source: result.source,
      fetched: snapshot.len(),
      partial: snapshot.partial,
      aggregates: evaluation.aggregates,
      alerts: evaluation.alerts,
    })
  }

  /// Refresh on demand. With `force` the cached entry is dropped first so the
  /// tracker is always hit.
  pub async fn refresh_now(&self, name: &str, force: bool) -> SyncResult<CycleOutcome> {
    let query = self.query(name)?;
    if force && self.cache.invalidate(SEARCH_ENDPOINT, &query.jql) {
      tracing::debug!(query = name, "Invalidated cache entry for forced refresh");
    }
    self.refresh(name).await
  }

  /// Refresh every watched query in turn; failures are reported per query.
  pub async fn refresh_all(&self) -> Vec<(String, SyncResult<CycleOutcome>)> {
    let mut outcomes = Vec::with_capacity(self.queries.len());
    for query in &self.queries {
      let outcome = self.refresh(&query.name).await;
      outcomes.push((query.name.clone(), outcome));
    }
    outcomes
  }

  fn publish(
    &self,
    name: &str,
    snapshot: &Arc<Snapshot>,
    aggregates: &Aggregates,
    alerts: &[AlertEvent],
  ) {
    lock(&self.latest).insert(
      name.to_string(),
      Published {
        snapshot: Arc::clone(snapshot),
        aggregates: aggregates.clone(),
      },
    );

    let mut pending = lock(&self.pending);
    for alert in alerts {
      if pending.len() == MAX_PENDING_ALERTS {
        pending.pop_front();
      }
      pending.push_back(alert.clone());
      // No subscribers is fine; the pull queue still has it.
      let _ = self.alerts_tx.send(alert.clone());
    }
  }

  fn record_failure(&self, name: &str, message: String) {
    lock(&self.status)
      .entry(name.to_string())
      .or_default()
      .last_failure = Some(QueryFailure {
      at: self.clock.now(),
      message,
    });
  }

  /// Last successfully diffed snapshot.
  pub fn latest_snapshot(&self, name: &str) -> Option<Arc<Snapshot>> {
    lock(&self.latest)
      .get(name)
      .map(|p| Arc::clone(&p.snapshot))
  }

  pub fn aggregates(&self, name: &str) -> Option<Aggregates> {
    lock(&self.latest).get(name).map(|p| p.aggregates.clone())
  }

  pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
    self.alerts_tx.subscribe()
  }

  /// Drain alerts published since the last call.
  pub fn take_pending_alerts(&self) -> Vec<AlertEvent> {
    lock(&self.pending).drain(..).collect()
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  pub fn status(&self, name: &str) -> QueryStatus {
    lock(&self.status).get(name).cloned().unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alerts::{AlertKind, Rule};
  use crate::clock::ManualClock;
  use crate::config::RulesConfig;
  use crate::jira::api_types::{ApiComponent, ApiIssue};
  use crate::jira::fetcher::testing::{api_issue, FakeSource};
  use chrono::{Duration, TimeZone};
  use std::time::Duration as StdDuration;

  fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 29, 12, 0, 0).unwrap()
  }

  fn overdue_issue(key: &str) -> ApiIssue {
    let mut issue = api_issue(key, "In Progress");
    issue.fields.due_date = Some("2025-01-20".to_string());
    issue.fields.components = vec![ApiComponent {
      name: "Data".to_string(),
    }];
    issue
  }

  fn overdue_issues(range: std::ops::Range<usize>) -> Vec<ApiIssue> {
    range.map(|i| overdue_issue(&format!("OPS-{}", i))).collect()
  }

  struct Harness {
    engine: SyncEngine<Arc<FakeSource>>,
    source: Arc<FakeSource>,
    clock: Arc<ManualClock>,
  }

  fn harness(source: FakeSource, serve_stale: bool) -> Harness {
    let source = Arc::new(source);
    let clock = Arc::new(ManualClock::new(start()));
    let fetcher = Fetcher::new(Arc::clone(&source), FetchLimits::default(), clock.clone());
    let cache = QueryCache::new(
      TtlTiers::default(),
      QueryClassifier::new("Data Team New"),
      clock.clone(),
    )
    .with_serve_stale_on_error(serve_stale);
    let differ = Differ::new(RulesConfig::default(), clock.clone());
    let queries = vec![
      WatchedQuery::new("overdue", "duedate < now()", StdDuration::from_secs(60))
        .with_rules([Rule::Overdue, Rule::OverdueCrisis]),
    ];
    Harness {
      engine: SyncEngine::new(fetcher, cache, differ, queries, clock.clone()),
      source,
      clock,
    }
  }

  fn count(alerts: &[AlertEvent], kind: AlertKind) -> usize {
    alerts.iter().filter(|a| a.kind == kind).count()
  }

  #[tokio::test]
  async fn test_overdue_crisis_scenario() {
    let h = harness(FakeSource::with_issues(overdue_issues(0..40)), false);

    let first = h.engine.refresh("overdue").await.unwrap();
    assert!(first.alerts.is_empty());
    assert_eq!(h.engine.store().get("overdue").unwrap().aggregates.overdue, 40);

    h.source.replace(overdue_issues(0..52));
    let second = h.engine.refresh_now("overdue", true).await.unwrap();

    assert_eq!(count(&second.alerts, AlertKind::NewlyOverdue), 12);
    assert_eq!(count(&second.alerts, AlertKind::OverdueCrisis), 1);
    let baseline = h.engine.store().get("overdue").unwrap();
    assert_eq!(baseline.aggregates.overdue, 52);
    assert_eq!(baseline.snapshot.len(), 52);
    assert_eq!(h.engine.latest_snapshot("overdue").unwrap().len(), 52);
    assert_eq!(h.engine.take_pending_alerts().len(), 13);
    assert!(h.engine.take_pending_alerts().is_empty());
  }

  #[tokio::test]
  async fn test_cached_refresh_does_not_refetch() {
    let h = harness(FakeSource::with_count(5), false);
    h.engine.refresh("overdue").await.unwrap();
    let calls = h.source.calls();

    let again = h.engine.refresh("overdue").await.unwrap();
    assert_eq!(h.source.calls(), calls);
    assert_eq!(again.source, CacheSource::CacheFresh);

    // Critical tier: one minute.
    h.clock.advance(Duration::seconds(61));
    let expired = h.engine.refresh("overdue").await.unwrap();
    assert_eq!(h.source.calls(), calls + 1);
    assert_eq!(expired.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_failed_cycle_keeps_previous_state() {
    let mut source = FakeSource::with_issues(overdue_issues(0..3));
    source.fail_on_call = Some(2);
    let h = harness(source, false);

    h.engine.refresh("overdue").await.unwrap();
    let before = h.engine.store().get("overdue").unwrap();

    h.clock.advance(Duration::seconds(61));
    let err = h.engine.refresh("overdue").await.unwrap_err();
    assert!(matches!(err, SyncError::UpstreamStatus { status: 503, .. }));

    let after = h.engine.store().get("overdue").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(h.engine.latest_snapshot("overdue").unwrap().len(), 3);

    let status = h.engine.status("overdue");
    assert!(status.has_succeeded());
    assert!(status.is_stale());
    assert!(status.last_failure.unwrap().message.contains("503"));
  }

  #[tokio::test]
  async fn test_never_succeeded_status() {
    let mut source = FakeSource::with_count(1);
    source.fail_on_call = Some(1);
    let h = harness(source, false);

    assert!(h.engine.refresh("overdue").await.is_err());
    let status = h.engine.status("overdue");
    assert!(!status.has_succeeded());
    assert!(status.is_stale());
    assert!(h.engine.store().get("overdue").is_none());
    assert!(h.engine.latest_snapshot("overdue").is_none());
  }

  #[tokio::test]
  async fn test_offline_result_is_not_diffed() {
    let mut source = FakeSource::with_issues(overdue_issues(0..3));
    source.fail_on_call = Some(2);
    let h = harness(source, true);

    h.engine.refresh("overdue").await.unwrap();
    h.source.replace(overdue_issues(0..10));
    h.clock.advance(Duration::seconds(61));

    let outcome = h.engine.refresh("overdue").await.unwrap();
    assert_eq!(outcome.source, CacheSource::Offline);
    assert!(outcome.alerts.is_empty());
    assert_eq!(h.engine.store().get("overdue").unwrap().snapshot.len(), 3);
    assert!(h.engine.status("overdue").is_stale());
  }

  #[tokio::test]
  async fn test_unknown_query() {
    let h = harness(FakeSource::with_count(1), false);
    let err = h.engine.refresh("nope").await.unwrap_err();
    assert_eq!(err, SyncError::UnknownQuery("nope".to_string()));
  }

  #[tokio::test]
  async fn test_alerts_are_broadcast() {
    let h = harness(FakeSource::with_issues(overdue_issues(0..1)), false);
    let mut rx = h.engine.subscribe_alerts();
    h.engine.refresh("overdue").await.unwrap();

    h.source.replace(overdue_issues(0..2));
    h.engine.refresh_now("overdue", true).await.unwrap();

    let alert = rx.recv().await.unwrap();
    assert_eq!(alert.kind, AlertKind::NewlyOverdue);
    assert_eq!(alert.ticket.as_deref(), Some("OPS-1"));
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_are_serialized() {
    let h = Arc::new(harness(FakeSource::with_issues(overdue_issues(0..5)), false));
    let a = {
      let h = Arc::clone(&h);
      tokio::spawn(async move { h.engine.refresh_now("overdue", true).await })
    };
    let b = {
      let h = Arc::clone(&h);
      tokio::spawn(async move { h.engine.refresh_now("overdue", true).await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    // Whichever ran second diffed against the first one's baseline.
    assert_eq!(a.alerts.len() + b.alerts.len(), 0);
    assert_eq!(h.engine.store().get("overdue").unwrap().snapshot.len(), 5);
  }

  #[tokio::test]
  async fn test_restrict_to_single_query() {
    let config = Config::from_yaml_str(
      "jira:\n  url: https://acme.atlassian.net\n  email: ops@acme.io\n",
    )
    .unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    let engine = SyncEngine::from_config(&config, FakeSource::with_count(1), clock);

    let engine = engine.restrict_to("bottleneck").unwrap();
    assert_eq!(engine.query_names(), vec!["bottleneck".to_string()]);
    assert!(engine.refresh("overdue").await.is_err());
    assert!(matches!(
      engine.restrict_to("missing"),
      Err(SyncError::UnknownQuery(_))
    ));
  }

  #[tokio::test]
  async fn test_from_config_uses_default_queries() {
    let config = Config::from_yaml_str(
      "jira:\n  url: https://acme.atlassian.net\n  email: ops@acme.io\nscope: project = OPS\n",
    )
    .unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    let engine = SyncEngine::from_config(&config, FakeSource::with_count(3), clock);

    assert_eq!(engine.query_names().len(), 5);
    let outcome = engine.refresh("all").await.unwrap();
    assert_eq!(outcome.fetched, 3);
    assert_eq!(engine.aggregates("all").unwrap().open, 3);
    assert_eq!(engine.cache_stats().total_entries, 1);
  }
}
