//! Cache layer that orchestrates TTL checks, in-flight sharing and fetching.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::result::{CacheEntryInfo, CacheResult, CacheStats};
use super::tier::{QueryClassifier, TtlTier, TtlTiers};
use crate::clock::Clock;
use crate::error::SyncResult;
use crate::jira::types::Snapshot;

type SharedFetch = Shared<BoxFuture<'static, SyncResult<Arc<Snapshot>>>>;

/// Cache key for an endpoint/query pair. No normalization: queries that differ
/// only in spelling are distinct entries.
pub fn cache_key(endpoint: &str, query: &str) -> String {
  format!("{}:{}", endpoint, query)
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub payload: Arc<Snapshot>,
  pub captured_at: DateTime<Utc>,
  pub ttl: Duration,
  pub tier: TtlTier,
}

impl CacheEntry {
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now - self.captured_at < self.ttl
  }
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  in_flight: HashMap<String, SharedFetch>,
}

impl CacheState {
  /// Drop entries whose TTL has elapsed. Returns how many went.
  fn sweep(&mut self, now: DateTime<Utc>) -> usize {
    let before = self.entries.len();
    self.entries.retain(|_, entry| entry.is_valid(now));
    before - self.entries.len()
  }
}

enum Lookup {
  Hit(CacheResult<Arc<Snapshot>>),
  Pending(SharedFetch),
  Miss,
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Memory-resident snapshot cache keyed by `(endpoint, query)`.
///
/// Cloning is cheap and clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
  state: Arc<Mutex<CacheState>>,
  tiers: TtlTiers,
  classifier: QueryClassifier,
  clock: Arc<dyn Clock>,
  serve_stale_on_error: bool,
}

impl QueryCache {
  pub fn new(tiers: TtlTiers, classifier: QueryClassifier, clock: Arc<dyn Clock>) -> Self {
    Self {
      state: Arc::new(Mutex::new(CacheState::default())),
      tiers,
      classifier,
      clock,
      serve_stale_on_error: false,
    }
  }

  /// Fall back to an expired entry when the fetch fails.
  pub fn with_serve_stale_on_error(mut self, enabled: bool) -> Self {
    self.serve_stale_on_error = enabled;
    self
  }

  /// Return the cached snapshot for the key if it is still valid, otherwise
  /// run `fetch` and store its result.
  ///
  /// Callers that miss on a key while another fetch for it is running wait on
  /// that fetch instead of starting their own. Failed fetches are never stored.
  pub async fn get_or_fetch<F, Fut>(
    &self,
    endpoint: &str,
    query: &str,
    fetch: F,
  ) -> SyncResult<CacheResult<Arc<Snapshot>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<Snapshot>> + Send + 'static,
  {
    let key = cache_key(endpoint, query);

    let pending = match self.lookup(&key) {
      Lookup::Hit(result) => return Ok(result),
      Lookup::Pending(pending) => pending,
      Lookup::Miss => {
        tracing::debug!(key = %key, "Cache miss");
        // The caller's closure runs unlocked; it may touch this cache.
        let fut = fetch();
        let mut state = lock(&self.state);
        // Another caller may have registered or finished a fetch meanwhile.
        match Self::find(&state, &key, self.clock.now()) {
          Lookup::Hit(result) => return Ok(result),
          Lookup::Pending(pending) => pending,
          Lookup::Miss => {
            let pending = self.shared_fetch(key.clone(), query, fut);
            state.in_flight.insert(key.clone(), pending.clone());
            pending
          }
        }
      }
    };

    match pending.await {
      Ok(snapshot) => Ok(CacheResult::from_network(snapshot)),
      Err(err) => {
        if self.serve_stale_on_error {
          if let Some(entry) = lock(&self.state).entries.get(&key) {
            tracing::warn!(key = %key, error = %err, "Fetch failed, serving expired entry");
            return Ok(CacheResult::offline(
              Arc::clone(&entry.payload),
              entry.captured_at,
            ));
          }
        }
        Err(err)
      }
    }
  }

  fn lookup(&self, key: &str) -> Lookup {
    let state = lock(&self.state);
    Self::find(&state, key, self.clock.now())
  }

  fn find(state: &CacheState, key: &str, now: DateTime<Utc>) -> Lookup {
    if let Some(entry) = state.entries.get(key) {
      if entry.is_valid(now) {
        tracing::debug!(key, "Cache hit");
        return Lookup::Hit(CacheResult::from_cache(
          Arc::clone(&entry.payload),
          entry.captured_at,
        ));
      }
    }
    match state.in_flight.get(key) {
      Some(pending) => {
        tracing::debug!(key, "Joining in-flight fetch");
        Lookup::Pending(pending.clone())
      }
      None => Lookup::Miss,
    }
  }

  /// Wrap `fetch` so that it stores its own result and clears the in-flight
  /// marker, whichever waiter ends up driving it.
  fn shared_fetch<Fut>(&self, key: String, query: &str, fetch: Fut) -> SharedFetch
  where
    Fut: Future<Output = SyncResult<Snapshot>> + Send + 'static,
  {
    let state = Arc::clone(&self.state);
    let clock = Arc::clone(&self.clock);
    let tier = self.classifier.classify(query);
    let ttl = self.tiers.ttl(tier);

    async move {
      let result = fetch.await.map(Arc::new);

      let mut state = lock(&state);
      state.in_flight.remove(&key);
      if let Ok(snapshot) = &result {
        let now = clock.now();
        state.entries.insert(
          key.clone(),
          CacheEntry {
            payload: Arc::clone(snapshot),
            captured_at: now,
            ttl,
            tier,
          },
        );
        let swept = state.sweep(now);
        tracing::debug!(key = %key, ?tier, swept, "Stored cache entry");
      }
      result
    }
    .boxed()
    .shared()
  }

  /// Valid entry for the key, if any.
  pub fn get(&self, endpoint: &str, query: &str) -> Option<Arc<Snapshot>> {
    let now = self.clock.now();
    lock(&self.state)
      .entries
      .get(&cache_key(endpoint, query))
      .filter(|entry| entry.is_valid(now))
      .map(|entry| Arc::clone(&entry.payload))
  }

  pub fn invalidate(&self, endpoint: &str, query: &str) -> bool {
    lock(&self.state)
      .entries
      .remove(&cache_key(endpoint, query))
      .is_some()
  }

  pub fn clear(&self) {
    lock(&self.state).entries.clear();
    tracing::info!("Query cache cleared");
  }

  pub fn stats(&self) -> CacheStats {
    let now = self.clock.now();
    let state = lock(&self.state);

    let mut entries: Vec<CacheEntryInfo> = state
      .entries
      .iter()
      .map(|(key, entry)| CacheEntryInfo {
        key: key.clone(),
        tier: entry.tier,
        age_secs: (now - entry.captured_at).num_seconds(),
        ttl_secs: entry.ttl.num_seconds(),
        valid: entry.is_valid(now),
      })
      .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    let valid_entries = entries.iter().filter(|e| e.valid).count();
    CacheStats {
      total_entries: entries.len(),
      valid_entries,
      expired_entries: entries.len() - valid_entries,
      in_flight: state.in_flight.len(),
      entries,
    }
  }
}
