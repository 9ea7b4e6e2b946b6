//! Periodic refresh of every watched query.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::SyncEngine;
use crate::jira::fetcher::PageSource;

/// Handle to the running poll loops, one task per watched query.
pub struct Scheduler {
  stop: watch::Sender<bool>,
  handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
  /// Spawn a poll loop per query. The first tick fires immediately.
  pub fn start<S: PageSource + 'static>(engine: Arc<SyncEngine<S>>) -> Self {
    let (stop, stop_rx) = watch::channel(false);

    let handles = engine
      .queries()
      .iter()
      .map(|query| {
        let engine = Arc::clone(&engine);
        let mut stop_rx = stop_rx.clone();
        let name = query.name.clone();
        let period = query.interval;

        tokio::spawn(async move {
          let mut ticker = tokio::time::interval(period);
          ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
          tracing::debug!(query = %name, ?period, "Poll loop started");

          loop {
            tokio::select! {
              biased;
              changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                  break;
                }
              }
              _ = ticker.tick() => {
                // Not raced against stop: an in-flight cycle always finishes.
                // Errors are logged and recorded by the engine; the next tick retries.
                let _ = engine.refresh(&name).await;
              }
            }
          }
          tracing::debug!(query = %name, "Poll loop stopped");
        })
      })
      .collect();

    tracing::info!(queries = engine.queries().len(), "Scheduler started");
    Self { stop, handles }
  }

  /// Stop issuing ticks and wait for in-flight cycles to drain.
  pub async fn shutdown(self) {
    let _ = self.stop.send(true);
    for handle in self.handles {
      if let Err(err) = handle.await {
        tracing::error!(error = %err, "Poll loop panicked");
      }
    }
    tracing::info!("Scheduler stopped");
  }

  pub fn is_running(&self) -> bool {
    self.handles.iter().any(|h| !h.is_finished())
  }
}
