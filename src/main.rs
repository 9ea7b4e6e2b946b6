use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tixwatch::alerts::{sort_for_display, AlertEvent, Severity};
use tixwatch::cache::CacheStats;
use tixwatch::clock::SystemClock;
use tixwatch::config::{Config, LoggingConfig};
use tixwatch::engine::{CycleOutcome, QueryStatus, SyncEngine};
use tixwatch::jira::types::Snapshot;
use tixwatch::jira::JiraClient;
use tixwatch::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "tixwatch")]
#[command(about = "Polls Jira queries and raises alerts when tickets change state")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tixwatch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Run every watched query once, print a JSON report and exit
  #[arg(long)]
  once: bool,

  /// Only watch the named query
  #[arg(short, long)]
  query: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryReport {
  name: String,
  jql: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  outcome: Option<CycleOutcome>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
  status: QueryStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  snapshot: Option<Snapshot>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
  queries: Vec<QueryReport>,
  cache: CacheStats,
}

fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("TIXWATCH_LOG").unwrap_or_else(|_| {
    EnvFilter::new(logging.filter.as_deref().unwrap_or("tixwatch=info,warn"))
  });
  let registry = tracing_subscriber::registry().with(filter);

  match &logging.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "tixwatch.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
      Some(guard)
    }
    None => {
      registry
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
      None
    }
  }
}

fn log_alert(alert: &AlertEvent) {
  let ticket = alert.ticket.as_deref().unwrap_or("-");
  match alert.severity {
    Severity::Error => tracing::error!(kind = ?alert.kind, ticket, "{}", alert.message),
    Severity::Warn => tracing::warn!(kind = ?alert.kind, ticket, "{}", alert.message),
    Severity::Info => tracing::info!(kind = ?alert.kind, ticket, "{}", alert.message),
  }
}

async fn run_once(engine: &SyncEngine<JiraClient>) -> Result<()> {
  let mut queries = Vec::new();
  for (name, result) in engine.refresh_all().await {
    let jql = engine
      .query(&name)
      .map(|q| q.jql.clone())
      .unwrap_or_default();
    let (outcome, error) = match result {
      Ok(mut outcome) => {
        sort_for_display(&mut outcome.alerts);
        (Some(outcome), None)
      }
      Err(err) => (None, Some(err.to_string())),
    };
    queries.push(QueryReport {
      status: engine.status(&name),
      snapshot: engine.latest_snapshot(&name).map(|s| (*s).clone()),
      name,
      jql,
      outcome,
      error,
    });
  }

  let report = Report {
    queries,
    cache: engine.cache_stats(),
  };
  println!("{}", serde_json::to_string_pretty(&report)?);

  if report.queries.iter().all(|q| q.error.is_some()) {
    return Err(eyre!("Every watched query failed"));
  }
  Ok(())
}

async fn run_watch(engine: Arc<SyncEngine<JiraClient>>) -> Result<()> {
  let mut alerts = engine.subscribe_alerts();
  let logger = tokio::spawn(async move {
    loop {
      match alerts.recv().await {
        Ok(alert) => log_alert(&alert),
        Err(RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "Alert logger fell behind");
        }
        Err(RecvError::Closed) => break,
      }
    }
  });

  let scheduler = Scheduler::start(Arc::clone(&engine));
  tokio::signal::ctrl_c().await?;
  tracing::info!("Interrupt received, draining in-flight refreshes");
  scheduler.shutdown().await;

  // Dropping the last engine handle closes the alert channel.
  drop(engine);
  let _ = logger.await;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config.logging);

  let client = JiraClient::new(&config)?;
  let mut engine = SyncEngine::from_config(&config, client, Arc::new(SystemClock));
  if let Some(name) = &args.query {
    engine = engine.restrict_to(name)?;
  }

  if args.once {
    run_once(&engine).await
  } else {
    run_watch(Arc::new(engine)).await
  }
}
