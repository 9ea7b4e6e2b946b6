//! Watched query definitions.

use std::time::Duration;

use crate::alerts::{Rule, RuleSet};
use crate::config::Config;

/// A named JQL query polled on its own interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedQuery {
  pub name: String,
  pub jql: String,
  pub interval: Duration,
  pub rules: RuleSet,
}

impl WatchedQuery {
  pub fn new(name: impl Into<String>, jql: impl Into<String>, interval: Duration) -> Self {
    Self {
      name: name.into(),
      jql: jql.into(),
      interval,
      rules: RuleSet::all(),
    }
  }

  pub fn with_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
    self.rules = rules.into_iter().collect();
    self
  }
}

/// Prefix `predicate` with the shared scope, keeping any ORDER BY clause last.
fn scoped(scope: Option<&str>, predicate: &str) -> String {
  let scope = scope.map(str::trim).filter(|s| !s.is_empty());
  match scope {
    None => predicate.to_string(),
    Some(scope) if predicate.to_uppercase().starts_with("ORDER BY") => {
      format!("{} {}", scope, predicate)
    }
    Some(scope) => format!("{} AND {}", scope, predicate),
  }
}

/// The built-in dashboard queries: overdue, due today, missing components,
/// bottleneck and everything.
pub fn default_queries(
  scope: Option<&str>,
  bottleneck_status: &str,
  interval: Duration,
) -> Vec<WatchedQuery> {
  vec![
    WatchedQuery::new(
      "overdue",
      scoped(scope, "duedate < now() ORDER BY duedate ASC"),
      interval,
    )
    .with_rules([Rule::Overdue, Rule::OverdueCrisis]),
    WatchedQuery::new(
      "due-today",
      scoped(
        scope,
        "duedate >= startOfDay() AND duedate <= endOfDay() ORDER BY priority DESC",
      ),
      interval,
    )
    .with_rules([Rule::DueToday]),
    WatchedQuery::new(
      "missing-components",
      scoped(scope, "component is EMPTY ORDER BY updated DESC"),
      interval,
    )
    .with_rules([Rule::MissingComponent, Rule::ComponentCrisis]),
    WatchedQuery::new(
      "bottleneck",
      scoped(
        scope,
        &format!("status = \"{}\" ORDER BY updated DESC", bottleneck_status),
      ),
      interval,
    )
    .with_rules([Rule::Bottleneck, Rule::BottleneckCrisis, Rule::Escalation]),
    WatchedQuery::new("all", scoped(scope, "ORDER BY updated DESC"), interval)
      .with_rules([Rule::Workload, Rule::Completion]),
  ]
}

/// Watched queries from config, falling back to the defaults when none are listed.
pub fn from_config(config: &Config) -> Vec<WatchedQuery> {
  let interval = Duration::from_secs(config.polling.interval_secs);
  if config.queries.is_empty() {
    return default_queries(
      config.scope.as_deref(),
      &config.rules.bottleneck_status,
      interval,
    );
  }

  config
    .queries
    .iter()
    .map(|q| {
      let mut query = WatchedQuery::new(
        q.name.clone(),
        q.jql.clone(),
        q.interval_secs.map(Duration::from_secs).unwrap_or(interval),
      );
      if let Some(rules) = &q.rules {
        query = query.with_rules(rules.iter().copied());
      }
      query
    })
    .collect()
}
