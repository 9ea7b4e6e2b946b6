use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Warn,
  Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
  NewlyOverdue,
  NewlyDueToday,
  NewlyMissingComponent,
  ComponentAssigned,
  BottleneckEntry,
  BottleneckExit,
  BottleneckEscalation,
  TicketCompleted,
  OverdueCrisis,
  ComponentCrisis,
  BottleneckCrisis,
  WorkloadImbalance,
}

/// One alert produced by a differ cycle.
///
/// Persistent alerts describe a standing condition and come back every cycle
/// while it holds; the rest fire once per ticket transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
  pub kind: AlertKind,
  pub severity: Severity,
  pub message: String,
  pub persistent: bool,
  /// Ticket key for transition alerts
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ticket: Option<String>,
}

impl AlertEvent {
  pub fn transition(
    kind: AlertKind,
    severity: Severity,
    ticket: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      kind,
      severity,
      message: message.into(),
      persistent: false,
      ticket: Some(ticket.into()),
    }
  }

  pub fn standing(kind: AlertKind, severity: Severity, message: impl Into<String>) -> Self {
    Self {
      kind,
      severity,
      message: message.into(),
      persistent: true,
      ticket: None,
    }
  }
}

/// Most severe first, standing conditions ahead of transitions.
pub fn sort_for_display(alerts: &mut [AlertEvent]) {
  alerts.sort_by(|a, b| {
    b.severity
      .cmp(&a.severity)
      .then(b.persistent.cmp(&a.persistent))
  });
}

/// Individually switchable alert rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
  Overdue,
  DueToday,
  MissingComponent,
  Bottleneck,
  Escalation,
  Completion,
  OverdueCrisis,
  ComponentCrisis,
  BottleneckCrisis,
  Workload,
}

impl Rule {
  pub const ALL: [Rule; 10] = [
    Rule::Overdue,
    Rule::DueToday,
    Rule::MissingComponent,
    Rule::Bottleneck,
    Rule::Escalation,
    Rule::Completion,
    Rule::OverdueCrisis,
    Rule::ComponentCrisis,
    Rule::BottleneckCrisis,
    Rule::Workload,
  ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet(BTreeSet<Rule>);

impl RuleSet {
  pub fn all() -> Self {
    Self(Rule::ALL.into_iter().collect())
  }

  pub fn contains(&self, rule: Rule) -> bool {
    self.0.contains(&rule)
  }

  pub fn iter(&self) -> impl Iterator<Item = Rule> + '_ {
    self.0.iter().copied()
  }
}

impl FromIterator<Rule> for RuleSet {
  fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl Default for RuleSet {
  fn default() -> Self {
    Self::all()
  }
}
