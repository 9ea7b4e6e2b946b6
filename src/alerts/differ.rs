//! Compares a fresh snapshot against its baseline and raises alerts.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::types::{AlertEvent, AlertKind, Rule, RuleSet, Severity};
use crate::clock::Clock;
use crate::config::{ColdStartPolicy, RulesConfig};
use crate::jira::types::{Snapshot, Ticket};
use crate::store::Baseline;

/// Counters derived from one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
  pub total: u64,
  pub open: usize,
  pub overdue: usize,
  pub due_today: usize,
  pub missing_component: usize,
  pub bottleneck: usize,
  pub escalated: usize,
  /// Open tickets per assignee, unassigned excluded
  pub open_by_assignee: BTreeMap<String, usize>,
  pub partial: bool,
}

/// Output of one differ run.
#[derive(Debug, Clone)]
pub struct Evaluation {
  pub alerts: Vec<AlertEvent>,
  pub aggregates: Aggregates,
  pub evaluated_at: DateTime<Utc>,
}

pub struct Differ {
  rules: RulesConfig,
  clock: Arc<dyn Clock>,
}

impl Differ {
  pub fn new(rules: RulesConfig, clock: Arc<dyn Clock>) -> Self {
    Self { rules, clock }
  }

  /// Evaluate every rule.
  pub fn diff(&self, current: &Snapshot, baseline: Option<&Baseline>) -> Vec<AlertEvent> {
    self.evaluate(current, baseline, &RuleSet::all()).alerts
  }

  /// Evaluate the enabled rules against wall-clock "now".
  pub fn evaluate(
    &self,
    current: &Snapshot,
    baseline: Option<&Baseline>,
    enabled: &RuleSet,
  ) -> Evaluation {
    let now = self.clock.now();
    let aggregates = self.aggregates(current, now);

    let mut alerts = Vec::new();
    if self.transitions_allowed(baseline) {
      self.transitions(current, baseline, enabled, now, &mut alerts);
    }
    self.standing(current, &aggregates, enabled, now, &mut alerts);

    tracing::debug!(
      query = %current.query,
      alerts = alerts.len(),
      overdue = aggregates.overdue,
      bottleneck = aggregates.bottleneck,
      "Evaluated snapshot"
    );

    Evaluation {
      alerts,
      aggregates,
      evaluated_at: now,
    }
  }

  pub fn aggregates(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Aggregates {
    let today = now.date_naive();
    let mut agg = Aggregates {
      total: snapshot.total,
      partial: snapshot.partial,
      ..Default::default()
    };

    for t in &snapshot.issues {
      if self.is_overdue(t, today) {
        agg.overdue += 1;
      }
      if self.is_due_today(t, today) {
        agg.due_today += 1;
      }
      if t.is_missing_component() {
        agg.missing_component += 1;
      }
      if self.rules.is_bottleneck(&t.status) {
        agg.bottleneck += 1;
      }
      if self.is_escalated(t, now) {
        agg.escalated += 1;
      }
      if self.is_open(t) {
        agg.open += 1;
        if !t.is_unassigned() {
          *agg.open_by_assignee.entry(t.assignee.clone()).or_default() += 1;
        }
      }
    }
    agg
  }

  fn transitions_allowed(&self, baseline: Option<&Baseline>) -> bool {
    match baseline {
      None => self.rules.cold_start == ColdStartPolicy::Fire,
      Some(b) if b.snapshot.partial && self.rules.suppress_on_partial_baseline => {
        tracing::debug!(
          query = %b.snapshot.query,
          "Baseline is partial, skipping transition alerts"
        );
        false
      }
      Some(_) => true,
    }
  }

  fn transitions(
    &self,
    current: &Snapshot,
    baseline: Option<&Baseline>,
    enabled: &RuleSet,
    now: DateTime<Utc>,
    alerts: &mut Vec<AlertEvent>,
  ) {
    let today = now.date_naive();
    let prior: HashMap<&str, &Ticket> = baseline
      .map(|b| b.snapshot.issues.iter().map(|t| (t.key.as_str(), t)).collect())
      .unwrap_or_default();
    // Baseline tickets are judged as of the day they were evaluated.
    let prior_day = baseline.map(|b| b.evaluated_at.date_naive()).unwrap_or(today);

    for t in &current.issues {
      let before = prior.get(t.key.as_str()).copied();

      if enabled.contains(Rule::Overdue)
        && self.is_overdue(t, today)
        && !before.is_some_and(|p| self.is_overdue(p, prior_day))
      {
        alerts.push(AlertEvent::transition(
          AlertKind::NewlyOverdue,
          Severity::Error,
          &t.key,
          format!(
            "{} is overdue by {} day(s): {}",
            t.key,
            t.days_overdue(today),
            t.summary
          ),
        ));
      }

      if enabled.contains(Rule::DueToday)
        && self.is_due_today(t, today)
        && !before.is_some_and(|p| self.is_due_today(p, prior_day))
      {
        alerts.push(AlertEvent::transition(
          AlertKind::NewlyDueToday,
          Severity::Warn,
          &t.key,
          format!("{} is due today: {}", t.key, t.summary),
        ));
      }

      if enabled.contains(Rule::MissingComponent) {
        let was_missing = before.is_some_and(|p| p.is_missing_component());
        if t.is_missing_component() && !was_missing {
          alerts.push(AlertEvent::transition(
            AlertKind::NewlyMissingComponent,
            Severity::Warn,
            &t.key,
            format!("{} has no component: {}", t.key, t.summary),
          ));
        } else if !t.is_missing_component() && was_missing {
          alerts.push(AlertEvent::transition(
            AlertKind::ComponentAssigned,
            Severity::Info,
            &t.key,
            format!(
              "{} was assigned component {}",
              t.key,
              t.component.as_deref().unwrap_or_default()
            ),
          ));
        }
      }

      if enabled.contains(Rule::Bottleneck)
        && self.rules.is_bottleneck(&t.status)
        && !before.is_some_and(|p| self.rules.is_bottleneck(&p.status))
      {
        alerts.push(AlertEvent::transition(
          AlertKind::BottleneckEntry,
          Severity::Warn,
          &t.key,
          format!("{} entered {}: {}", t.key, self.rules.bottleneck_status, t.summary),
        ));
      }

      if enabled.contains(Rule::Completion)
        && !self.is_open(t)
        && before.is_some_and(|p| self.is_open(p))
      {
        alerts.push(AlertEvent::transition(
          AlertKind::TicketCompleted,
          Severity::Info,
          &t.key,
          format!("{} moved to {}", t.key, t.status),
        ));
      }
    }

    if enabled.contains(Rule::Bottleneck) {
      if let Some(b) = baseline {
        self.bottleneck_exits(current, b, alerts);
      }
    }
  }

  fn bottleneck_exits(
    &self,
    current: &Snapshot,
    baseline: &Baseline,
    alerts: &mut Vec<AlertEvent>,
  ) {
    let now: HashMap<&str, &Ticket> = current
      .issues
      .iter()
      .map(|t| (t.key.as_str(), t))
      .collect();

    for p in baseline
      .snapshot
      .issues
      .iter()
      .filter(|p| self.rules.is_bottleneck(&p.status))
    {
      let exited = match now.get(p.key.as_str()) {
        Some(t) => !self.rules.is_bottleneck(&t.status),
        // A ticket missing from a truncated snapshot may simply be unfetched.
        None => !current.partial,
      };
      if exited {
        alerts.push(AlertEvent::transition(
          AlertKind::BottleneckExit,
          Severity::Info,
          &p.key,
          format!("{} moved out of {}", p.key, self.rules.bottleneck_status),
        ));
      }
    }
  }

  fn standing(
    &self,
    current: &Snapshot,
    agg: &Aggregates,
    enabled: &RuleSet,
    now: DateTime<Utc>,
    alerts: &mut Vec<AlertEvent>,
  ) {
    if enabled.contains(Rule::Escalation) && agg.escalated > 0 {
      let keys: Vec<&str> = current
        .issues
        .iter()
        .filter(|t| self.is_escalated(t, now))
        .map(|t| t.key.as_str())
        .take(10)
        .collect();
      alerts.push(AlertEvent::standing(
        AlertKind::BottleneckEscalation,
        Severity::Warn,
        format!(
          "{} ticket(s) in {} for more than {} days: {}",
          agg.escalated,
          self.rules.bottleneck_status,
          self.rules.escalation_age_days,
          keys.join(", ")
        ),
      ));
    }

    if enabled.contains(Rule::OverdueCrisis) && agg.overdue > self.rules.overdue_threshold {
      alerts.push(AlertEvent::standing(
        AlertKind::OverdueCrisis,
        Severity::Error,
        format!("{} tickets overdue, immediate attention needed", agg.overdue),
      ));
    }

    if enabled.contains(Rule::ComponentCrisis)
      && agg.missing_component > self.rules.missing_component_threshold
    {
      alerts.push(AlertEvent::standing(
        AlertKind::ComponentCrisis,
        Severity::Error,
        format!("{} tickets missing components", agg.missing_component),
      ));
    }

    if enabled.contains(Rule::BottleneckCrisis)
      && agg.bottleneck > self.rules.bottleneck_threshold
    {
      alerts.push(AlertEvent::standing(
        AlertKind::BottleneckCrisis,
        Severity::Error,
        format!(
          "{} tickets stuck in {}",
          agg.bottleneck, self.rules.bottleneck_status
        ),
      ));
    }

    if enabled.contains(Rule::Workload) {
      if let Some(alert) = self.workload_imbalance(agg) {
        alerts.push(alert);
      }
    }
  }

  fn workload_imbalance(&self, agg: &Aggregates) -> Option<AlertEvent> {
    if agg.open_by_assignee.len() < 2 {
      return None;
    }
    // Ties resolve to the alphabetically first assignee.
    let (busiest, max) = agg
      .open_by_assignee
      .iter()
      .fold(None::<(&String, usize)>, |acc, (name, &n)| match acc {
        Some((_, best)) if best >= n => acc,
        _ => Some((name, n)),
      })?;
    let (least, min) = agg
      .open_by_assignee
      .iter()
      .fold(None::<(&String, usize)>, |acc, (name, &n)| match acc {
        Some((_, best)) if best <= n => acc,
        _ => Some((name, n)),
      })?;

    if max - min <= self.rules.workload_spread {
      return None;
    }
    Some(AlertEvent::standing(
      AlertKind::WorkloadImbalance,
      Severity::Warn,
      format!(
        "Workload imbalance: {} has {} open tickets, {} has {}",
        busiest, max, least, min
      ),
    ))
  }

  fn is_open(&self, t: &Ticket) -> bool {
    !self.rules.is_terminal(&t.status)
  }

  fn is_overdue(&self, t: &Ticket, today: NaiveDate) -> bool {
    self.is_open(t) && t.due_date.is_some_and(|due| due < today)
  }

  fn is_due_today(&self, t: &Ticket, today: NaiveDate) -> bool {
    self.is_open(t) && t.due_date == Some(today)
  }

  fn is_escalated(&self, t: &Ticket, now: DateTime<Utc>) -> bool {
    self.rules.is_bottleneck(&t.status)
      && t
        .created
        .is_some_and(|created| now - created > Duration::days(self.rules.escalation_age_days))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::jira::types::fixtures::ticket;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 29, 15, 0, 0).unwrap()
  }

  fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
  }

  fn differ_with(rules: RulesConfig) -> Differ {
    Differ::new(rules, Arc::new(ManualClock::new(now())))
  }

  fn differ() -> Differ {
    differ_with(RulesConfig::default())
  }

  fn snapshot(issues: Vec<Ticket>) -> Snapshot {
    let total = issues.len() as u64;
    Snapshot::new("q", issues, total, now())
  }

  fn baseline_of(d: &Differ, snap: Snapshot, evaluated_at: DateTime<Utc>) -> Baseline {
    Baseline {
      aggregates: d.aggregates(&snap, evaluated_at),
      snapshot: Arc::new(snap),
      evaluated_at,
    }
  }

  fn overdue(key: &str) -> Ticket {
    let mut t = ticket(key);
    t.due_date = Some(day(20));
    t
  }

  fn count(alerts: &[AlertEvent], kind: AlertKind) -> usize {
    alerts.iter().filter(|a| a.kind == kind).count()
  }

  #[test]
  fn test_diff_against_itself_has_no_transitions() {
    let d = differ();
    let mut stuck = ticket("C");
    stuck.status = "Data Team New".into();
    let mut due = ticket("D");
    due.due_date = Some(day(29));
    let mut bare = ticket("E");
    bare.component = None;
    let snap = snapshot(vec![overdue("A"), ticket("B"), stuck, due, bare]);

    let base = baseline_of(&d, snap.clone(), now());
    let alerts = d.diff(&snap, Some(&base));
    assert!(alerts.iter().all(|a| a.persistent), "{:?}", alerts);
  }

  #[test]
  fn test_newly_overdue_fires_once_per_transition() {
    let d = differ();
    let mut before = ticket("A");
    before.due_date = Some(day(30));
    let base = baseline_of(&d, snapshot(vec![before]), now());

    let mut after = ticket("A");
    after.due_date = Some(day(28));
    let alerts = d.diff(&snapshot(vec![after.clone()]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 1);
    assert_eq!(alerts[0].ticket.as_deref(), Some("A"));
    assert!(!alerts[0].persistent);

    // Same state next cycle: nothing new.
    let base = baseline_of(&d, snapshot(vec![after.clone()]), now());
    let alerts = d.diff(&snapshot(vec![after]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 0);
  }

  #[test]
  fn test_crossing_midnight_makes_ticket_newly_overdue() {
    let d = differ();
    let mut t = ticket("A");
    t.due_date = Some(day(28));
    // Evaluated yesterday, when a due date of the 28th was still today.
    let yesterday = Utc.with_ymd_and_hms(2025, 1, 28, 23, 55, 0).unwrap();
    let base = baseline_of(&d, snapshot(vec![t.clone()]), yesterday);

    let alerts = d.diff(&snapshot(vec![t]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 1);
  }

  #[test]
  fn test_standing_overdue_crisis_refires_without_transitions() {
    let d = differ_with(RulesConfig {
      overdue_threshold: 0,
      ..RulesConfig::default()
    });
    let snap = snapshot(vec![overdue("A")]);
    let base = baseline_of(&d, snap.clone(), now());

    for _ in 0..2 {
      let alerts = d.diff(&snap, Some(&base));
      assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 0);
      assert_eq!(count(&alerts, AlertKind::OverdueCrisis), 1);
    }
  }

  #[test]
  fn test_overdue_crisis_scenario() {
    let d = differ();
    let old: Vec<Ticket> = (0..40).map(|i| overdue(&format!("OPS-{}", i))).collect();
    let base = baseline_of(&d, snapshot(old.clone()), now());
    assert_eq!(base.aggregates.overdue, 40);
    assert_eq!(count(&d.diff(&base.snapshot, Some(&base)), AlertKind::OverdueCrisis), 0);

    let mut issues = old;
    issues.extend((40..52).map(|i| overdue(&format!("OPS-{}", i))));
    let eval = d.evaluate(&snapshot(issues), Some(&base), &RuleSet::all());

    assert_eq!(count(&eval.alerts, AlertKind::NewlyOverdue), 12);
    assert_eq!(count(&eval.alerts, AlertKind::OverdueCrisis), 1);
    assert_eq!(eval.aggregates.overdue, 52);
  }

  #[test]
  fn test_terminal_tickets_are_never_overdue() {
    let d = differ();
    let mut done = overdue("A");
    done.status = "Done".into();
    let base = baseline_of(&d, snapshot(vec![]), now());
    let eval = d.evaluate(&snapshot(vec![done]), Some(&base), &RuleSet::all());
    assert_eq!(count(&eval.alerts, AlertKind::NewlyOverdue), 0);
    assert_eq!(eval.aggregates.overdue, 0);
  }

  #[test]
  fn test_due_today() {
    let d = differ();
    let base = baseline_of(&d, snapshot(vec![]), now());
    let mut t = ticket("A");
    t.due_date = Some(day(29));
    let alerts = d.diff(&snapshot(vec![t.clone()]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::NewlyDueToday), 1);
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 0);

    let base = baseline_of(&d, snapshot(vec![t.clone()]), now());
    assert_eq!(
      count(&d.diff(&snapshot(vec![t]), Some(&base)), AlertKind::NewlyDueToday),
      0
    );
  }

  #[test]
  fn test_component_assigned_is_not_missing_component() {
    let d = differ();
    let mut before = ticket("B");
    before.component = None;
    let base = baseline_of(&d, snapshot(vec![before]), now());

    let after = ticket("B");
    let alerts = d.diff(&snapshot(vec![after]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::ComponentAssigned), 1);
    assert_eq!(count(&alerts, AlertKind::NewlyMissingComponent), 0);
    let assigned = alerts
      .iter()
      .find(|a| a.kind == AlertKind::ComponentAssigned)
      .unwrap();
    assert_eq!(assigned.severity, Severity::Info);
  }

  #[test]
  fn test_new_ticket_without_component() {
    let d = differ();
    let base = baseline_of(&d, snapshot(vec![ticket("A")]), now());
    let mut bare = ticket("B");
    bare.component = None;
    let alerts = d.diff(&snapshot(vec![ticket("A"), bare]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::NewlyMissingComponent), 1);
  }

  #[test]
  fn test_bottleneck_entry_and_exit() {
    let d = differ();
    let mut stuck = ticket("A");
    stuck.status = "Data Team New".into();
    let base = baseline_of(&d, snapshot(vec![ticket("B"), stuck.clone()]), now());

    let mut entering = ticket("B");
    entering.status = "data team new".into();
    let mut leaving = stuck;
    leaving.status = "Data Team Testing".into();

    let alerts = d.diff(&snapshot(vec![entering, leaving]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::BottleneckEntry), 1);
    assert_eq!(count(&alerts, AlertKind::BottleneckExit), 1);
  }

  #[test]
  fn test_absent_ticket_exits_only_from_complete_snapshot() {
    let d = differ();
    let mut stuck = ticket("A");
    stuck.status = "Data Team New".into();
    let base = baseline_of(&d, snapshot(vec![stuck]), now());

    let complete = snapshot(vec![]);
    assert_eq!(count(&d.diff(&complete, Some(&base)), AlertKind::BottleneckExit), 1);

    let partial = Snapshot::new("q", vec![ticket("Z")], 500, now());
    assert_eq!(count(&d.diff(&partial, Some(&base)), AlertKind::BottleneckExit), 0);
  }

  #[test]
  fn test_escalation_is_standing() {
    let d = differ();
    let mut old = ticket("A");
    old.status = "Data Team New".into();
    old.created = Some(now() - Duration::days(5));
    let mut fresh = ticket("B");
    fresh.status = "Data Team New".into();
    fresh.created = Some(now() - Duration::days(1));
    let snap = snapshot(vec![old, fresh]);
    let base = baseline_of(&d, snap.clone(), now());

    let alerts = d.diff(&snap, Some(&base));
    let escalation: Vec<&AlertEvent> = alerts
      .iter()
      .filter(|a| a.kind == AlertKind::BottleneckEscalation)
      .collect();
    assert_eq!(escalation.len(), 1);
    assert!(escalation[0].persistent);
    assert!(escalation[0].message.contains('A'));
  }

  #[test]
  fn test_bottleneck_crisis_threshold_is_strict() {
    let d = differ();
    let stuck = |i: usize| {
      let mut t = ticket(&format!("S-{}", i));
      t.status = "Data Team New".into();
      t
    };
    let ten = snapshot((0..10).map(stuck).collect());
    assert_eq!(count(&d.diff(&ten, None), AlertKind::BottleneckCrisis), 0);
    let eleven = snapshot((0..11).map(stuck).collect());
    assert_eq!(count(&d.diff(&eleven, None), AlertKind::BottleneckCrisis), 1);
  }

  #[test]
  fn test_completion() {
    let d = differ();
    let base = baseline_of(&d, snapshot(vec![ticket("A")]), now());
    let mut done = ticket("A");
    done.status = "Done".into();
    let alerts = d.diff(&snapshot(vec![done.clone()]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::TicketCompleted), 1);

    // Already done in the baseline.
    let base = baseline_of(&d, snapshot(vec![done.clone()]), now());
    assert_eq!(
      count(&d.diff(&snapshot(vec![done]), Some(&base)), AlertKind::TicketCompleted),
      0
    );
  }

  #[test]
  fn test_workload_imbalance() {
    let d = differ_with(RulesConfig {
      workload_spread: 2,
      ..RulesConfig::default()
    });
    let mut issues = Vec::new();
    for i in 0..5 {
      let mut t = ticket(&format!("K-{}", i));
      t.assignee = "Kim".into();
      issues.push(t);
    }
    let mut t = ticket("J-1");
    t.assignee = "Jo".into();
    issues.push(t);
    // Unassigned tickets never count as the least busy.
    issues.push(ticket("U-1"));

    let alerts = d.diff(&snapshot(issues), None);
    let imbalance = alerts
      .iter()
      .find(|a| a.kind == AlertKind::WorkloadImbalance)
      .unwrap();
    assert!(imbalance.persistent);
    assert!(imbalance.message.contains("Kim has 5"));
    assert!(imbalance.message.contains("Jo has 1"));
  }

  #[test]
  fn test_workload_needs_two_assignees() {
    let d = differ_with(RulesConfig {
      workload_spread: 0,
      ..RulesConfig::default()
    });
    let mut t = ticket("A");
    t.assignee = "Kim".into();
    let alerts = d.diff(&snapshot(vec![t]), None);
    assert_eq!(count(&alerts, AlertKind::WorkloadImbalance), 0);
  }

  #[test]
  fn test_cold_start_policy() {
    let issues = vec![overdue("A"), overdue("B")];

    let suppress = differ_with(RulesConfig {
      overdue_threshold: 1,
      ..RulesConfig::default()
    });
    let alerts = suppress.diff(&snapshot(issues.clone()), None);
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 0);
    assert_eq!(count(&alerts, AlertKind::OverdueCrisis), 1);

    let fire = differ_with(RulesConfig {
      cold_start: ColdStartPolicy::Fire,
      ..RulesConfig::default()
    });
    let alerts = fire.diff(&snapshot(issues), None);
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 2);
  }

  #[test]
  fn test_partial_baseline_suppresses_transitions() {
    let d = differ_with(RulesConfig {
      overdue_threshold: 0,
      ..RulesConfig::default()
    });
    let partial = Snapshot::new("q", vec![ticket("A")], 100, now());
    let base = baseline_of(&d, partial, now());

    let alerts = d.diff(&snapshot(vec![overdue("B")]), Some(&base));
    assert_eq!(count(&alerts, AlertKind::NewlyOverdue), 0);
    assert_eq!(count(&alerts, AlertKind::OverdueCrisis), 1);
  }

  #[test]
  fn test_disabled_rules_do_not_fire() {
    let d = differ();
    let base = baseline_of(&d, snapshot(vec![]), now());
    let only_due_today: RuleSet = [Rule::DueToday].into_iter().collect();
    let eval = d.evaluate(&snapshot(vec![overdue("A")]), Some(&base), &only_due_today);
    assert!(eval.alerts.is_empty());
    assert_eq!(eval.aggregates.overdue, 1);
  }
}
