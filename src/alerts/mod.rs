//! Change detection: transition alerts against a baseline plus standing
//! conditions re-evaluated every cycle.

mod differ;
mod types;

pub use differ::{Aggregates, Differ, Evaluation};
pub use types::{sort_for_display, AlertEvent, AlertKind, Rule, RuleSet, Severity};
