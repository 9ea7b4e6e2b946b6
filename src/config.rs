use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::alerts::Rule;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub jira: JiraConfig,
  /// JQL prefix shared by the default watched queries, e.g. `project in (OPS, DATA)`
  #[serde(default)]
  pub scope: Option<String>,
  #[serde(default)]
  pub fetch: FetchConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub polling: PollingConfig,
  #[serde(default)]
  pub rules: RulesConfig,
  /// Watched queries. When empty, the default set is derived from `scope`.
  #[serde(default)]
  pub queries: Vec<QueryConfig>,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraConfig {
  pub url: String,
  pub email: String,
  #[serde(default = "default_search_path")]
  pub search_path: String,
  /// Custom field holding story points
  #[serde(default = "default_story_points_field")]
  pub story_points_field: Option<String>,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

fn default_search_path() -> String {
  "rest/api/3/search".to_string()
}

fn default_story_points_field() -> Option<String> {
  Some("customfield_10016".to_string())
}

fn default_request_timeout() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub page_size: u64,
  /// Safety ceiling; snapshots beyond it are returned partial.
  pub max_records: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      page_size: 100,
      max_records: 50_000,
    }
  }
}

/// Upper bound for any cache TTL: one week.
pub const MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Upper bound for `rules.escalation_age_days`.
pub const MAX_ESCALATION_AGE_DAYS: i64 = 3650;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub critical_ttl_secs: u64,
  pub broad_ttl_secs: u64,
  pub normal_ttl_secs: u64,
  /// Serve an expired entry when a refresh fails instead of erroring.
  pub serve_stale_on_error: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      critical_ttl_secs: 60,
      broad_ttl_secs: 120,
      normal_ttl_secs: 300,
      serve_stale_on_error: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
  /// Interval for queries that do not set their own
  pub interval_secs: u64,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self { interval_secs: 120 }
  }
}

/// What the differ does when a query has no baseline yet.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColdStartPolicy {
  /// Only persistent alerts on the first cycle
  #[default]
  Suppress,
  /// Treat every flagged ticket as a fresh transition
  Fire,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
  pub bottleneck_status: String,
  /// Statuses that end a ticket's life; case-insensitive.
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub terminal_statuses: BTreeSet<String>,
  pub overdue_threshold: usize,
  pub missing_component_threshold: usize,
  pub bottleneck_threshold: usize,
  /// Days in the bottleneck (since creation) before a ticket escalates
  pub escalation_age_days: i64,
  /// Max allowed gap between busiest and least-busy assignee
  pub workload_spread: usize,
  pub cold_start: ColdStartPolicy,
  pub suppress_on_partial_baseline: bool,
}

impl Default for RulesConfig {
  fn default() -> Self {
    Self {
      bottleneck_status: "Data Team New".to_string(),
      terminal_statuses: ["done", "closed", "resolved", "cancelled"]
        .into_iter()
        .map(String::from)
        .collect(),
      overdue_threshold: 50,
      missing_component_threshold: 50,
      bottleneck_threshold: 10,
      escalation_age_days: 3,
      workload_spread: 15,
      cold_start: ColdStartPolicy::Suppress,
      suppress_on_partial_baseline: true,
    }
  }
}

impl RulesConfig {
  pub fn is_terminal(&self, status: &str) -> bool {
    self.terminal_statuses.contains(&status.to_lowercase())
  }

  pub fn is_bottleneck(&self, status: &str) -> bool {
    status.eq_ignore_ascii_case(&self.bottleneck_status)
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  pub name: String,
  pub jql: String,
  pub interval_secs: Option<u64>,
  /// Rules evaluated for this query; all of them when omitted.
  pub rules: Option<Vec<Rule>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Write logs to a daily rolling file in this directory instead of stderr
  pub directory: Option<PathBuf>,
  /// `EnvFilter` directive used when `TIXWATCH_LOG` is unset
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tixwatch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tixwatch/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tixwatch/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tixwatch.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tixwatch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml_str(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject settings the scheduler cannot run with.
  pub fn validate(&self) -> Result<()> {
    url::Url::parse(&self.jira.url)
      .map_err(|e| eyre!("Invalid jira.url {:?}: {}", self.jira.url, e))?;
    if self.jira.email.trim().is_empty() {
      return Err(eyre!("jira.email must not be empty"));
    }
    if self.fetch.page_size == 0 || self.fetch.max_records == 0 {
      return Err(eyre!("fetch.page_size and fetch.max_records must be positive"));
    }
    if self.polling.interval_secs == 0 {
      return Err(eyre!("polling.interval_secs must be positive"));
    }
    let ttls = [
      ("critical_ttl_secs", self.cache.critical_ttl_secs),
      ("broad_ttl_secs", self.cache.broad_ttl_secs),
      ("normal_ttl_secs", self.cache.normal_ttl_secs),
    ];
    for (name, secs) in ttls {
      if secs > MAX_TTL_SECS {
        return Err(eyre!("cache.{} must be at most {}", name, MAX_TTL_SECS));
      }
    }
    if !(0..=MAX_ESCALATION_AGE_DAYS).contains(&self.rules.escalation_age_days) {
      return Err(eyre!(
        "rules.escalation_age_days must be between 0 and {}",
        MAX_ESCALATION_AGE_DAYS
      ));
    }

    let mut names = BTreeSet::new();
    for query in &self.queries {
      if query.name.trim().is_empty() || query.jql.trim().is_empty() {
        return Err(eyre!("Every query needs a name and a jql"));
      }
      if query.interval_secs == Some(0) {
        return Err(eyre!("Query {} has a zero interval", query.name));
      }
      if !names.insert(query.name.as_str()) {
        return Err(eyre!("Duplicate query name: {}", query.name));
      }
    }
    Ok(())
  }

  /// Get the Jira API token from environment variables.
  ///
  /// Checks TIXWATCH_JIRA_TOKEN first, then JIRA_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("TIXWATCH_JIRA_TOKEN")
      .or_else(|_| std::env::var("JIRA_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Jira API token not found. Set TIXWATCH_JIRA_TOKEN or JIRA_API_TOKEN environment variable."
        )
      })
  }
}
