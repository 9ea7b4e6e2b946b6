use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::jira::api_types::{ApiSearchResponse, SEARCH_FIELDS};
use crate::jira::fetcher::PageSource;

/// Jira REST client for the search endpoint.
#[derive(Clone)]
pub struct JiraClient {
  http: reqwest::Client,
  search_url: Url,
  email: String,
  token: String,
  fields: String,
}

impl JiraClient {
  pub fn new(config: &Config) -> SyncResult<Self> {
    let token = Config::get_api_token().map_err(|e| SyncError::Configuration(e.to_string()))?;
    Self::with_token(config, token)
  }

  pub fn with_token(config: &Config, token: String) -> SyncResult<Self> {
    if token.is_empty() {
      return Err(SyncError::Configuration("Jira API token is empty".to_string()));
    }

    let base = Url::parse(&config.jira.url).map_err(|e| {
      SyncError::Configuration(format!("invalid Jira url {}: {}", config.jira.url, e))
    })?;
    // Without a trailing slash `join` would drop the last path segment.
    let base = if base.path().ends_with('/') {
      base
    } else {
      Url::parse(&format!("{}/", base))
        .map_err(|e| SyncError::Configuration(format!("invalid Jira url: {}", e)))?
    };
    let search_url = base
      .join(config.jira.search_path.trim_start_matches('/'))
      .map_err(|e| SyncError::Configuration(format!("invalid search path: {}", e)))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.jira.request_timeout_secs))
      .build()
      .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {}", e)))?;

    let fields = match config.jira.story_points_field.as_deref() {
      Some(sp) if !sp.is_empty() => format!("{},{}", SEARCH_FIELDS, sp),
      _ => SEARCH_FIELDS.to_string(),
    };

    Ok(Self {
      http,
      search_url,
      email: config.jira.email.clone(),
      token,
      fields,
    })
  }

  pub fn search_url(&self) -> &Url {
    &self.search_url
  }
}

#[async_trait]
impl PageSource for JiraClient {
  async fn search_page(
    &self,
    jql: &str,
    start_at: u64,
    max_results: u64,
  ) -> SyncResult<ApiSearchResponse> {
    let start_at = start_at.to_string();
    let max_results = max_results.to_string();

    let response = self
      .http
      .get(self.search_url.clone())
      .basic_auth(&self.email, Some(&self.token))
      .header(reqwest::header::ACCEPT, "application/json")
      .query(&[
        ("jql", jql),
        ("startAt", start_at.as_str()),
        ("maxResults", max_results.as_str()),
        ("fields", self.fields.as_str()),
      ])
      .send()
      .await
      .map_err(|e| SyncError::transport(jql, e))?;

    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| SyncError::transport(jql, e))?;

    if !status.is_success() {
      tracing::warn!(status = status.as_u16(), jql, "Jira search request rejected");
      return Err(SyncError::UpstreamStatus {
        query: jql.to_string(),
        status: status.as_u16(),
        body,
      });
    }

    serde_json::from_str(&body).map_err(|e| SyncError::parse(jql, e))
  }
}
