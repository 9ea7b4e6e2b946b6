//! Error taxonomy for the sync engine.
//!
//! Startup code (config loading, the binary) reports through `color_eyre`;
//! everything on the fetch/cache/diff path returns [`SyncError`] so callers can
//! tell a transport failure from an upstream rejection.

/// Failure of one fetch or refresh cycle.
///
/// `Clone` because a single in-flight fetch is shared by every caller waiting
/// on the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// Network or connection failure while requesting a page.
  #[error("transport failure for query `{query}`: {message}")]
  Transport { query: String, message: String },

  /// The tracker answered with a non-success status.
  #[error("upstream returned status {status} for query `{query}`: {body}")]
  UpstreamStatus {
    query: String,
    status: u16,
    body: String,
  },

  /// The response body could not be decoded.
  #[error("malformed response for query `{query}`: {message}")]
  Parse { query: String, message: String },

  /// Missing credential or endpoint.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// A refresh was requested for a query name nobody registered.
  #[error("unknown query `{0}`")]
  UnknownQuery(String),
}

impl SyncError {
  pub fn transport(query: &str, err: impl std::fmt::Display) -> Self {
    Self::Transport {
      query: query.to_string(),
      message: err.to_string(),
    }
  }

  pub fn parse(query: &str, err: impl std::fmt::Display) -> Self {
    Self::Parse {
      query: query.to_string(),
      message: err.to_string(),
    }
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
