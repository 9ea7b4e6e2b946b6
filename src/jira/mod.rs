pub mod api_types;
pub mod client;
pub mod fetcher;
pub mod queries;
pub mod types;

pub use client::JiraClient;
pub use fetcher::{FetchLimits, Fetcher, PageSource};
pub use types::{Snapshot, Ticket};
