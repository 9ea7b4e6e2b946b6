//! Ticket sync and change detection against a Jira-style search API.

pub mod alerts;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod jira;
pub mod scheduler;
pub mod store;
