//! IntelForge Common Library
//!
//! Shared code for the lookup engine and its HTTP surface:
//! - Configuration management
//! - Error types and HTTP mapping
//! - Query ledger entity and repository
//! - Actor extraction
//! - Metrics and observability

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on the stored length of a raw query value
pub const MAX_QUERY_VALUE_LEN: usize = 256;
