//! Statbucket Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared value types, error handling, and logging for the Statbucket workspace.
//!
//! # Overview
//!
//! - **Types**: the tagged cell [`Value`](types::Value) and the ordered [`Row`](types::Row)
//!   that flow from extraction through schema diffing into storage
//! - **Error Handling**: the common error type used for state and configuration files
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use statbucket_common::types::{Row, Value};
//!
//! let mut row = Row::new();
//! row.push("team", Value::text("Boston Celtics"));
//! row.push("wins", Value::Number(64.0));
//! assert_eq!(row.get("wins").map(|v| v.to_string()), Some("64".to_string()));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, StatbucketError};
pub use types::{Row, Value, ValueKind};
