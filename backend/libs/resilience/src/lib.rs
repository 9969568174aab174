//! Resilience patterns shared by the arena services
//!
//! - **Retry**: exponential backoff with jitter for transient failures, with an
//!   optional predicate so permanent errors (conflicts, validation) fail fast.
//!
//! # Example
//!
//! ```rust,no_run
//! use resilience::{with_retry_if, RetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = with_retry_if(
//!         RetryConfig::quick(),
//!         |e: &String| e.starts_with("unavailable"),
//!         || async { Ok::<_, String>(()) },
//!     )
//!     .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod retry;

pub use retry::{backoff_for_attempt, with_retry, with_retry_if, RetryConfig, RetryError};
