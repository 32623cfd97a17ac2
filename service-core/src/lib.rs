//! Shared plumbing for the collections engine: errors, configuration,
//! tracing, HTTP middleware and outbound retries.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod retry;

pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
pub use validator;
