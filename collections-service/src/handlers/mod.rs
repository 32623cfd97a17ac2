//! HTTP entry points: gateway webhooks, job triggers for the periodic
//! invoker, contract lifecycle hooks and operator actions.

pub mod contracts;
pub mod health;
pub mod jobs;
pub mod mandates;
pub mod webhooks;

pub use health::{health_check, metrics_handler, readiness_check};
