//! Recurring direct-debit collections: mandates, per-period scheduling,
//! scheme-compliant pre-notification, gateway submission and settlement,
//! return handling and dunning.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
