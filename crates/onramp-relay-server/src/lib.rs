//! HTTP surface for the payout relay: webhook ingestion, checkout
//! session creation, health and metrics.

pub mod checkout;
pub mod config;
pub mod metrics;
pub mod routes;
pub mod state;
