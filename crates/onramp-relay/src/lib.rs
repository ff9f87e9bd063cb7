//! Payment-triggered payout relay.
//!
//! Receives signed "payment completed" webhook events, verifies and
//! normalizes them into payout intents, and settles each intent as
//! exactly one token transfer to the buyer's wallet.
//!
//! # Pipeline
//!
//! inbound event -> [`SignatureVerifier`] -> [`event::normalize`] ->
//! [`PayoutLedger::admit`] -> [`PayoutDispatcher`] ->
//! [`ConfirmationTracker`] -> ledger finalization
//!
//! The idempotency ledger is the only state shared across requests;
//! its atomic admission is what makes provider redelivery safe.
//! Settlement runs against the [`PayoutBackend`] trait with two
//! implementations: [`chain::ChainBackend`] (custody-wallet ERC-20
//! transfer) and [`exchange::ExchangeBackend`] (exchange withdrawal).
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay::{
//!     ConfirmationPolicy, InMemoryLedger, PayoutLedger, PayoutPipeline, RetryPolicy,
//!     SignatureVerifier,
//! };
//!
//! # async fn run(backend: Arc<relay::exchange::ExchangeBackend>) {
//! let verifier = SignatureVerifier::new(b"whsec_...".to_vec(), 300).unwrap();
//! let ledger: Arc<dyn PayoutLedger> = Arc::new(InMemoryLedger::new());
//! let pipeline = PayoutPipeline::new(
//!     verifier,
//!     ledger,
//!     backend,
//!     RetryPolicy::default(),
//!     ConfirmationPolicy::default(),
//! );
//!
//! let outcome = pipeline
//!     .handle_event(br#"{"id":"evt_1", ...}"#, "t=...,v1=...")
//!     .await
//!     .unwrap();
//! # }
//! ```

pub mod asset;
pub mod backend;
pub mod chain;
pub mod confirm;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod exchange;
pub mod ledger;
pub mod pipeline;
pub mod security;
pub mod signature;

// Re-exports
pub use asset::Asset;
pub use backend::{PayoutBackend, TransferReceipt, TransferStatus};
pub use confirm::{Confirmation, ConfirmationPolicy, ConfirmationTracker};
pub use dispatcher::{PayoutDispatcher, RetryPolicy};
pub use error::{BackendError, LedgerError, RelayError};
pub use event::{NormalizedEvent, PayoutIntent};
pub use ledger::{Admission, InMemoryLedger, LedgerEntry, PayoutLedger, PayoutState, SqliteLedger};
pub use pipeline::{PayoutPipeline, WebhookOutcome};
pub use signature::{SignatureVerifier, VerifiedEvent};
