//! The payout backend seam.
//!
//! Two interchangeable implementations settle payouts: an on-chain
//! transfer client ([`crate::chain::ChainBackend`]) and an exchange
//! withdrawal client ([`crate::exchange::ExchangeBackend`]). The
//! dispatcher and confirmation tracker are written against this trait
//! only; which one runs is a deployment configuration decision.

use crate::asset::Asset;
use crate::error::BackendError;

/// Acknowledgement that the backend accepted a transfer instruction.
/// The reference is opaque: a transaction hash on-chain, a withdrawal
/// id on an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_reference: String,
}

/// Settlement status of a previously submitted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Submitted but not yet final.
    Pending,
    /// Reached the backend's finality condition. Irreversible.
    Confirmed,
    /// The backend reports the transfer failed.
    Failed { reason: String },
}

/// A payout settlement backend.
///
/// `transfer` irreversibly moves value once the backend accepts the
/// instruction. Callers must never resubmit after an ambiguous
/// outcome without first consulting `status`.
pub trait PayoutBackend: Send + Sync {
    /// Submit a transfer of `base_units` smallest units of `asset` to
    /// `destination`. Returns once the backend has accepted the
    /// instruction; finality is tracked separately via [`Self::status`].
    fn transfer(
        &self,
        destination: &str,
        base_units: u128,
        asset: Asset,
    ) -> impl std::future::Future<Output = Result<TransferReceipt, BackendError>> + Send;

    /// Query the settlement status of a submitted transfer.
    fn status(
        &self,
        tx_reference: &str,
    ) -> impl std::future::Future<Output = Result<TransferStatus, BackendError>> + Send;
}

/// Scriptable backend for dispatcher/tracker/pipeline tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockBackend {
        /// Every transfer the backend accepted: (destination, base units, asset).
        pub calls: Mutex<Vec<(String, u128, Asset)>>,
        transfer_script: Mutex<VecDeque<Result<TransferReceipt, BackendError>>>,
        status_script: Mutex<VecDeque<Result<TransferStatus, BackendError>>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the result of the next `transfer` call. With an empty
        /// queue, transfers succeed with reference `0xmock`.
        pub fn script_transfer(&self, result: Result<TransferReceipt, BackendError>) {
            self.transfer_script.lock().unwrap().push_back(result);
        }

        /// Queue the result of the next `status` call. With an empty
        /// queue, status queries return `Confirmed`.
        pub fn script_status(&self, result: Result<TransferStatus, BackendError>) {
            self.status_script.lock().unwrap().push_back(result);
        }

        /// Discard unconsumed scripted status results so subsequent
        /// queries fall back to the empty-queue default (`Confirmed`).
        pub fn clear_status_script(&self) {
            self.status_script.lock().unwrap().clear();
        }

        pub fn transfer_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl PayoutBackend for MockBackend {
        async fn transfer(
            &self,
            destination: &str,
            base_units: u128,
            asset: Asset,
        ) -> Result<TransferReceipt, BackendError> {
            // Every attempt is recorded, including failed ones, so tests
            // can assert both payloads and attempt counts.
            self.calls
                .lock()
                .unwrap()
                .push((destination.to_string(), base_units, asset));
            let scripted = self.transfer_script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(TransferReceipt {
                    tx_reference: "0xmock".to_string(),
                })
            })
        }

        async fn status(&self, _tx_reference: &str) -> Result<TransferStatus, BackendError> {
            let scripted = self.status_script.lock().unwrap().pop_front();
            scripted.unwrap_or(Ok(TransferStatus::Confirmed))
        }
    }
}
