//! Payout dispatcher: turns an admitted intent into exactly one
//! backend transfer instruction.
//!
//! Ordering invariant: the ledger transition to `Dispatching` happens
//! before the backend call, and the ledger lock is never held across
//! it. Transient failures get a bounded exponential backoff; permanent
//! rejections finalize immediately; an ambiguous outcome (timeout with
//! unknown backend result) is resolved by a status query, never by
//! resubmitting -- value movement is not revocable.

use std::sync::Arc;

use crate::backend::{PayoutBackend, TransferReceipt, TransferStatus};
use crate::error::{BackendError, RelayError};
use crate::event::PayoutIntent;
use crate::ledger::PayoutLedger;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(500),
            max_backoff: std::time::Duration::from_secs(8),
        }
    }
}

pub struct PayoutDispatcher<B> {
    backend: Arc<B>,
    ledger: Arc<dyn PayoutLedger>,
    retry: RetryPolicy,
}

impl<B> PayoutDispatcher<B>
where
    B: PayoutBackend,
{
    pub fn new(backend: Arc<B>, ledger: Arc<dyn PayoutLedger>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            ledger,
            retry,
        }
    }

    /// Execute the payout for an admitted (`Pending`) intent.
    ///
    /// On success the entry is left `Dispatching` with the transfer
    /// reference recorded; finalization belongs to the confirmation
    /// tracker. On a terminal failure the entry is `Failed` with the
    /// reason persisted. On an unresolvable ambiguous outcome the
    /// entry stays `Dispatching` for the reconciliation sweep.
    pub async fn dispatch(&self, intent: &PayoutIntent) -> Result<TransferReceipt, RelayError> {
        let key = &intent.idempotency_key;

        // Exact conversion to smallest units. A non-representable
        // amount is rejected here, before any value moves.
        let base_units = match intent.asset.to_base_units(&intent.amount) {
            Ok(units) => units,
            Err(e) => {
                self.ledger.mark_failed(key, &e.to_string())?;
                return Err(e);
            }
        };

        self.ledger.mark_dispatching(key)?;

        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1u32;
        loop {
            match self
                .backend
                .transfer(&intent.destination_address, base_units, intent.asset)
                .await
            {
                Ok(receipt) => {
                    if let Err(e) = self.ledger.record_reference(key, &receipt.tx_reference) {
                        // The transfer is in flight regardless; surface
                        // the bookkeeping failure but do not unwind.
                        tracing::error!(key = %key, error = %e, "failed to record transfer reference");
                    }
                    tracing::info!(
                        key = %key,
                        tx = %receipt.tx_reference,
                        attempt,
                        "payout dispatched"
                    );
                    return Ok(receipt);
                }
                Err(BackendError::Transient(reason)) => {
                    if attempt >= self.retry.max_attempts {
                        let summary = format!(
                            "retries exhausted after {attempt} attempts: {reason}"
                        );
                        tracing::error!(key = %key, reason = %reason, attempt, "payout failed");
                        self.ledger.mark_failed(key, &summary)?;
                        return Err(BackendError::Transient(summary).into());
                    }
                    tracing::warn!(
                        key = %key,
                        reason = %reason,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient backend failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                Err(BackendError::Permanent(reason)) => {
                    tracing::error!(key = %key, reason = %reason, "payout rejected by backend");
                    self.ledger.mark_failed(key, &reason)?;
                    return Err(BackendError::Permanent(reason).into());
                }
                Err(BackendError::Ambiguous {
                    reason,
                    tx_reference,
                }) => {
                    return self.resolve_ambiguous(key, reason, tx_reference).await;
                }
            }
        }
    }

    /// The submission timed out with the backend outcome unknown. The
    /// transfer may exist; resubmitting could pay twice. If we hold a
    /// reference, ask the backend what actually happened; otherwise
    /// the entry stays `Dispatching` for operator reconciliation.
    async fn resolve_ambiguous(
        &self,
        key: &str,
        reason: String,
        tx_reference: Option<String>,
    ) -> Result<TransferReceipt, RelayError> {
        let Some(tx_reference) = tx_reference else {
            tracing::error!(
                key = %key,
                reason = %reason,
                "ambiguous submission with no transfer reference — entry left for reconciliation"
            );
            return Err(BackendError::Ambiguous {
                reason,
                tx_reference: None,
            }
            .into());
        };

        if let Err(e) = self.ledger.record_reference(key, &tx_reference) {
            tracing::error!(key = %key, error = %e, "failed to record transfer reference");
        }

        match self.backend.status(&tx_reference).await {
            Ok(TransferStatus::Confirmed) | Ok(TransferStatus::Pending) => {
                // The transfer exists. Hand it to the confirmation
                // tracker like any successful submission.
                tracing::info!(
                    key = %key,
                    tx = %tx_reference,
                    "ambiguous submission resolved: transfer exists"
                );
                Ok(TransferReceipt { tx_reference })
            }
            Ok(TransferStatus::Failed { reason }) => {
                tracing::error!(key = %key, reason = %reason, "ambiguous submission resolved: failed");
                self.ledger.mark_failed(key, &reason)?;
                Err(BackendError::Permanent(reason).into())
            }
            Err(e) => {
                // Still unknown. Leave the entry dispatching; the
                // reconciliation sweep retries the status query.
                tracing::error!(
                    key = %key,
                    tx = %tx_reference,
                    error = %e,
                    "ambiguous submission unresolved — entry left for reconciliation"
                );
                Err(BackendError::Ambiguous {
                    reason,
                    tx_reference: Some(tx_reference),
                }
                .into())
            }
        }
    }
}
