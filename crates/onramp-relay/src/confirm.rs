//! Confirmation tracker: awaits backend finality for a submitted
//! transfer and finalizes the ledger entry.
//!
//! On-chain settlement is asynchronous, so this polls until the
//! backend reports the transfer final or failed, or a deadline
//! elapses. A deadline is NOT a failure: the entry stays
//! `Dispatching` and the reconciliation sweep picks it up later.

use std::sync::Arc;

use crate::backend::{PayoutBackend, TransferStatus};
use crate::error::RelayError;
use crate::ledger::PayoutLedger;

/// Finality policy: how often to poll and how long to wait in-request
/// before handing over to reconciliation. The confirmation count
/// itself is a backend concern (e.g. [`crate::chain::ChainBackend`]'s
/// `min_confirmations`).
#[derive(Debug, Clone)]
pub struct ConfirmationPolicy {
    pub poll_interval: std::time::Duration,
    pub deadline: std::time::Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(3),
            deadline: std::time::Duration::from_secs(60),
        }
    }
}

/// Outcome of awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Finality reached; ledger entry is `Completed`.
    Confirmed,
    /// Backend reported failure; ledger entry is `Failed`.
    Failed { reason: String },
    /// Deadline elapsed with the transfer still pending. The entry
    /// remains `Dispatching` for reconciliation.
    Unresolved,
}

pub struct ConfirmationTracker<B> {
    backend: Arc<B>,
    ledger: Arc<dyn PayoutLedger>,
    policy: ConfirmationPolicy,
}

impl<B> ConfirmationTracker<B>
where
    B: PayoutBackend,
{
    pub fn new(
        backend: Arc<B>,
        ledger: Arc<dyn PayoutLedger>,
        policy: ConfirmationPolicy,
    ) -> Self {
        Self {
            backend,
            ledger,
            policy,
        }
    }

    /// Poll the backend until the transfer is final, failed, or the
    /// deadline passes, then finalize the ledger accordingly.
    pub async fn await_confirmation(
        &self,
        key: &str,
        tx_reference: &str,
    ) -> Result<Confirmation, RelayError> {
        let deadline = tokio::time::Instant::now() + self.policy.deadline;

        loop {
            match self.backend.status(tx_reference).await {
                Ok(TransferStatus::Confirmed) => {
                    self.ledger.mark_completed(key, tx_reference)?;
                    tracing::info!(key = %key, tx = %tx_reference, "payout confirmed");
                    return Ok(Confirmation::Confirmed);
                }
                Ok(TransferStatus::Failed { reason }) => {
                    self.ledger.mark_failed(key, &reason)?;
                    tracing::error!(key = %key, tx = %tx_reference, reason = %reason, "payout failed at backend");
                    return Ok(Confirmation::Failed { reason });
                }
                Ok(TransferStatus::Pending) => {}
                Err(e) => {
                    // A failed status query says nothing about the
                    // transfer itself. Only a backend-reported Failed
                    // may finalize; keep polling until the deadline.
                    tracing::warn!(key = %key, tx = %tx_reference, error = %e, "status query failed");
                }
            }

            if tokio::time::Instant::now() + self.policy.poll_interval > deadline {
                tracing::warn!(
                    key = %key,
                    tx = %tx_reference,
                    "confirmation deadline elapsed — entry left for reconciliation"
                );
                return Ok(Confirmation::Unresolved);
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::backend::mock::MockBackend;
    use crate::error::BackendError;
    use crate::event::PayoutIntent;
    use crate::ledger::{InMemoryLedger, PayoutState};

    fn fast_policy() -> ConfirmationPolicy {
        ConfirmationPolicy {
            poll_interval: std::time::Duration::from_millis(1),
            deadline: std::time::Duration::from_millis(20),
        }
    }

    fn setup(key: &str) -> (Arc<MockBackend>, Arc<InMemoryLedger>, ConfirmationTracker<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .admit(&PayoutIntent {
                idempotency_key: key.to_string(),
                amount: "10".to_string(),
                asset: Asset::Usdt,
                destination_address: "0x14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e".to_string(),
                source_session_id: "cs_1".to_string(),
            })
            .unwrap();
        ledger.mark_dispatching(key).unwrap();
        let tracker = ConfirmationTracker::new(
            Arc::clone(&backend),
            ledger.clone() as Arc<dyn PayoutLedger>,
            fast_policy(),
        );
        (backend, ledger, tracker)
    }

    #[tokio::test]
    async fn test_pending_then_confirmed_completes_entry() {
        let (backend, ledger, tracker) = setup("evt_1");
        backend.script_status(Ok(TransferStatus::Pending));
        backend.script_status(Ok(TransferStatus::Pending));
        backend.script_status(Ok(TransferStatus::Confirmed));

        let outcome = tracker.await_confirmation("evt_1", "0xabc").await.unwrap();
        assert_eq!(outcome, Confirmation::Confirmed);

        let entry = ledger.get("evt_1").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Completed);
        assert_eq!(entry.tx_reference.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_backend_failure_finalizes_failed() {
        let (backend, ledger, tracker) = setup("evt_2");
        backend.script_status(Ok(TransferStatus::Failed {
            reason: "reverted".into(),
        }));

        let outcome = tracker.await_confirmation("evt_2", "0xabc").await.unwrap();
        assert_eq!(
            outcome,
            Confirmation::Failed {
                reason: "reverted".into()
            }
        );
        let entry = ledger.get("evt_2").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("reverted"));
    }

    #[tokio::test]
    async fn test_deadline_leaves_entry_dispatching() {
        let (backend, ledger, tracker) = setup("evt_3");
        // Stays pending forever.
        for _ in 0..64 {
            backend.script_status(Ok(TransferStatus::Pending));
        }

        let outcome = tracker.await_confirmation("evt_3", "0xabc").await.unwrap();
        assert_eq!(outcome, Confirmation::Unresolved);

        // Timeout is not failure: the entry must stay dispatching.
        let entry = ledger.get("evt_3").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Dispatching);
        assert!(entry.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_query_rejection_does_not_finalize() {
        let (backend, ledger, tracker) = setup("evt_5");
        // A revoked key or IP block fails the query, not the transfer.
        for _ in 0..64 {
            backend.script_status(Err(BackendError::Permanent(
                "exchange rejected withdrawal (401): invalid api key".into(),
            )));
        }

        let outcome = tracker.await_confirmation("evt_5", "0xabc").await.unwrap();
        assert_eq!(outcome, Confirmation::Unresolved);

        let entry = ledger.get("evt_5").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Dispatching);
        assert!(entry.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_transient_query_errors_tolerated() {
        let (backend, ledger, tracker) = setup("evt_4");
        backend.script_status(Err(BackendError::Transient("rpc hiccup".into())));
        backend.script_status(Ok(TransferStatus::Confirmed));

        let outcome = tracker.await_confirmation("evt_4", "0xabc").await.unwrap();
        assert_eq!(outcome, Confirmation::Confirmed);
        assert_eq!(
            ledger.get("evt_4").unwrap().unwrap().state,
            PayoutState::Completed
        );
    }
}
