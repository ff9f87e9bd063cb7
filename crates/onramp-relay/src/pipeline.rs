//! End-to-end payout pipeline.
//!
//! Control flow per inbound event: signature verification -> intent
//! normalization -> ledger admission -> dispatch -> confirmation ->
//! ledger finalization. Requests share no mutable state except the
//! ledger; its admission check is the single synchronization point.

use std::sync::Arc;

use crate::backend::{PayoutBackend, TransferStatus};
use crate::confirm::{Confirmation, ConfirmationPolicy, ConfirmationTracker};
use crate::dispatcher::{PayoutDispatcher, RetryPolicy};
use crate::error::{BackendError, RelayError};
use crate::event::{normalize, NormalizedEvent};
use crate::ledger::{Admission, PayoutLedger};
use crate::signature::SignatureVerifier;

/// What the HTTP layer should tell the provider. Everything here is
/// an acknowledgement (2xx); verification and normalization failures
/// surface as `Err(RelayError)` and map to 4xx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event category we do not act on. Acknowledged so the provider
    /// stops redelivering.
    Ignored { kind: String },
    /// Redelivery of an already-known intent; no second payout.
    Duplicate { key: String, admission: Admission },
    /// Payout dispatched and confirmed final.
    Completed { key: String, tx_reference: String },
    /// Payout dispatched; finality still pending when the in-request
    /// deadline elapsed. Reconciliation will finalize it.
    Settling { key: String, tx_reference: String },
    /// Submission outcome unknown (no usable transfer reference).
    /// Requires reconciliation; deliberately not reported as failed.
    Unresolved { key: String },
    /// Payout terminally failed after the payment completed. The
    /// ledger holds the reason; operators are alerted via logs and
    /// metrics. Still acknowledged -- a redelivery would be rejected
    /// by admission anyway.
    Failed { key: String, reason: String },
}

pub struct PayoutPipeline<B> {
    verifier: SignatureVerifier,
    ledger: Arc<dyn PayoutLedger>,
    backend: Arc<B>,
    dispatcher: PayoutDispatcher<B>,
    tracker: ConfirmationTracker<B>,
}

impl<B> PayoutPipeline<B>
where
    B: PayoutBackend,
{
    pub fn new(
        verifier: SignatureVerifier,
        ledger: Arc<dyn PayoutLedger>,
        backend: Arc<B>,
        retry: RetryPolicy,
        confirmation: ConfirmationPolicy,
    ) -> Self {
        let dispatcher =
            PayoutDispatcher::new(Arc::clone(&backend), Arc::clone(&ledger), retry);
        let tracker =
            ConfirmationTracker::new(Arc::clone(&backend), Arc::clone(&ledger), confirmation);
        Self {
            verifier,
            ledger,
            backend,
            dispatcher,
            tracker,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn PayoutLedger> {
        &self.ledger
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Handle one inbound webhook delivery.
    ///
    /// `raw_body` must be the exact bytes received; verification runs
    /// over them before anything is parsed. No ledger entry exists for
    /// an event that fails verification or normalization.
    pub async fn handle_event(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome, RelayError> {
        let verified = self.verifier.verify(raw_body, signature_header)?;

        let intent = match normalize(&verified)? {
            NormalizedEvent::Ignored { kind } => return Ok(WebhookOutcome::Ignored { kind }),
            NormalizedEvent::Payout(intent) => intent,
        };
        let key = intent.idempotency_key.clone();

        match self.ledger.admit(&intent)? {
            Admission::Accepted => {}
            admission => {
                tracing::info!(key = %key, ?admission, "duplicate delivery acknowledged");
                return Ok(WebhookOutcome::Duplicate { key, admission });
            }
        }

        tracing::info!(
            key = %key,
            amount = %intent.amount,
            asset = %intent.asset,
            destination = %intent.destination_address,
            session = %intent.source_session_id,
            "payout admitted"
        );

        let receipt = match self.dispatcher.dispatch(&intent).await {
            Ok(receipt) => receipt,
            Err(RelayError::Backend(BackendError::Ambiguous { .. })) => {
                return Ok(WebhookOutcome::Unresolved { key });
            }
            Err(e) => {
                return Ok(WebhookOutcome::Failed {
                    key,
                    reason: e.to_string(),
                });
            }
        };

        match self
            .tracker
            .await_confirmation(&key, &receipt.tx_reference)
            .await?
        {
            Confirmation::Confirmed => Ok(WebhookOutcome::Completed {
                key,
                tx_reference: receipt.tx_reference,
            }),
            Confirmation::Failed { reason } => Ok(WebhookOutcome::Failed { key, reason }),
            Confirmation::Unresolved => Ok(WebhookOutcome::Settling {
                key,
                tx_reference: receipt.tx_reference,
            }),
        }
    }

    /// Spawn the background reconciliation sweep: every `interval`,
    /// re-query the status of entries still `Dispatching` after
    /// `stale_after_secs` and finalize the resolvable ones. Entries
    /// with no transfer reference can only be resolved by an operator
    /// and are logged at error level.
    pub fn spawn_reconciliation(
        &self,
        interval: std::time::Duration,
        stale_after_secs: u64,
    ) -> tokio::task::JoinHandle<()>
    where
        B: 'static,
    {
        let backend = Arc::clone(&self.backend);
        let ledger = Arc::clone(&self.ledger);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stale = match ledger.unresolved(stale_after_secs) {
                    Ok(stale) => stale,
                    Err(e) => {
                        tracing::error!(error = %e, "reconciliation sweep failed to read ledger");
                        continue;
                    }
                };
                for entry in stale {
                    reconcile_entry(backend.as_ref(), ledger.as_ref(), &entry).await;
                }
            }
        })
    }
}

async fn reconcile_entry<B: PayoutBackend>(
    backend: &B,
    ledger: &dyn PayoutLedger,
    entry: &crate::ledger::LedgerEntry,
) {
    let key = &entry.intent.idempotency_key;
    let Some(tx_reference) = entry.tx_reference.as_deref() else {
        tracing::error!(
            key = %key,
            "unresolved payout has no transfer reference — manual reconciliation required"
        );
        return;
    };

    match backend.status(tx_reference).await {
        Ok(TransferStatus::Confirmed) => {
            if let Err(e) = ledger.mark_completed(key, tx_reference) {
                tracing::error!(key = %key, error = %e, "reconciliation finalize failed");
            } else {
                tracing::info!(key = %key, tx = %tx_reference, "reconciliation completed payout");
            }
        }
        Ok(TransferStatus::Failed { reason }) => {
            if let Err(e) = ledger.mark_failed(key, &reason) {
                tracing::error!(key = %key, error = %e, "reconciliation finalize failed");
            } else {
                tracing::error!(key = %key, reason = %reason, "reconciliation marked payout failed");
            }
        }
        Ok(TransferStatus::Pending) => {
            tracing::debug!(key = %key, tx = %tx_reference, "still pending at backend");
        }
        Err(e) => {
            tracing::warn!(key = %key, tx = %tx_reference, error = %e, "reconciliation status query failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::backend::mock::MockBackend;
    use crate::ledger::{InMemoryLedger, PayoutState};
    use crate::signature::compute_hmac;

    const SECRET: &[u8] = b"whsec_pipeline";
    const DEST: &str = "0x14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e";

    fn pipeline() -> (Arc<MockBackend>, Arc<InMemoryLedger>, PayoutPipeline<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let pipeline = PayoutPipeline::new(
            SignatureVerifier::new(SECRET.to_vec(), 300).unwrap(),
            ledger.clone() as Arc<dyn PayoutLedger>,
            Arc::clone(&backend),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(2),
            },
            ConfirmationPolicy {
                poll_interval: std::time::Duration::from_millis(1),
                deadline: std::time::Duration::from_millis(20),
            },
        );
        (backend, ledger, pipeline)
    }

    fn signed(body: &[u8]) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let payload = [now.to_string().as_bytes(), b".", body].concat();
        format!("t={now},v1={}", compute_hmac(SECRET, &payload))
    }

    fn completed_event(key: &str, amount: &str) -> Vec<u8> {
        serde_json::json!({
            "id": key,
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test",
                "metadata": {
                    "cryptoAmount": amount,
                    "cryptoType": "USDT",
                    "walletAddress": DEST,
                }
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_happy_path_end_to_end() {
        let (backend, ledger, pipeline) = pipeline();
        let body = completed_event("evt_1", "50.00");

        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Completed {
                key: "evt_1".into(),
                tx_reference: "0xmock".into()
            }
        );

        // Backend saw exactly one transfer of 50_000_000 base units.
        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (DEST.to_string(), 50_000_000, Asset::Usdt));

        let entry = ledger.get("evt_1").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Completed);
        assert_eq!(entry.tx_reference.as_deref(), Some("0xmock"));
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_is_acknowledged_without_second_payout() {
        let (backend, _ledger, pipeline) = pipeline();
        let body = completed_event("evt_1", "50.00");

        pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Duplicate {
                key: "evt_1".into(),
                admission: Admission::AlreadyCompleted
            }
        );
        assert_eq!(backend.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_creates_no_ledger_entry() {
        let (backend, ledger, pipeline) = pipeline();
        let body = completed_event("evt_1", "50.00");

        let err = pipeline
            .handle_event(&body, "t=1700000000,v1=deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Verification(_)));
        assert!(ledger.get("evt_1").unwrap().is_none());
        assert_eq!(backend.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_destination_is_normalization_error_without_entry() {
        let (backend, ledger, pipeline) = pipeline();
        let body = serde_json::json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_2",
                "metadata": { "cryptoAmount": "50.00", "cryptoType": "USDT" }
            }}
        })
        .to_string()
        .into_bytes();

        let err = pipeline.handle_event(&body, &signed(&body)).await.unwrap_err();
        assert!(matches!(err, RelayError::Normalization(_)));
        assert!(ledger.get("evt_2").unwrap().is_none());
        assert_eq!(backend.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_unhandled_category_is_acknowledged_noop() {
        let (backend, ledger, pipeline) = pipeline();
        let body = serde_json::json!({
            "id": "evt_3",
            "type": "invoice.paid",
            "data": { "object": { "id": "in_1" } }
        })
        .to_string()
        .into_bytes();

        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                kind: "invoice.paid".into()
            }
        );
        assert!(ledger.get("evt_3").unwrap().is_none());
        assert_eq!(backend.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_acknowledged_and_audited() {
        let (backend, ledger, pipeline) = pipeline();
        backend.script_transfer(Err(BackendError::Permanent("policy block".into())));
        let body = completed_event("evt_4", "10");

        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Failed { ref key, .. } if key == "evt_4"));

        let entry = ledger.get("evt_4").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("policy block"));

        // Redelivery of the failed payout: acknowledged, not re-paid.
        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Duplicate {
                key: "evt_4".into(),
                admission: Admission::AlreadyFailed
            }
        );
        assert_eq!(backend.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_finality_reports_settling() {
        let (backend, ledger, pipeline) = pipeline();
        // Status never resolves within the in-request deadline.
        for _ in 0..64 {
            backend.script_status(Ok(TransferStatus::Pending));
        }
        let body = completed_event("evt_5", "10");

        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Settling {
                key: "evt_5".into(),
                tx_reference: "0xmock".into()
            }
        );
        assert_eq!(
            ledger.get("evt_5").unwrap().unwrap().state,
            PayoutState::Dispatching
        );
    }

    #[tokio::test]
    async fn test_reconciliation_completes_stale_entry() {
        let (backend, ledger, pipeline) = pipeline();
        // Leave an entry dispatching with a recorded reference.
        for _ in 0..64 {
            backend.script_status(Ok(TransferStatus::Pending));
        }
        let body = completed_event("evt_6", "10");
        pipeline.handle_event(&body, &signed(&body)).await.unwrap();

        // Later, the backend reports the transfer confirmed.
        backend.clear_status_script();
        let entry = ledger.get("evt_6").unwrap().unwrap();
        super::reconcile_entry(backend.as_ref(), ledger.as_ref(), &entry).await;

        let entry = ledger.get("evt_6").unwrap().unwrap();
        assert_eq!(entry.state, PayoutState::Completed);
        assert_eq!(entry.tx_reference.as_deref(), Some("0xmock"));
    }

    #[tokio::test]
    async fn test_reconciliation_skips_entries_without_reference() {
        let (backend, ledger, pipeline) = pipeline();
        backend.script_transfer(Err(BackendError::Ambiguous {
            reason: "send timed out".into(),
            tx_reference: None,
        }));
        let body = completed_event("evt_7", "10");

        let outcome = pipeline.handle_event(&body, &signed(&body)).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Unresolved { key: "evt_7".into() });

        let entry = ledger.get("evt_7").unwrap().unwrap();
        super::reconcile_entry(backend.as_ref(), ledger.as_ref(), &entry).await;

        // Nothing to query: the entry must be left untouched.
        assert_eq!(
            ledger.get("evt_7").unwrap().unwrap().state,
            PayoutState::Dispatching
        );
    }
}
