use thiserror::Error;

/// Errors returned by relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signature verification failed: {0}")]
    Verification(String),

    #[error("invalid payout intent: {0}")]
    Normalization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Failure taxonomy for payout backend calls. The dispatcher's retry
/// behavior keys off the variant, so classification matters:
/// a misclassified permanent error burns retry budget, a misclassified
/// ambiguous one risks a duplicate transfer.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network or node unavailability. Eligible for bounded retry.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Rejected by the backend (insufficient balance, bad address,
    /// policy block). Never retried.
    #[error("permanent backend failure: {0}")]
    Permanent(String),

    /// The submission timed out with the backend outcome unknown.
    /// Must be resolved via a status query, never by resubmission.
    #[error("ambiguous outcome: {reason}")]
    Ambiguous {
        reason: String,
        /// Transfer reference, when the submission got far enough to
        /// produce one before the timeout.
        tx_reference: Option<String>,
    },
}

/// Errors from the idempotency ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no ledger entry for key '{0}'")]
    NotFound(String),

    /// A transition was attempted on an entry already in a terminal
    /// state. Guards late or duplicate callbacks from mutating a
    /// finalized record.
    #[error("ledger entry '{0}' is already finalized")]
    AlreadyFinalized(String),

    #[error("ledger storage error: {0}")]
    Storage(String),
}
