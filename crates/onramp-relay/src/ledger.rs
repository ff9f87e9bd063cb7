//! Idempotency ledger: the sole defense against double payouts.
//!
//! Webhook-style delivery retries on any non-2xx or timeout, so the
//! same payment event can arrive many times, including concurrently.
//! Admission is an atomic check-and-insert keyed by the provider's
//! event id: exactly one delivery wins `Accepted`, every other one is
//! told what already happened. Entries are append-only audit records;
//! they are finalized, never deleted.

use dashmap::DashMap;
use std::sync::Mutex;

use crate::error::LedgerError;
use crate::event::PayoutIntent;

/// Per-entry payout state machine: `Pending -> Dispatching ->
/// {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutState {
    Pending,
    Dispatching,
    Completed,
    Failed,
}

impl PayoutState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutState::Completed | PayoutState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutState::Pending => "pending",
            PayoutState::Dispatching => "dispatching",
            PayoutState::Completed => "completed",
            PayoutState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(PayoutState::Pending),
            "dispatching" => Ok(PayoutState::Dispatching),
            "completed" => Ok(PayoutState::Completed),
            "failed" => Ok(PayoutState::Failed),
            other => Err(LedgerError::Storage(format!("unknown state '{other}'"))),
        }
    }
}

/// One payout's audit record, keyed by the intent's idempotency key.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub intent: PayoutIntent,
    pub state: PayoutState,
    pub tx_reference: Option<String>,
    pub created_at: i64,
    pub finalized_at: Option<i64>,
    pub failure_reason: Option<String>,
}

/// Result of the atomic admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No prior entry: a `Pending` entry was created, caller owns the payout.
    Accepted,
    /// An entry exists and is not terminal; another delivery owns it.
    InProgress,
    /// The payout already completed. Treat as success, never re-pay.
    AlreadyCompleted,
    /// The payout terminally failed. Acknowledged; resolution is an
    /// operator action, not an automatic retry.
    AlreadyFailed,
}

/// Ledger storage backends. Implementations must be thread-safe and
/// `admit` must be linearizable per key: two concurrent admissions of
/// the same key must not both return `Accepted`.
pub trait PayoutLedger: Send + Sync {
    /// Atomic check-and-insert for an intent.
    fn admit(&self, intent: &PayoutIntent) -> Result<Admission, LedgerError>;

    /// Transition `Pending -> Dispatching`. Must happen before the
    /// backend call. Errors with [`LedgerError::AlreadyFinalized`] on
    /// terminal entries.
    fn mark_dispatching(&self, key: &str) -> Result<(), LedgerError>;

    /// Attach the backend's transfer reference to a still-dispatching
    /// entry. Lets the reconciliation sweep query a transfer whose
    /// confirmation never arrived in-request.
    fn record_reference(&self, key: &str, tx_reference: &str) -> Result<(), LedgerError>;

    /// Finalize as `Completed`, recording the backend's transfer reference.
    fn mark_completed(&self, key: &str, tx_reference: &str) -> Result<(), LedgerError>;

    /// Finalize as `Failed`, recording the reason for audit.
    fn mark_failed(&self, key: &str, reason: &str) -> Result<(), LedgerError>;

    /// Read an entry.
    fn get(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Entries still `Dispatching` after `older_than_secs`, oldest
    /// first. Input to the reconciliation sweep; an unresolved
    /// transfer is not evidence of failure.
    fn unresolved(&self, older_than_secs: u64) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Current unix timestamp. On clock error, returns i64::MAX so a
/// misclocked entry is never swept into reconciliation prematurely.
fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_else(|_| {
            tracing::error!("system clock before UNIX epoch — using max timestamp");
            i64::MAX
        })
}

/// In-memory ledger backed by DashMap. Fast but lost on restart --
/// a restart forgets completed payouts and re-admits redeliveries.
/// Production deployments use [`SqliteLedger`].
pub struct InMemoryLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn admission_for(state: PayoutState) -> Admission {
    match state {
        PayoutState::Pending | PayoutState::Dispatching => Admission::InProgress,
        PayoutState::Completed => Admission::AlreadyCompleted,
        PayoutState::Failed => Admission::AlreadyFailed,
    }
}

impl InMemoryLedger {
    fn transition(
        &self,
        key: &str,
        apply: impl FnOnce(&mut LedgerEntry),
    ) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.to_string()))?;
        if entry.state.is_terminal() {
            return Err(LedgerError::AlreadyFinalized(key.to_string()));
        }
        apply(&mut entry);
        Ok(())
    }
}

impl PayoutLedger for InMemoryLedger {
    fn admit(&self, intent: &PayoutIntent) -> Result<Admission, LedgerError> {
        // DashMap's entry API makes check-and-insert atomic in-process.
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(intent.idempotency_key.clone()) {
            Entry::Occupied(existing) => Ok(admission_for(existing.get().state)),
            Entry::Vacant(v) => {
                v.insert(LedgerEntry {
                    intent: intent.clone(),
                    state: PayoutState::Pending,
                    tx_reference: None,
                    created_at: unix_now(),
                    finalized_at: None,
                    failure_reason: None,
                });
                Ok(Admission::Accepted)
            }
        }
    }

    fn mark_dispatching(&self, key: &str) -> Result<(), LedgerError> {
        self.transition(key, |entry| entry.state = PayoutState::Dispatching)
    }

    fn record_reference(&self, key: &str, tx_reference: &str) -> Result<(), LedgerError> {
        self.transition(key, |entry| {
            entry.tx_reference = Some(tx_reference.to_string())
        })
    }

    fn mark_completed(&self, key: &str, tx_reference: &str) -> Result<(), LedgerError> {
        self.transition(key, |entry| {
            entry.state = PayoutState::Completed;
            entry.tx_reference = Some(tx_reference.to_string());
            entry.finalized_at = Some(unix_now());
        })
    }

    fn mark_failed(&self, key: &str, reason: &str) -> Result<(), LedgerError> {
        self.transition(key, |entry| {
            entry.state = PayoutState::Failed;
            entry.failure_reason = Some(reason.to_string());
            entry.finalized_at = Some(unix_now());
        })
    }

    fn get(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    fn unresolved(&self, older_than_secs: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let cutoff = unix_now().saturating_sub(older_than_secs as i64);
        let mut stale: Vec<LedgerEntry> = self
            .entries
            .iter()
            .filter(|e| e.state == PayoutState::Dispatching && e.created_at <= cutoff)
            .map(|e| e.clone())
            .collect();
        stale.sort_by_key(|e| e.created_at);
        Ok(stale)
    }
}

/// Persistent ledger backed by SQLite. Survives restarts; the PRIMARY
/// KEY insert makes admission atomic even across processes sharing
/// the database file.
pub struct SqliteLedger {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at the given path.
    ///
    /// On Unix the file permissions are restricted to 0600; ledger
    /// rows expose payment amounts and destination wallets.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS payouts (
                idempotency_key TEXT PRIMARY KEY,
                session_id      TEXT NOT NULL,
                amount          TEXT NOT NULL,
                asset           TEXT NOT NULL,
                destination     TEXT NOT NULL,
                state           TEXT NOT NULL,
                tx_reference    TEXT,
                created_at      INTEGER NOT NULL,
                finalized_at    INTEGER,
                failure_reason  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_payouts_state ON payouts(state);
            PRAGMA journal_mode=WAL;",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set ledger database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("ledger mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
        let asset_symbol: String = row.get("asset")?;
        let state_str: String = row.get("state")?;
        let asset = crate::asset::Asset::from_symbol(&asset_symbol).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(e.to_string())),
            )
        })?;
        let state = PayoutState::parse(&state_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(e.to_string())),
            )
        })?;
        Ok(LedgerEntry {
            intent: PayoutIntent {
                idempotency_key: row.get("idempotency_key")?,
                amount: row.get("amount")?,
                asset,
                destination_address: row.get("destination")?,
                source_session_id: row.get("session_id")?,
            },
            state,
            tx_reference: row.get("tx_reference")?,
            created_at: row.get("created_at")?,
            finalized_at: row.get("finalized_at")?,
            failure_reason: row.get("failure_reason")?,
        })
    }

    /// Guarded non-terminal update. Returns AlreadyFinalized/NotFound
    /// when zero rows changed.
    fn guarded_update(
        &self,
        key: &str,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<(), LedgerError> {
        let conn = self.lock();
        let changed = conn
            .execute(sql, params)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if changed == 1 {
            return Ok(());
        }
        // Distinguish a missing entry from a terminal one.
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM payouts WHERE idempotency_key = ?1",
                [key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(LedgerError::Storage(other.to_string())),
            })?;
        match state {
            None => Err(LedgerError::NotFound(key.to_string())),
            Some(_) => Err(LedgerError::AlreadyFinalized(key.to_string())),
        }
    }
}

impl PayoutLedger for SqliteLedger {
    fn admit(&self, intent: &PayoutIntent) -> Result<Admission, LedgerError> {
        let conn = self.lock();
        // The PRIMARY KEY constraint makes this atomic at the database
        // level: exactly one concurrent insert for a key succeeds.
        let inserted = conn
            .execute(
                "INSERT INTO payouts
                    (idempotency_key, session_id, amount, asset, destination,
                     state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                rusqlite::params![
                    intent.idempotency_key,
                    intent.source_session_id,
                    intent.amount,
                    intent.asset.symbol(),
                    intent.destination_address,
                    unix_now(),
                ],
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        if inserted == 1 {
            return Ok(Admission::Accepted);
        }

        let state_str: String = conn
            .query_row(
                "SELECT state FROM payouts WHERE idempotency_key = ?1",
                [&intent.idempotency_key],
                |row| row.get(0),
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(admission_for(PayoutState::parse(&state_str)?))
    }

    fn mark_dispatching(&self, key: &str) -> Result<(), LedgerError> {
        self.guarded_update(
            key,
            "UPDATE payouts SET state = 'dispatching'
             WHERE idempotency_key = ?1 AND state IN ('pending', 'dispatching')",
            &[&key],
        )
    }

    fn record_reference(&self, key: &str, tx_reference: &str) -> Result<(), LedgerError> {
        self.guarded_update(
            key,
            "UPDATE payouts SET tx_reference = ?2
             WHERE idempotency_key = ?1 AND state IN ('pending', 'dispatching')",
            &[&key, &tx_reference],
        )
    }

    fn mark_completed(&self, key: &str, tx_reference: &str) -> Result<(), LedgerError> {
        self.guarded_update(
            key,
            "UPDATE payouts
             SET state = 'completed', tx_reference = ?2, finalized_at = ?3
             WHERE idempotency_key = ?1 AND state IN ('pending', 'dispatching')",
            &[&key, &tx_reference, &unix_now()],
        )
    }

    fn mark_failed(&self, key: &str, reason: &str) -> Result<(), LedgerError> {
        self.guarded_update(
            key,
            "UPDATE payouts
             SET state = 'failed', failure_reason = ?2, finalized_at = ?3
             WHERE idempotency_key = ?1 AND state IN ('pending', 'dispatching')",
            &[&key, &reason, &unix_now()],
        )
    }

    fn get(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM payouts WHERE idempotency_key = ?1",
            [key],
            Self::row_to_entry,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(LedgerError::Storage(other.to_string())),
        })
    }

    fn unresolved(&self, older_than_secs: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let cutoff = unix_now().saturating_sub(older_than_secs as i64);
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM payouts
                 WHERE state = 'dispatching' AND created_at <= ?1
                 ORDER BY created_at ASC",
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([cutoff], Self::row_to_entry)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }
}
