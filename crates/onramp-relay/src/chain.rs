//! On-chain payout backend: direct ERC-20 `transfer` from a custody
//! wallet.
//!
//! The custody key never appears here -- it lives inside the alloy
//! provider's wallet filler, injected at construction. Submission and
//! finality are split: `transfer` returns as soon as the node accepts
//! the transaction, and the confirmation tracker polls [`status`]
//! until the receipt has enough confirmations.

use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;
use alloy::sol;

use crate::asset::Asset;
use crate::backend::{PayoutBackend, TransferReceipt, TransferStatus};
use crate::error::BackendError;

sol! {
    #[sol(rpc)]
    interface ERC20 {
        function transfer(address to, uint256 value) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
    }
}

/// ERC-20 transfer backend over an alloy provider with a wallet filler.
pub struct ChainBackend<P> {
    provider: P,
    token: Address,
    min_confirmations: u64,
    send_timeout: std::time::Duration,
}

impl<P> ChainBackend<P> {
    pub fn new(provider: P, token: Address, min_confirmations: u64) -> Self {
        Self {
            provider,
            token,
            min_confirmations,
            send_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_send_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

impl<P> ChainBackend<P>
where
    P: Provider + Send + Sync,
{
    /// Check RPC connectivity by fetching the latest block number.
    pub async fn health_check(&self) -> Result<u64, BackendError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| BackendError::Transient(format!("health check failed: {e}")))
    }

    /// Custody wallet balance of the payout token, in base units.
    pub async fn custody_balance(&self, custody: Address) -> Result<U256, BackendError> {
        ERC20::new(self.token, &self.provider)
            .balanceOf(custody)
            .call()
            .await
            .map_err(|e| BackendError::Transient(format!("balanceOf failed: {e}")))
    }
}

/// Classify a node error message. Rejections the node will repeat on
/// every attempt are permanent; connectivity problems are transient.
fn classify_send_error(message: &str) -> BackendError {
    let lower = message.to_ascii_lowercase();
    let permanent = ["insufficient funds", "exceeds balance", "reverted", "invalid sender"]
        .iter()
        .any(|needle| lower.contains(needle));
    if permanent {
        BackendError::Permanent(message.to_string())
    } else {
        BackendError::Transient(message.to_string())
    }
}

impl<P> PayoutBackend for ChainBackend<P>
where
    P: Provider + Send + Sync,
{
    async fn transfer(
        &self,
        destination: &str,
        base_units: u128,
        asset: Asset,
    ) -> Result<TransferReceipt, BackendError> {
        let to: Address = destination
            .parse()
            .map_err(|e| BackendError::Permanent(format!("invalid destination: {e}")))?;
        let value = U256::from(base_units);

        let contract = ERC20::new(self.token, &self.provider);

        // Timeout on send(): past this point the node may or may not
        // hold the transaction, which is exactly the ambiguous case
        // the dispatcher must never resolve by resubmitting.
        let pending = tokio::time::timeout(self.send_timeout, contract.transfer(to, value).send())
            .await
            .map_err(|_| BackendError::Ambiguous {
                reason: format!(
                    "transfer send timed out after {}s",
                    self.send_timeout.as_secs()
                ),
                tx_reference: None,
            })?
            .map_err(|e| classify_send_error(&e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        tracing::info!(
            token = %self.token,
            to = %to,
            amount = %value,
            asset = %asset,
            tx = %tx_hash,
            "transfer submitted"
        );
        Ok(TransferReceipt {
            tx_reference: format!("{tx_hash}"),
        })
    }

    async fn status(&self, tx_reference: &str) -> Result<TransferStatus, BackendError> {
        let hash: TxHash = tx_reference
            .parse()
            .map_err(|e| BackendError::Permanent(format!("invalid tx reference: {e}")))?;

        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| BackendError::Transient(format!("receipt query failed: {e}")))?;

        let Some(receipt) = receipt else {
            // Not mined (or not yet visible to this node). Unresolved
            // is not failure.
            return Ok(TransferStatus::Pending);
        };

        if !receipt.status() {
            return Ok(TransferStatus::Failed {
                reason: "transfer reverted".to_string(),
            });
        }

        let Some(mined_in) = receipt.block_number else {
            return Ok(TransferStatus::Pending);
        };
        let latest = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| BackendError::Transient(format!("block number query failed: {e}")))?;

        let confirmations = latest.saturating_sub(mined_in) + 1;
        if confirmations >= self.min_confirmations {
            Ok(TransferStatus::Confirmed)
        } else {
            Ok(TransferStatus::Pending)
        }
    }
}
