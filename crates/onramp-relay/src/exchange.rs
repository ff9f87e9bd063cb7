//! Exchange withdrawal backend.
//!
//! The alternate payout path: instead of signing an on-chain transfer
//! from a custody wallet, ask an exchange to withdraw from the service
//! account to the destination address. Requests are authenticated with
//! an API key header and an HMAC-SHA256 signature over the query
//! string. Amounts go over the wire in display units.

use serde::Deserialize;

use crate::asset::Asset;
use crate::backend::{PayoutBackend, TransferReceipt, TransferStatus};
use crate::error::BackendError;
use crate::signature::compute_hmac;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";

pub struct ExchangeBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct WithdrawResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WithdrawRecord {
    id: String,
    status: i64,
    #[serde(default)]
    info: Option<String>,
}

impl ExchangeBackend {
    pub fn new(base_url: String, api_key: String, api_secret: Vec<u8>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    /// Append the HMAC signature the exchange expects over the query
    /// string.
    fn sign_query(&self, query: &str) -> String {
        let signature = compute_hmac(&self.api_secret, query.as_bytes());
        format!("{query}&signature={signature}")
    }

    fn timestamp_ms() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    async fn read_error(response: reqwest::Response) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            BackendError::Transient(format!("exchange returned {status}: {body}"))
        } else {
            // 4xx: the exchange rejected the instruction (bad address,
            // insufficient balance, withdrawal suspended). Retrying the
            // identical request cannot succeed.
            BackendError::Permanent(format!("exchange rejected withdrawal ({status}): {body}"))
        }
    }
}

/// Map the exchange's numeric withdrawal status. Terminal-negative
/// codes: 1 cancelled, 3 rejected, 5 failure. 6 is completed;
/// everything else is still moving through review/processing.
fn map_withdraw_status(status: i64, info: Option<&str>) -> TransferStatus {
    match status {
        6 => TransferStatus::Confirmed,
        1 | 3 | 5 => TransferStatus::Failed {
            reason: info
                .map(str::to_string)
                .unwrap_or_else(|| format!("withdrawal status {status}")),
        },
        _ => TransferStatus::Pending,
    }
}

impl PayoutBackend for ExchangeBackend {
    async fn transfer(
        &self,
        destination: &str,
        base_units: u128,
        asset: Asset,
    ) -> Result<TransferReceipt, BackendError> {
        let amount = asset.format_base_units(base_units);
        let query = format!(
            "coin={}&address={destination}&amount={amount}&timestamp={}",
            asset.symbol(),
            Self::timestamp_ms()
        );
        let url = format!(
            "{}/sapi/v1/capital/withdraw/apply?{}",
            self.base_url,
            self.sign_query(&query)
        );

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    // The request may have reached the exchange; the
                    // withdrawal may exist. Only a status query can say.
                    BackendError::Ambiguous {
                        reason: format!("withdrawal request timed out: {e}"),
                        tx_reference: None,
                    }
                } else {
                    BackendError::Transient(format!("withdrawal request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let parsed: WithdrawResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("undecodable withdrawal response: {e}")))?;

        tracing::info!(
            withdrawal = %parsed.id,
            amount = %amount,
            asset = %asset,
            "withdrawal accepted by exchange"
        );
        Ok(TransferReceipt {
            tx_reference: parsed.id,
        })
    }

    async fn status(&self, tx_reference: &str) -> Result<TransferStatus, BackendError> {
        let query = format!("timestamp={}", Self::timestamp_ms());
        let url = format!(
            "{}/sapi/v1/capital/withdraw/history?{}",
            self.base_url,
            self.sign_query(&query)
        );

        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("history request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let records: Vec<WithdrawRecord> = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("undecodable history response: {e}")))?;

        match records.iter().find(|r| r.id == tx_reference) {
            Some(record) => Ok(map_withdraw_status(record.status, record.info.as_deref())),
            // Not visible yet; history lags behind accepted withdrawals.
            None => Ok(TransferStatus::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_query_appends_hmac() {
        let backend =
            ExchangeBackend::new("https://api.example.com".into(), "key".into(), b"secret".to_vec());
        let signed = backend.sign_query("coin=USDT&amount=50");
        let expected = compute_hmac(b"secret", b"coin=USDT&amount=50");
        assert_eq!(signed, format!("coin=USDT&amount=50&signature={expected}"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend =
            ExchangeBackend::new("https://api.example.com/".into(), "key".into(), b"s".to_vec());
        assert_eq!(backend.base_url, "https://api.example.com");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_withdraw_status(6, None), TransferStatus::Confirmed);
        assert_eq!(map_withdraw_status(0, None), TransferStatus::Pending);
        assert_eq!(map_withdraw_status(2, None), TransferStatus::Pending);
        assert_eq!(map_withdraw_status(4, None), TransferStatus::Pending);
        assert!(matches!(
            map_withdraw_status(5, Some("network busy")),
            TransferStatus::Failed { reason } if reason == "network busy"
        ));
        assert!(matches!(
            map_withdraw_status(3, None),
            TransferStatus::Failed { .. }
        ));
    }
}
