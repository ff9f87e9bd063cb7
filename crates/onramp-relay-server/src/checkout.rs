//! Checkout-session creation against the payment provider's REST API.
//!
//! The session carries the payout parameters in its metadata so the
//! completion webhook is self-contained.

use relay::asset::{to_base_units, Asset};
use relay::error::{BackendError, RelayError};
use serde::Deserialize;
use tracing::info;

const SESSIONS_URL: &str = "https://api.stripe.com/v1/checkout/sessions";

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

/// Result of creating a hosted checkout session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

pub struct CheckoutClient {
    http: reqwest::Client,
    secret_key: String,
    success_url: String,
    cancel_url: String,
}

impl CheckoutClient {
    pub fn new(secret_key: String, success_url: String, cancel_url: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            secret_key,
            success_url,
            cancel_url,
        }
    }

    /// Create a hosted checkout session charging `fiat_amount` USD for
    /// a payout of `crypto_amount` of `asset` to `wallet_address`.
    ///
    /// Both amounts are validated before any request leaves the
    /// process; a fiat amount with sub-cent precision is rejected
    /// rather than rounded.
    pub async fn create_session(
        &self,
        fiat_amount: &str,
        crypto_amount: &str,
        asset: Asset,
        wallet_address: &str,
    ) -> Result<CheckoutSession, RelayError> {
        let cents = to_base_units(fiat_amount, 2)?;
        asset.to_base_units(crypto_amount)?;
        asset.validate_address(wallet_address)?;

        let cents = cents.to_string();
        let product_name = format!("{} Purchase", asset.symbol());
        let form: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("line_items[0][price_data][currency]", "usd"),
            ("line_items[0][price_data][product_data][name]", &product_name),
            ("line_items[0][price_data][unit_amount]", &cents),
            ("line_items[0][quantity]", "1"),
            ("success_url", &self.success_url),
            ("cancel_url", &self.cancel_url),
            ("metadata[cryptoAmount]", crypto_amount),
            ("metadata[cryptoType]", asset.symbol()),
            ("metadata[walletAddress]", wallet_address),
        ];

        let response = self
            .http
            .post(SESSIONS_URL)
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("checkout request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Permanent(format!(
                "checkout session rejected: {status}: {body}"
            ))
            .into());
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("checkout response malformed: {e}")))?;

        info!(session_id = %session.id, "checkout session created");
        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }
}
