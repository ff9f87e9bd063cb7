//! Provider event decoding and payout-intent normalization.
//!
//! The decode is fail-closed: every field a payout depends on is an
//! `Option` in the wire structs and an explicit error if absent. The
//! provider's payloads are dynamically shaped, so optimistic field
//! access would turn a provider-side schema drift into a silent
//! mispayment.

use serde::Deserialize;

use crate::asset::Asset;
use crate::error::RelayError;
use crate::signature::VerifiedEvent;

/// Event category that triggers a payout. Everything else is
/// acknowledged without action so the provider stops redelivering.
pub const PAYMENT_COMPLETED: &str = "checkout.session.completed";

/// Raw provider event envelope.
#[derive(Debug, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: CheckoutSession,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

/// Session metadata written at checkout-session creation time. Every
/// field is optional on the wire; normalization requires all of them.
#[derive(Debug, Default, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "cryptoAmount")]
    pub crypto_amount: Option<String>,
    #[serde(rename = "cryptoType")]
    pub crypto_type: Option<String>,
    #[serde(rename = "walletAddress")]
    pub wallet_address: Option<String>,
}

/// Normalized, immutable payout instruction. Every field is non-empty
/// and the amount is a positive decimal within the asset's precision;
/// an intent with any missing field is never constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutIntent {
    /// Provider event identifier; globally unique, keys the ledger.
    pub idempotency_key: String,
    /// Human-unit decimal amount, validated at normalization.
    pub amount: String,
    pub asset: Asset,
    pub destination_address: String,
    pub source_session_id: String,
}

/// Output of normalization: either a payout to run, or an event
/// category we acknowledge and ignore.
#[derive(Debug)]
pub enum NormalizedEvent {
    Payout(PayoutIntent),
    Ignored { kind: String },
}

/// Decode a verified webhook body and extract the payout intent.
///
/// Only [`PAYMENT_COMPLETED`] events are eligible. A completed payment
/// with missing or malformed metadata is an error (surfaced as a 4xx),
/// never a silent drop: money was taken and no payout instruction can
/// be recovered from the event.
pub fn normalize(event: &VerifiedEvent<'_>) -> Result<NormalizedEvent, RelayError> {
    let parsed: ProviderEvent = serde_json::from_slice(event.raw())
        .map_err(|e| RelayError::Normalization(format!("undecodable event payload: {e}")))?;

    if parsed.kind != PAYMENT_COMPLETED {
        tracing::debug!(kind = %parsed.kind, event = %parsed.id, "ignoring event category");
        return Ok(NormalizedEvent::Ignored { kind: parsed.kind });
    }

    let session = &parsed.data.object;
    let meta = &session.metadata;

    let amount = require(&meta.crypto_amount, "cryptoAmount", &parsed.id)?;
    let symbol = require(&meta.crypto_type, "cryptoType", &parsed.id)?;
    let destination = require(&meta.wallet_address, "walletAddress", &parsed.id)?;

    let asset = Asset::from_symbol(symbol)?;
    asset.validate_address(destination)?;
    // Validate amount grammar and positivity up front; the dispatcher
    // re-derives the base units right before the transfer.
    asset.to_base_units(amount)?;

    if parsed.id.is_empty() || session.id.is_empty() {
        return Err(RelayError::Normalization(
            "event or session id is empty".to_string(),
        ));
    }

    Ok(NormalizedEvent::Payout(PayoutIntent {
        idempotency_key: parsed.id.clone(),
        amount: amount.to_string(),
        asset,
        destination_address: destination.to_string(),
        source_session_id: session.id.clone(),
    }))
}

fn require<'a>(
    field: &'a Option<String>,
    name: &str,
    event_id: &str,
) -> Result<&'a str, RelayError> {
    match field.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(RelayError::Normalization(format!(
            "event '{event_id}' missing metadata field '{name}'"
        ))),
    }
}
