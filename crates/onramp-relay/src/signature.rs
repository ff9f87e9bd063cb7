//! Webhook signature verification.
//!
//! The payment provider signs each delivery with HMAC-SHA256 over
//! `"{timestamp}.{raw_body}"` and sends the result in a header of the
//! form `t=1492774577,v1=<hex>`. Verification MUST run over the exact
//! raw bytes received -- a re-serialized body has a different byte
//! layout and the MAC comparison fails.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// A webhook body whose signature and timestamp have been verified.
/// Constructed only by [`SignatureVerifier::verify`], so downstream
/// code can require proof of verification in the type.
#[derive(Debug)]
pub struct VerifiedEvent<'a> {
    raw: &'a [u8],
}

impl<'a> VerifiedEvent<'a> {
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }
}

/// Verifies provider webhook signatures against a shared secret.
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: u64,
}

impl SignatureVerifier {
    /// Create a verifier. An empty secret is a fatal configuration
    /// error: every request would fail verification and the operator
    /// would see only a stream of 400s.
    pub fn new(secret: Vec<u8>, tolerance_secs: u64) -> Result<Self, RelayError> {
        if secret.is_empty() {
            return Err(RelayError::Config(
                "webhook signing secret is empty".to_string(),
            ));
        }
        Ok(Self {
            secret,
            tolerance_secs,
        })
    }

    /// Verify the signature header against the raw body.
    pub fn verify<'a>(
        &self,
        raw_body: &'a [u8],
        header: &str,
    ) -> Result<VerifiedEvent<'a>, RelayError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| RelayError::Config(format!("system time error: {e}")))?
            .as_secs();
        self.verify_at(raw_body, header, now)
    }

    /// Verification with an injected clock. Exposed for tests.
    pub fn verify_at<'a>(
        &self,
        raw_body: &'a [u8],
        header: &str,
        now: u64,
    ) -> Result<VerifiedEvent<'a>, RelayError> {
        let (timestamp, candidates) = parse_header(header)?;

        let skew = now.abs_diff(timestamp);
        if skew > self.tolerance_secs {
            return Err(RelayError::Verification(format!(
                "timestamp outside tolerance window ({skew}s skew, max {}s)",
                self.tolerance_secs
            )));
        }

        // Signed payload is "{t}.{body}" over the raw bytes.
        for candidate in &candidates {
            let mut mac = HmacSha256::new_from_slice(&self.secret)
                .expect("HMAC accepts any key length");
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(raw_body);

            // Decode hex first -- if invalid, compare against zeros to
            // keep the comparison constant-time. verify_slice itself is
            // constant-time.
            let expected = hex::decode(candidate).unwrap_or_else(|_| vec![0u8; 32]);
            if mac.verify_slice(&expected).is_ok() {
                return Ok(VerifiedEvent { raw: raw_body });
            }
        }

        Err(RelayError::Verification(
            "no matching signature".to_string(),
        ))
    }
}

/// Parse `t=...,v1=...[,v1=...]`. Multiple v1 entries are allowed
/// (the provider sends several during secret rotation).
fn parse_header(header: &str) -> Result<(u64, Vec<&str>), RelayError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<u64>().map_err(|e| {
                    RelayError::Verification(format!("invalid timestamp '{value}': {e}"))
                })?);
            }
            Some(("v1", value)) => candidates.push(value),
            // Unknown schemes (e.g. v0) are ignored per the provider docs.
            Some(_) => {}
            None => {
                return Err(RelayError::Verification(format!(
                    "malformed signature header element '{part}'"
                )));
            }
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| RelayError::Verification("missing timestamp element".to_string()))?;
    if candidates.is_empty() {
        return Err(RelayError::Verification(
            "missing v1 signature element".to_string(),
        ));
    }
    Ok((timestamp, candidates))
}

/// Compute HMAC-SHA256 over `body` and return the hex-encoded MAC.
/// Also used by the exchange backend to sign API requests.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        })
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test_secret";

    fn sign(timestamp: u64, body: &[u8]) -> String {
        let payload = [timestamp.to_string().as_bytes(), b".", body].concat();
        format!("t={timestamp},v1={}", compute_hmac(SECRET, &payload))
    }

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET.to_vec(), 300).unwrap()
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(1_700_000_000, body);
        let verified = verifier().verify_at(body, &header, 1_700_000_000).unwrap();
        assert_eq!(verified.raw(), body);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = sign(1_700_000_000, b"original");
        assert!(verifier()
            .verify_at(b"tampered", &header, 1_700_000_000)
            .is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"body";
        let payload = [b"1700000000.".as_slice(), body].concat();
        let header = format!("t=1700000000,v1={}", compute_hmac(b"other", &payload));
        assert!(verifier().verify_at(body, &header, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = b"body";
        let header = sign(1_700_000_000, body);
        assert!(verifier().verify_at(body, &header, 1_700_000_301).is_err());
        // Future skew is rejected symmetrically
        let future = sign(1_700_000_301, body);
        assert!(verifier().verify_at(body, &future, 1_700_000_000).is_err());
    }

    #[test]
    fn test_skew_within_tolerance_accepted() {
        let body = b"body";
        let header = sign(1_700_000_000, body);
        assert!(verifier().verify_at(body, &header, 1_700_000_299).is_ok());
    }

    #[test]
    fn test_second_v1_candidate_accepted() {
        let body = b"body";
        let payload = [b"1700000000.".as_slice(), body].concat();
        let good = compute_hmac(SECRET, &payload);
        let header = format!("t=1700000000,v1={},v1={good}", "ab".repeat(32));
        assert!(verifier().verify_at(body, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let v = verifier();
        assert!(v.verify_at(b"body", "", 0).is_err());
        assert!(v.verify_at(b"body", "t=abc,v1=00", 0).is_err());
        assert!(v.verify_at(b"body", "v1=00", 0).is_err());
        assert!(v.verify_at(b"body", "t=1700000000", 1_700_000_000).is_err());
        assert!(v.verify_at(b"body", "garbage", 0).is_err());
    }

    #[test]
    fn test_invalid_hex_signature_rejected() {
        let v = verifier();
        assert!(v
            .verify_at(b"body", "t=1700000000,v1=not-hex-zz", 1_700_000_000)
            .is_err());
    }

    #[test]
    fn test_empty_secret_is_config_error() {
        assert!(matches!(
            SignatureVerifier::new(Vec::new(), 300),
            Err(RelayError::Config(_))
        ));
    }
}
