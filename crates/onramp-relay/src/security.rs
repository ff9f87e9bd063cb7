//! Secret comparison without timing side channels.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compare two byte strings in constant time.
///
/// Inputs are reduced to SHA-256 digests first, so the comparison
/// always runs over 32 bytes regardless of how long either input is
/// or where they first differ. The relay uses this for the metrics
/// bearer token; webhook signatures go through the `hmac` crate's own
/// constant-time `verify_slice` instead.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}
