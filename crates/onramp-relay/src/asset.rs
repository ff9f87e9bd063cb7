//! Payout assets and exact unit conversion.
//!
//! Amounts arrive as human-readable decimal strings (e.g. `"50.00"`)
//! and leave as an integer count of the asset's smallest unit. The
//! conversion is integer-only string arithmetic -- no f64 anywhere in
//! the pipeline, since binary floats cannot represent most decimal
//! amounts and rounding drift would under- or over-pay.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};

/// Assets the relay can pay out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "USDT")]
    Usdt,
}

impl Asset {
    /// Smallest-unit precision of the asset.
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Usdt => crate::constants::USDT_DECIMALS,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Usdt => "USDT",
        }
    }

    /// Parse a provider-supplied asset symbol. Unknown symbols are a
    /// normalization failure, not a deferred backend error.
    pub fn from_symbol(symbol: &str) -> Result<Self, RelayError> {
        match symbol {
            "USDT" => Ok(Asset::Usdt),
            other => Err(RelayError::Normalization(format!(
                "unsupported asset '{other}'"
            ))),
        }
    }

    /// Validate a destination address against this asset's grammar.
    ///
    /// USDT destinations are EVM addresses: `0x` followed by exactly
    /// 40 hex digits. Rejecting here keeps malformed addresses out of
    /// the ledger instead of deferring to a backend rejection.
    pub fn validate_address(&self, address: &str) -> Result<(), RelayError> {
        match self {
            Asset::Usdt => {
                let hex = address.strip_prefix("0x").ok_or_else(|| {
                    RelayError::Normalization(format!(
                        "destination '{address}' missing 0x prefix"
                    ))
                })?;
                if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(RelayError::Normalization(format!(
                        "destination '{address}' is not a valid {} address",
                        self.symbol()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Convert a decimal amount string to this asset's smallest unit.
    pub fn to_base_units(&self, amount: &str) -> Result<u128, RelayError> {
        to_base_units(amount, self.decimals())
    }

    /// Format a smallest-unit count back to a decimal string, with
    /// trailing fractional zeros trimmed. Exchange-style backends take
    /// display units on the wire.
    pub fn format_base_units(&self, units: u128) -> String {
        format_base_units(units, self.decimals())
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Convert a positive decimal string to an integer count of 10^-decimals
/// units. Integer-only parsing: split on the decimal point and compute
/// from the parts with checked arithmetic.
///
/// Rejects (never truncates): empty or non-numeric input, more
/// fractional digits than the asset supports, zero, and overflow.
pub fn to_base_units(amount: &str, decimals: u32) -> Result<u128, RelayError> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(RelayError::Normalization("amount is empty".to_string()));
    }
    if !amount.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return Err(RelayError::Normalization(format!(
            "amount '{amount}' contains non-numeric characters"
        )));
    }

    let (integer_part, fractional_part) = match amount.split_once('.') {
        Some((i, f)) => {
            if f.contains('.') {
                return Err(RelayError::Normalization(format!(
                    "amount '{amount}' has multiple decimal points"
                )));
            }
            (i, f)
        }
        None => (amount, ""),
    };
    if integer_part.is_empty() && fractional_part.is_empty() {
        return Err(RelayError::Normalization(format!(
            "amount '{amount}' has no digits"
        )));
    }

    // Finer precision than the asset supports is an error, not a
    // truncation -- a silently dropped digit is a silent mispayment.
    if fractional_part.len() > decimals as usize {
        return Err(RelayError::Normalization(format!(
            "amount '{amount}' exceeds {decimals} decimal places"
        )));
    }

    let integer: u128 = if integer_part.is_empty() {
        0
    } else {
        integer_part.parse().map_err(|e| {
            RelayError::Normalization(format!("amount '{amount}': integer part: {e}"))
        })?
    };
    let fractional: u128 = if fractional_part.is_empty() {
        0
    } else {
        fractional_part.parse().map_err(|e| {
            RelayError::Normalization(format!("amount '{amount}': fractional part: {e}"))
        })?
    };

    let scale = 10u128.pow(decimals - fractional_part.len() as u32);
    let multiplier = 10u128.pow(decimals);

    let units = integer
        .checked_mul(multiplier)
        .and_then(|i| fractional.checked_mul(scale).and_then(|f| i.checked_add(f)))
        .ok_or_else(|| RelayError::Normalization(format!("amount '{amount}' overflows")))?;

    if units == 0 {
        return Err(RelayError::Normalization(format!(
            "amount '{amount}' is not positive"
        )));
    }
    Ok(units)
}

/// Inverse of [`to_base_units`]: render an integer unit count as a
/// decimal string with trailing fractional zeros trimmed.
pub fn format_base_units(units: u128, decimals: u32) -> String {
    let multiplier = 10u128.pow(decimals);
    let integer = units / multiplier;
    let fractional = units % multiplier;
    if fractional == 0 {
        return integer.to_string();
    }
    let frac = format!("{fractional:0width$}", width = decimals as usize);
    format!("{integer}.{}", frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_amount() {
        assert_eq!(to_base_units("50", 6).unwrap(), 50_000_000);
    }

    #[test]
    fn test_two_decimal_amount() {
        assert_eq!(to_base_units("50.00", 6).unwrap(), 50_000_000);
    }

    #[test]
    fn test_full_precision() {
        assert_eq!(to_base_units("0.000001", 6).unwrap(), 1);
    }

    #[test]
    fn test_mixed_amount() {
        assert_eq!(to_base_units("12.345678", 6).unwrap(), 12_345_678);
    }

    #[test]
    fn test_bare_fraction() {
        assert_eq!(to_base_units(".5", 6).unwrap(), 500_000);
    }

    #[test]
    fn test_excess_precision_rejected() {
        // 7 fractional digits against a 6-decimal asset: rejected, not truncated
        assert!(to_base_units("0.0000001", 6).is_err());
        assert!(to_base_units("1.0000000", 6).is_err());
    }

    #[test]
    fn test_zero_rejected() {
        assert!(to_base_units("0", 6).is_err());
        assert!(to_base_units("0.000000", 6).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(to_base_units("", 6).is_err());
        assert!(to_base_units(".", 6).is_err());
        assert!(to_base_units("-5", 6).is_err());
        assert!(to_base_units("1e6", 6).is_err());
        assert!(to_base_units("1.2.3", 6).is_err());
        assert!(to_base_units("12abc", 6).is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(to_base_units("340282366920938463463374607431768211456", 6).is_err());
    }

    #[test]
    fn test_format_trims_zeros() {
        assert_eq!(format_base_units(50_000_000, 6), "50");
        assert_eq!(format_base_units(50_120_000, 6), "50.12");
        assert_eq!(format_base_units(1, 6), "0.000001");
    }

    #[test]
    fn test_round_trip_exact() {
        for amount in ["50.00", "0.000001", "12.345678", "999999.9", "1"] {
            let units = to_base_units(amount, 6).unwrap();
            let formatted = format_base_units(units, 6);
            assert_eq!(to_base_units(&formatted, 6).unwrap(), units);
        }
    }

    #[test]
    fn test_usdt_address_validation() {
        let asset = Asset::Usdt;
        asset
            .validate_address("0x14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e")
            .unwrap();
        assert!(asset.validate_address("14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e").is_err());
        assert!(asset.validate_address("0x14CE").is_err());
        assert!(asset
            .validate_address("0xZZCE4c8E705531c3CbDDa925b9DeE6Df37aEE48e")
            .is_err());
        assert!(asset.validate_address("").is_err());
    }

    #[test]
    fn test_unknown_symbol_rejected() {
        assert!(Asset::from_symbol("DOGE").is_err());
        assert_eq!(Asset::from_symbol("USDT").unwrap(), Asset::Usdt);
    }
}
