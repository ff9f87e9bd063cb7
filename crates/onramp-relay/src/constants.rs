use alloy::primitives::{address, Address};

/// USDT token contract on the configured network (original deployment
/// target was a Goerli test token; override via `USDT_CONTRACT`).
pub const USDT_CONTRACT: Address = address!("14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e");

/// USDT has 6 decimal places.
pub const USDT_DECIMALS: u32 = 6;

/// Default RPC endpoint.
pub const RPC_URL: &str = "https://ethereum-goerli-rpc.publicnode.com";

/// Default signature timestamp tolerance in seconds. Matches the
/// payment provider's documented recommendation.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Default confirmations required before a transfer counts as final.
pub const MIN_CONFIRMATIONS: u64 = 1;
