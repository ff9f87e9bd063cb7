//! Environment-driven server configuration.
//!
//! Secrets (webhook signing secret, custody key, exchange credentials)
//! are loaded once at startup and never logged. Missing required
//! secrets are a refusal to start, not a per-request failure.

use relay::constants;

/// Which payout backend settles transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Direct ERC-20 transfer from a custody wallet.
    Chain,
    /// Exchange withdrawal API.
    Exchange,
}

#[derive(Clone)]
pub struct RelayConfig {
    pub webhook_secret: Vec<u8>,
    pub signature_tolerance_secs: u64,

    pub backend: BackendKind,
    // Chain backend
    pub custody_private_key: Option<String>,
    pub rpc_url: String,
    pub token_contract: String,
    pub min_confirmations: u64,
    // Exchange backend
    pub exchange_api_url: String,
    pub exchange_api_key: Option<String>,
    pub exchange_api_secret: Option<Vec<u8>>,

    pub ledger_db_path: String,

    pub checkout_secret_key: Option<String>,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,

    pub max_dispatch_attempts: u32,
    pub confirmation_poll_secs: u64,
    pub confirmation_deadline_secs: u64,
    pub reconcile_interval_secs: u64,

    pub port: u16,
    pub rate_limit_rpm: u64,
    pub allowed_origins: Vec<String>,
    pub metrics_token: Option<Vec<u8>>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RelayConfig {
    /// Load configuration from the environment.
    ///
    /// Exits the process when the webhook secret is missing: running
    /// without it means every delivery fails verification and the
    /// operator sees only a stream of 400s.
    pub fn from_env() -> Self {
        let webhook_secret = match std::env::var("WEBHOOK_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
        {
            Some(secret) => secret.into_bytes(),
            None => {
                tracing::error!(
                    "WEBHOOK_SIGNING_SECRET is required — it is the webhook endpoint's \
                     only authentication. Copy it from the payment provider dashboard."
                );
                std::process::exit(1);
            }
        };

        let backend = match std::env::var("PAYOUT_BACKEND").as_deref() {
            Ok("exchange") => BackendKind::Exchange,
            Ok("chain") | Err(_) => BackendKind::Chain,
            Ok(other) => {
                tracing::error!("unknown PAYOUT_BACKEND '{other}' (expected 'chain' or 'exchange')");
                std::process::exit(1);
            }
        };

        let allowed_origins: Vec<String> = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            webhook_secret,
            signature_tolerance_secs: env_or(
                "SIGNATURE_TOLERANCE_SECS",
                constants::SIGNATURE_TOLERANCE_SECS,
            ),
            backend,
            custody_private_key: std::env::var("CUSTODY_PRIVATE_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            rpc_url: std::env::var("RPC_URL").unwrap_or_else(|_| constants::RPC_URL.to_string()),
            token_contract: std::env::var("USDT_CONTRACT")
                .unwrap_or_else(|_| constants::USDT_CONTRACT.to_string()),
            min_confirmations: env_or("MIN_CONFIRMATIONS", constants::MIN_CONFIRMATIONS),
            exchange_api_url: std::env::var("EXCHANGE_API_URL")
                .unwrap_or_else(|_| "https://api.binance.com".to_string()),
            exchange_api_key: std::env::var("EXCHANGE_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            exchange_api_secret: std::env::var("EXCHANGE_API_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(String::into_bytes),
            ledger_db_path: std::env::var("LEDGER_DB_PATH")
                .unwrap_or_else(|_| "./onramp-ledger.db".to_string()),
            checkout_secret_key: std::env::var("STRIPE_SECRET_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "https://example.com/success".to_string()),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "https://example.com/cancel".to_string()),
            max_dispatch_attempts: env_or("MAX_DISPATCH_ATTEMPTS", 3),
            confirmation_poll_secs: env_or("CONFIRMATION_POLL_SECS", 3),
            confirmation_deadline_secs: env_or("CONFIRMATION_DEADLINE_SECS", 60),
            reconcile_interval_secs: env_or("RECONCILE_INTERVAL_SECS", 60),
            port: std::env::var("RELAY_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            rate_limit_rpm: env_or("RATE_LIMIT_RPM", 120),
            allowed_origins,
            metrics_token: std::env::var("METRICS_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(String::into_bytes),
        }
    }

    pub fn retry_policy(&self) -> relay::RetryPolicy {
        relay::RetryPolicy {
            max_attempts: self.max_dispatch_attempts,
            ..relay::RetryPolicy::default()
        }
    }

    pub fn confirmation_policy(&self) -> relay::ConfirmationPolicy {
        relay::ConfirmationPolicy {
            poll_interval: std::time::Duration::from_secs(self.confirmation_poll_secs),
            deadline: std::time::Duration::from_secs(self.confirmation_deadline_secs),
        }
    }
}
