use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::chain::ChainBackend;
use relay::exchange::ExchangeBackend;
use relay::ledger::{PayoutLedger, SqliteLedger};
use relay::pipeline::PayoutPipeline;
use relay::signature::SignatureVerifier;

use onramp_relay_server::checkout::CheckoutClient;
use onramp_relay_server::config::{BackendKind, RelayConfig};
use onramp_relay_server::routes;
use onramp_relay_server::state::{AppState, RelayBackend};

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "stripe-signature"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "stripe-signature"])
            .max_age(3600)
    }
}

fn build_backend(config: &RelayConfig) -> RelayBackend {
    match config.backend {
        BackendKind::Chain => {
            let key = match &config.custody_private_key {
                Some(key) => key,
                None => {
                    tracing::error!(
                        "CUSTODY_PRIVATE_KEY is required for the chain backend. \
                         Set PAYOUT_BACKEND=exchange to use exchange withdrawals instead."
                    );
                    std::process::exit(1);
                }
            };
            let signer: PrivateKeySigner = key.parse().expect("invalid CUSTODY_PRIVATE_KEY");
            let custody_address = signer.address();

            let token: Address = config.token_contract.parse().expect("invalid USDT_CONTRACT");

            let provider = ProviderBuilder::new()
                .wallet(alloy::network::EthereumWallet::from(signer))
                .connect_http(config.rpc_url.parse().expect("invalid RPC_URL"));

            tracing::info!("Payout backend: chain (custody {custody_address}, token {token})");
            RelayBackend::Chain(ChainBackend::new(provider, token, config.min_confirmations))
        }
        BackendKind::Exchange => {
            let (api_key, api_secret) =
                match (&config.exchange_api_key, &config.exchange_api_secret) {
                    (Some(key), Some(secret)) => (key.clone(), secret.clone()),
                    _ => {
                        tracing::error!(
                            "EXCHANGE_API_KEY and EXCHANGE_API_SECRET are required for the \
                             exchange backend"
                        );
                        std::process::exit(1);
                    }
                };
            tracing::info!("Payout backend: exchange at {}", config.exchange_api_url);
            RelayBackend::Exchange(ExchangeBackend::new(
                config.exchange_api_url.clone(),
                api_key,
                api_secret,
            ))
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env();

    let verifier = match SignatureVerifier::new(
        config.webhook_secret.clone(),
        config.signature_tolerance_secs,
    ) {
        Ok(verifier) => verifier,
        Err(e) => {
            tracing::error!("invalid webhook verifier configuration: {e}");
            std::process::exit(1);
        }
    };

    // The ledger is the double-payment guard. Do not fall back to
    // in-memory storage: a restart would forget completed payouts and
    // a redelivered webhook would pay the same customer twice.
    let ledger: Arc<dyn PayoutLedger> = match SqliteLedger::open(&config.ledger_db_path) {
        Ok(ledger) => {
            tracing::info!("Payout ledger: SQLite at {}", config.ledger_db_path);
            Arc::new(ledger)
        }
        Err(e) => {
            tracing::error!(
                "Failed to open SQLite ledger at {}: {e}",
                config.ledger_db_path
            );
            tracing::error!("Refusing to start — a volatile ledger would permit double payouts");
            std::process::exit(1);
        }
    };

    let backend = Arc::new(build_backend(&config));
    let backend_kind = backend.kind();

    let pipeline = PayoutPipeline::new(
        verifier,
        ledger,
        backend,
        config.retry_policy(),
        config.confirmation_policy(),
    );

    // Background sweep for payouts stuck in DISPATCHING (process died
    // mid-flight, or finality outlasted the in-request deadline).
    let _reconciler = pipeline.spawn_reconciliation(
        Duration::from_secs(config.reconcile_interval_secs),
        config.confirmation_deadline_secs,
    );

    let checkout = config.checkout_secret_key.clone().map(|secret| {
        CheckoutClient::new(
            secret,
            config.checkout_success_url.clone(),
            config.checkout_cancel_url.clone(),
        )
    });
    if checkout.is_none() {
        tracing::info!("STRIPE_SECRET_KEY not set — /create-checkout-session disabled");
    }

    if config.metrics_token.is_none() {
        tracing::warn!("METRICS_TOKEN not set — /metrics requires RELAY_PUBLIC_METRICS=true");
    }

    let state = web::Data::new(AppState {
        pipeline,
        backend_kind,
        checkout,
        metrics_token: config.metrics_token.clone(),
    });

    let port = config.port;
    let rate_limit_rpm = config.rate_limit_rpm;
    let cors_origins = config.allowed_origins.clone();

    tracing::info!("Onramp relay listening on port {port}");
    tracing::info!("Rate limit: {rate_limit_rpm} req/min per IP");
    tracing::info!("  POST http://localhost:{port}/stripe-webhook");
    tracing::info!("  POST http://localhost:{port}/create-checkout-session");

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .app_data(web::PayloadConfig::new(65_536))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::stripe_webhook)
            .service(routes::create_checkout_session)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
