use actix_web::{get, post, web, HttpRequest, HttpResponse};
use relay::asset::Asset;
use relay::error::RelayError;
use relay::ledger::Admission;
use relay::pipeline::WebhookOutcome;
use serde::Deserialize;

use crate::metrics;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// Fiat charge in whole currency units, e.g. "50.00".
    pub amount: String,
    pub crypto_amount: String,
    pub crypto_type: String,
    pub wallet_address: String,
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.pipeline.backend().health_check().await {
        Ok(block) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "onramp-relay",
            "backend": state.backend_kind,
            "latestBlock": block.map(|b| b.to_string()),
        })),
        Err(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "service": "onramp-relay",
            "backend": state.backend_kind,
            "error": "backend unreachable",
        })),
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| relay::security::constant_time_eq(t.as_bytes(), token))
                .unwrap_or(false);

            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            // No token configured means metrics stay protected.
            // RELAY_PUBLIC_METRICS=true opts in to unauthenticated access.
            let public_metrics = std::env::var("RELAY_PUBLIC_METRICS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
            if !public_metrics {
                return HttpResponse::Forbidden().json(serde_json::json!({
                    "error": "forbidden",
                    "message": "Set METRICS_TOKEN or RELAY_PUBLIC_METRICS=true to access /metrics"
                }));
            }
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

/// Payment-provider webhook. The body must reach the verifier as the
/// exact bytes received, so this handler takes `web::Bytes` and never
/// lets the framework deserialize first.
#[post("/stripe-webhook")]
pub async fn stripe_webhook(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    let signature = match req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(sig) => sig,
        None => {
            metrics::SIGNATURE_FAILURES
                .with_label_values(&["missing"])
                .inc();
            metrics::WEBHOOK_EVENTS.with_label_values(&["rejected"]).inc();
            tracing::warn!("webhook delivery without signature header");
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": "missing signature header"
            }));
        }
    };

    let start = std::time::Instant::now();
    match state.pipeline.handle_event(&body, signature).await {
        Ok(outcome) => {
            let elapsed = start.elapsed().as_secs_f64();
            webhook_response(outcome, elapsed)
        }
        Err(RelayError::Verification(reason)) => {
            metrics::SIGNATURE_FAILURES
                .with_label_values(&["invalid"])
                .inc();
            metrics::WEBHOOK_EVENTS.with_label_values(&["rejected"]).inc();
            tracing::warn!(reason = %reason, "webhook signature rejected");
            HttpResponse::BadRequest().json(serde_json::json!({
                "error": "signature verification failed"
            }))
        }
        Err(RelayError::Normalization(reason)) => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["rejected"]).inc();
            tracing::warn!(reason = %reason, "webhook event rejected");
            HttpResponse::BadRequest().json(serde_json::json!({
                "error": "malformed event",
                "reason": reason,
            }))
        }
        Err(e) => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["error"]).inc();
            tracing::error!(error = %e, "webhook processing error");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal error"
            }))
        }
    }
}

/// Every variant here answers 2xx: post-admission failures are the
/// relay's problem to resolve and a provider redelivery would change
/// nothing. Only pre-admission rejections answer 4xx.
fn webhook_response(outcome: WebhookOutcome, elapsed: f64) -> HttpResponse {
    match outcome {
        WebhookOutcome::Ignored { kind } => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["ignored"]).inc();
            HttpResponse::Ok().json(serde_json::json!({
                "received": true,
                "action": "ignored",
                "eventType": kind,
            }))
        }
        WebhookOutcome::Duplicate { key, admission } => {
            metrics::WEBHOOK_EVENTS
                .with_label_values(&["duplicate"])
                .inc();
            let status = match admission {
                Admission::AlreadyCompleted => "completed",
                Admission::AlreadyFailed => "failed",
                _ => "in_progress",
            };
            tracing::info!(key = %key, status, "duplicate delivery suppressed");
            HttpResponse::Ok().json(serde_json::json!({
                "received": true,
                "action": "duplicate",
                "idempotencyKey": key,
                "payoutStatus": status,
            }))
        }
        WebhookOutcome::Completed { key, tx_reference } => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["payout"]).inc();
            metrics::PAYOUTS.with_label_values(&["completed"]).inc();
            metrics::PAYOUT_LATENCY
                .with_label_values(&["completed"])
                .observe(elapsed);
            tracing::info!(key = %key, tx = %tx_reference, "payout completed");
            HttpResponse::Ok().json(serde_json::json!({
                "received": true,
                "action": "payout",
                "idempotencyKey": key,
                "payoutStatus": "completed",
                "txReference": tx_reference,
            }))
        }
        WebhookOutcome::Settling { key, tx_reference } => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["payout"]).inc();
            metrics::PAYOUTS.with_label_values(&["settling"]).inc();
            metrics::PAYOUT_LATENCY
                .with_label_values(&["settling"])
                .observe(elapsed);
            tracing::info!(key = %key, tx = %tx_reference, "payout submitted, awaiting finality");
            HttpResponse::Ok().json(serde_json::json!({
                "received": true,
                "action": "payout",
                "idempotencyKey": key,
                "payoutStatus": "settling",
                "txReference": tx_reference,
            }))
        }
        WebhookOutcome::Unresolved { key } => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["payout"]).inc();
            metrics::PAYOUTS.with_label_values(&["unresolved"]).inc();
            tracing::error!(key = %key, "payout outcome unknown, needs reconciliation");
            HttpResponse::Ok().json(serde_json::json!({
                "received": true,
                "action": "payout",
                "idempotencyKey": key,
                "payoutStatus": "unresolved",
            }))
        }
        WebhookOutcome::Failed { key, reason } => {
            metrics::WEBHOOK_EVENTS.with_label_values(&["payout"]).inc();
            metrics::PAYOUTS.with_label_values(&["failed"]).inc();
            metrics::PAYOUT_LATENCY
                .with_label_values(&["failed"])
                .observe(elapsed);
            tracing::error!(key = %key, reason = %reason, "payout failed after payment completed");
            HttpResponse::Ok().json(serde_json::json!({
                "received": true,
                "action": "payout",
                "idempotencyKey": key,
                "payoutStatus": "failed",
            }))
        }
    }
}

#[post("/create-checkout-session")]
pub async fn create_checkout_session(
    state: web::Data<AppState>,
    body: web::Json<CheckoutRequest>,
) -> HttpResponse {
    let checkout = match &state.checkout {
        Some(client) => client,
        None => {
            return HttpResponse::NotImplemented().json(serde_json::json!({
                "error": "checkout is not configured on this deployment"
            }));
        }
    };

    let asset = match Asset::from_symbol(&body.crypto_type) {
        Ok(asset) => asset,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": e.to_string()
            }));
        }
    };

    match checkout
        .create_session(&body.amount, &body.crypto_amount, asset, &body.wallet_address)
        .await
    {
        Ok(session) => HttpResponse::Ok().json(serde_json::json!({
            "id": session.id,
            "url": session.url,
        })),
        Err(RelayError::Normalization(reason)) => {
            HttpResponse::BadRequest().json(serde_json::json!({ "error": reason }))
        }
        Err(e) => {
            tracing::error!(error = %e, "checkout session creation failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "failed to create checkout session"
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_admission_outcomes_are_acknowledged() {
        // The provider must not redeliver for failures that happened
        // after the payout was admitted.
        let failed = webhook_response(
            WebhookOutcome::Failed {
                key: "evt_1".to_string(),
                reason: "retries exhausted".to_string(),
            },
            0.1,
        );
        assert!(failed.status().is_success());

        let unresolved = webhook_response(
            WebhookOutcome::Unresolved {
                key: "evt_2".to_string(),
            },
            0.1,
        );
        assert!(unresolved.status().is_success());
    }

    #[test]
    fn duplicate_reports_terminal_state() {
        let resp = webhook_response(
            WebhookOutcome::Duplicate {
                key: "evt_3".to_string(),
                admission: Admission::AlreadyCompleted,
            },
            0.0,
        );
        assert!(resp.status().is_success());
    }

    #[test]
    fn checkout_request_uses_camel_case() {
        let parsed: CheckoutRequest = serde_json::from_value(serde_json::json!({
            "amount": "50.00",
            "cryptoAmount": "50.00",
            "cryptoType": "USDT",
            "walletAddress": "0x14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e",
        }))
        .unwrap();
        assert_eq!(parsed.amount, "50.00");
        assert_eq!(parsed.crypto_type, "USDT");
    }
}
