//! HTTP surface: `POST /webhook` and `GET /health`.

use crate::event::handle_event;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use prbot_adapters::Settings;
use sha2::Sha256;
use std::sync::Arc;
use tracing::Instrument;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

pub struct AppState {
    pub settings: Settings,
    pub webhook_secret: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(receive))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Check GitHub's `sha256=<hex>` signature of `body`. The comparison is
/// constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(signature_hex) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let delivery = header(&headers, DELIVERY_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let event = header(&headers, EVENT_HEADER).unwrap_or_default().to_string();

    let signature = header(&headers, SIGNATURE_HEADER).unwrap_or_default();
    if !verify_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!(%delivery, %event, "rejected webhook with invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature");
    }

    if event == "ping" {
        return (StatusCode::OK, "pong");
    }

    let span = tracing::info_span!("delivery", id = %delivery, event = %event);
    tokio::spawn(
        async move {
            match handle_event(&state.settings, &event, &body).await {
                Ok(Some(outcome)) => tracing::info!(
                    success = outcome.success,
                    comment_id = outcome.result_comment_id,
                    "command handled"
                ),
                Ok(None) => tracing::debug!("nothing to do"),
                Err(err) => tracing::error!(error = %format!("{:#}", err), "webhook handling failed"),
            }
        }
        .instrument(span),
    );

    (StatusCode::ACCEPTED, "accepted")
}
