use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use boovpn_db::{StoreError, SubscriberRepository};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::services::notification_service::NotificationService;

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Clone)]
pub struct WebhookState {
    pub repo: SubscriberRepository,
    pub notifications: NotificationService,
    pub secret: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct PaymentEvent {
    user_id: i64,
    /// Major currency units, converted to minor units on arrival.
    amount: f64,
    #[serde(default)]
    days: Option<i64>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments/webhook", post(payment_webhook))
        .with_state(state)
}

pub async fn serve(
    listen_addr: &str,
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Payment webhook listening on {}", listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("Payment webhook received shutdown signal, stopping...");
        })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn to_minor_units(amount: f64) -> Option<i64> {
    let minor = (amount * 100.0).round();
    (minor.is_finite() && minor.abs() < i64::MAX as f64).then_some(minor as i64)
}

async fn payment_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if state.secret.is_empty() || provided != Some(&*state.secret) {
        warn!("Payment webhook rejected: bad secret");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let event: PaymentEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Malformed payment event: {}", e);
            return (StatusCode::BAD_REQUEST, "Malformed payment event").into_response();
        }
    };
    let Some(delta) = to_minor_units(event.amount) else {
        return (StatusCode::BAD_REQUEST, "Invalid amount").into_response();
    };
    if event.days.is_some_and(|d| d <= 0) {
        return (StatusCode::BAD_REQUEST, "Invalid days").into_response();
    }

    let (balance, new_end) = match state
        .repo
        .apply_payment(event.user_id, delta, event.days, Utc::now())
        .await
    {
        Ok(applied) => applied,
        Err(StoreError::NotFound(_)) => {
            return (StatusCode::NOT_FOUND, "Subscriber not found").into_response();
        }
        Err(e) => {
            error!(subscriber = event.user_id, "Failed to apply payment: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to apply payment").into_response();
        }
    };
    info!(subscriber = event.user_id, delta, balance, "Payment applied");

    let text = match new_end {
        Some(end) => format!(
            "✅ Payment received. Your subscription is active until {}.",
            end.format("%Y-%m-%d")
        ),
        None => "✅ Payment received, your balance has been updated.".to_string(),
    };
    state.notifications.notify_subscriber(event.user_id, &text).await;

    Json(json!({
        "user_id": event.user_id,
        "balance": balance,
        "subscription_end_date": new_end,
    }))
    .into_response()
}
