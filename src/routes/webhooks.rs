use axum::{extract::State, http::HeaderMap, Json};
use sha2::{Digest, Sha256};

use crate::{
    automation::webhook::{apply_webhook, AutomationWebhook, WebhookAck},
    db::run_blocking,
    error::{AppError, AppResult},
    state::AppState,
};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

pub async fn automation_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AutomationWebhook>,
) -> AppResult<Json<WebhookAck>> {
    let expected = state
        .config
        .automation_webhook_secret
        .as_deref()
        .ok_or_else(AppError::unauthorized)?;
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(AppError::unauthorized)?;
    if !secrets_match(expected, presented) {
        return Err(AppError::unauthorized());
    }

    let ack = run_blocking(&state.pool, move |conn| {
        apply_webhook(conn, payload).map_err(AppError::from)
    })
    .await?;
    Ok(Json(ack))
}

/// Compares digests so the comparison time does not depend on the secret.
fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    expected
        .iter()
        .zip(presented.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
