use crate::domain::WebhookCredentials;
use crate::http::{domain_error_to_response, error_response, AppState};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use common::domain::WebhookActivity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
pub const WEBHOOK_UUID_HEADER: &str = "x-webhook-uuid";

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub success: bool,
    pub events_processed: usize,
    pub events_failed: usize,
    pub notifications_failed: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookHealthResponse {
    pub status: &'static str,
    pub enabled: bool,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<WebhookActivity>,
}

/// `POST` on the webhook path
///
/// Credentials are checked before the body is parsed, so an unauthenticated
/// caller never learns anything about body validation.
#[instrument(name = "ReceiveWebhook", skip_all, fields(body_bytes = body.len()))]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let received_at = Utc::now();
    let credentials = WebhookCredentials {
        token: query.token.filter(|t| !t.is_empty()),
        secret: header_value(&headers, WEBHOOK_SECRET_HEADER),
        uuid: header_value(&headers, WEBHOOK_UUID_HEADER),
    };

    if let Err(e) = state.ingestion.authorize(&credentials).await {
        return domain_error_to_response(e);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "webhook body is not valid JSON");
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid JSON body",
                Some(e.to_string()),
            );
        }
    };

    let summary = state.ingestion.process_batch(&payload, received_at).await;

    Json(WebhookResponse {
        success: summary.success(),
        events_processed: summary.events_processed(),
        events_failed: summary.events_failed(),
        notifications_failed: summary.notifications_failed(),
    })
    .into_response()
}

/// `GET` on the webhook path; read-only
#[instrument(name = "WebhookHealth", skip_all)]
pub async fn webhook_health(State(state): State<AppState>) -> Response {
    match state.ingestion.health().await {
        Ok(health) => Json(WebhookHealthResponse {
            status: "ok",
            enabled: health.enabled,
            endpoint: state.webhook_path.clone(),
            last_event: health.last_event,
        })
        .into_response(),
        Err(e) => domain_error_to_response(e),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
