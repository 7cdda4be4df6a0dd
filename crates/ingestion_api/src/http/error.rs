use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::domain::DomainError;
use serde::Serialize;

/// JSON body of every non-200 webhook response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Map a request-level domain error to an HTTP response
///
/// Only authentication failures and configuration read failures ever reach
/// this point; per-event failures are reported inside a 200 body.
pub fn domain_error_to_response(error: DomainError) -> Response {
    match error {
        DomainError::WebhookDisabled => error_response(StatusCode::FORBIDDEN, "Webhook disabled", None),

        DomainError::InvalidWebhookToken
        | DomainError::InvalidWebhookSecret
        | DomainError::InvalidWebhookUuid => {
            error_response(StatusCode::UNAUTHORIZED, &error.to_string(), None)
        }

        DomainError::ValidationError(msg) | DomainError::MalformedEvent(msg) => {
            error_response(StatusCode::BAD_REQUEST, "Invalid request", Some(msg))
        }

        other => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            Some(other.to_string()),
        ),
    }
}

pub(crate) fn error_response(status: StatusCode, error: &str, message: Option<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}
