use atelier_contracts::TaskKind;
use atelier_engine::{Gateway, GatewayError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Failure envelope plus the HTTP status it is sent with.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    /// Client errors answer 400; every provider-side failure answers 500.
    pub fn from_gateway(gateway: &Gateway, task: TaskKind, err: &GatewayError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            body: gateway.failure_envelope(task, err),
        }
    }

    /// The body could not be read at all (bad JSON, broken multipart).
    pub fn bad_request(gateway: &Gateway, task: TaskKind, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({
                "success": false,
                "error": message.into(),
                "hint": "Send a JSON object or a multipart form with the documented fields.",
                "kind": "client-error",
                "availableModels": gateway.registry().aliases(task),
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
