use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use eventpipe_core::ValidationFailure;
use eventpipe_events::TransportError;

pub fn validation_error_to_response(err: &ValidationFailure) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, err.reason(), err.to_string())
}

pub fn publish_error_to_response(err: &TransportError) -> axum::response::Response {
    json_error(StatusCode::BAD_GATEWAY, "publish_error", err.to_string())
}

pub fn body_rejection_to_response(rejection: BytesRejection) -> axum::response::Response {
    let status = rejection.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else {
        "bad_request"
    };
    json_error(status, code, rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
