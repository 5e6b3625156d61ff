use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Extension, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use eventpipe_core::{MissingEventId, parse_and_validate_at};
use eventpipe_events::{headers, OutboundMessage};

use crate::app::dto::AcceptedResponse;
use crate::app::errors::{
    body_rejection_to_response, json_error, publish_error_to_response,
    validation_error_to_response,
};
use crate::app::AppState;
use crate::middleware::RequestCorrelation;

/// `POST /events`: validate, then publish to the primary queue.
///
/// A missing `event_id` is generated here, so every queued message carries one.
pub async fn ingest(
    State(state): State<AppState>,
    Extension(RequestCorrelation(correlation_id)): Extension<RequestCorrelation>,
    request_headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    if !is_json(&request_headers) {
        return json_error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Content-Type must be application/json",
        );
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(correlation_id = %correlation_id, "request body rejected");
            return body_rejection_to_response(rejection);
        }
    };

    let event = match parse_and_validate_at(&body, state.clock.now(), MissingEventId::Generate) {
        Ok(event) => event,
        Err(failure) => {
            warn!(
                correlation_id = %correlation_id,
                reason = failure.reason(),
                error = %failure,
                "event rejected"
            );
            return validation_error_to_response(&failure);
        }
    };

    let payload = match event.to_json_bytes() {
        Ok(payload) => payload,
        Err(e) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_error",
                e.to_string(),
            );
        }
    };

    let message = OutboundMessage::new(&state.queue_name, payload)
        .with_header(headers::EVENT_ID, event.event_id().as_str())
        .with_header(headers::EVENT_TYPE, event.event_type())
        .with_header(headers::SOURCE, event.source())
        .with_header(headers::SCHEMA_VERSION, event.schema_version().to_string())
        .with_correlation_id(&correlation_id);

    if let Err(e) = state.queue.publish(message).await {
        warn!(
            correlation_id = %correlation_id,
            event_id = %event.event_id(),
            error = %e,
            "failed to publish event"
        );
        return publish_error_to_response(&e);
    }

    info!(
        correlation_id = %correlation_id,
        event_id = %event.event_id(),
        event_type = event.event_type(),
        "event accepted"
    );

    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::new(event.event_id().as_str())),
    )
        .into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
