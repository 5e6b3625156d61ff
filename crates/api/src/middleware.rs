use axum::{
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

use eventpipe_core::CorrelationId;

pub const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

/// Correlation id of the current request, from `X-Correlation-ID` or generated.
#[derive(Debug, Clone)]
pub struct RequestCorrelation(pub CorrelationId);

/// Resolves the request's correlation id, exposes it to handlers as an
/// extension and echoes it on the response.
pub async fn correlation_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let incoming = req
        .headers()
        .get(&CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok());
    let correlation_id = CorrelationId::from_header_or_generate(incoming);

    req.extensions_mut()
        .insert(RequestCorrelation(correlation_id.clone()));

    let mut res = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        res.headers_mut().insert(CORRELATION_HEADER, value);
    }
    res
}
