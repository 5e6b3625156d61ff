use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResponse {
    pub event_id: String,
    pub status: &'static str,
    pub message: &'static str,
}

impl AcceptedResponse {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            status: "accepted",
            message: "Event will be processed",
        }
    }
}
