use axum::response::sse::Event;
use serde::Serialize;
use serde_json::{Value, json};

pub const PING_EVENT: &str = "ping";
pub const STATUS_EVENT: &str = "status";
pub const END_EVENT: &str = "end";
pub const ERROR_EVENT: &str = "error";

/// One server-sent event: a name plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: Value,
}

impl SseFrame {
    pub fn ping() -> Self {
        Self {
            event: PING_EVENT,
            data: json!({ "ts": chrono::Utc::now().timestamp_millis() }),
        }
    }

    pub fn status(id: &str, status: &str) -> Self {
        Self {
            event: STATUS_EVENT,
            data: json!({ "id": id, "status": status }),
        }
    }

    pub fn end(id: &str, status: &str) -> Self {
        Self {
            event: END_EVENT,
            data: json!({ "id": id, "status": status }),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            event: ERROR_EVENT,
            data: json!({ "error": message }),
        }
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }

    pub fn into_event(self) -> Event {
        Event::default().event(self.event).data(self.data.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let frame = SseFrame::status("7", "RUNNING");
        assert_eq!(
            frame.to_wire(),
            "event: status\ndata: {\"id\":\"7\",\"status\":\"RUNNING\"}\n\n"
        );
    }

    #[test]
    fn test_error_frame() {
        let frame = SseFrame::error("db offline");
        assert_eq!(frame.event, ERROR_EVENT);
        assert_eq!(frame.data["error"], "db offline");
    }

    #[test]
    fn test_ping_carries_timestamp() {
        assert!(SseFrame::ping().data["ts"].as_i64().unwrap() > 0);
    }
}
