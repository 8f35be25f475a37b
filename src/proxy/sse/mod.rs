// SSE (Server-Sent Events) parsing module
//
// Tokenizes a complete, already-decompressed event stream into an ordered list
// of events. Provider adapters replay that list to rebuild the JSON a
// non-streaming call would have returned.
//
// # Framing
//
// ```
// event: <event_type>
// id: <id>
// data: <payload line 1>
// data: <payload line 2>
//
// ```
//
// - Lines end with `\n`, `\r\n` or a lone `\r`
// - A blank line dispatches the pending event
// - Lines starting with `:` are comments
// - A single space after the colon is stripped from the value
// - Multiple `data:` lines are joined with `\n` before one JSON decode attempt
// - A pending event with data at end of input is still dispatched
//
// Events without any `data:` line carry nothing to replay and are dropped.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::util::media_type_is;

/// MIME type of an event stream
pub const EVENT_STREAM: &str = "text/event-stream";

/// Payload of one SSE event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SseData {
    /// Payload decoded as JSON
    Json(Value),
    /// Payload that is not JSON (e.g. `[DONE]`)
    Raw { raw: String },
}

impl SseData {
    /// The decoded JSON payload, if any
    pub fn json(&self) -> Option<&Value> {
        match self {
            SseData::Json(value) => Some(value),
            SseData::Raw { .. } => None,
        }
    }
}

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: SseData,
}

impl SseEvent {
    /// Event type: the `event:` field, else the payload's `type` member
    pub fn event_type(&self) -> Option<&str> {
        self.event
            .as_deref()
            .or_else(|| self.data.json()?.get("type")?.as_str())
    }
}

/// Check if a response is SSE based on its content-type header value
pub fn is_sse_response(content_type: Option<&str>) -> bool {
    media_type_is(content_type, EVENT_STREAM)
}

/// Parse a complete event stream
///
/// Fails only when the bytes are not valid UTF-8; an undecodable payload
/// becomes `SseData::Raw` instead.
pub fn parse(raw: &[u8]) -> Result<Vec<SseEvent>> {
    let text = std::str::from_utf8(raw).context("event stream is not valid UTF-8")?;

    let mut events = Vec::new();
    let mut pending = PendingEvent::default();

    for line in split_lines(text) {
        if line.is_empty() {
            if let Some(event) = pending.dispatch() {
                events.push(event);
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => pending.data.push(value.to_string()),
            "event" => pending.event = Some(value.to_string()),
            "id" => pending.id = Some(value.to_string()),
            // retry and unknown fields carry nothing we replay
            _ => {}
        }
    }

    if let Some(event) = pending.dispatch() {
        events.push(event);
    }

    Ok(events)
}

#[derive(Default)]
struct PendingEvent {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl PendingEvent {
    /// Take the accumulated fields, returning an event if any data was seen
    fn dispatch(&mut self) -> Option<SseEvent> {
        let PendingEvent { event, id, data } = std::mem::take(self);
        if data.is_empty() {
            return None;
        }
        let joined = data.join("\n");
        let data = match serde_json::from_str::<Value>(&joined) {
            Ok(value) => SseData::Json(value),
            Err(_) => SseData::Raw { raw: joined },
        };
        Some(SseEvent { event, id, data })
    }
}

/// Split on `\r\n`, `\n` or a lone `\r`
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&text[start..i]);
                start = i + 1;
            }
            b'\r' => {
                lines.push(&text[start..i]);
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < bytes.len() {
        lines.push(&text[start..]);
    }
    lines
}
