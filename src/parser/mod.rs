// Parser module - provider wire adapters
//
// Each adapter understands one provider's request/response JSON and streaming
// protocol, and converts it into the canonical conversation model. Adapters
// are stateless; anything accumulated during a conversion (e.g. the
// tool-call id -> name map) lives on the stack of that single call.

pub mod anthropic;
pub mod models;
pub mod openai;

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::conversation::{Conversation, Usage};
use crate::proxy::sse::SseEvent;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiResponsesAdapter;

/// Supported provider wire formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI Responses API
    OpenaiResponses,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Anthropic => "anthropic",
            WireFormat::OpenaiResponses => "openai_responses",
        }
    }

    /// Adapter implementing this format
    pub fn adapter(&self) -> &'static dyn WireAdapter {
        match self {
            WireFormat::Anthropic => &AnthropicAdapter,
            WireFormat::OpenaiResponses => &OpenAiResponsesAdapter,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a conversation could not be produced
///
/// Never fatal to the pipeline: the record is persisted with the reason
/// instead of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationError {
    pub adapter: &'static str,
    pub reason: String,
}

impl ConversationError {
    pub fn new(adapter: &'static str, reason: impl Into<String>) -> Self {
        Self {
            adapter,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.adapter, self.reason)
    }
}

impl std::error::Error for ConversationError {}

/// One provider wire protocol
pub trait WireAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Convert request (and optionally response) JSON into a conversation
    ///
    /// Only missing or mistyped required fields fail; malformed optional
    /// fields are ignored.
    fn parse_conversation(
        &self,
        request: Option<&Value>,
        response: Option<&Value>,
    ) -> Result<Conversation, ConversationError>;

    /// Replay streamed events into the equivalent non-streaming response JSON
    ///
    /// Returns None when the events carry nothing to rebuild from.
    fn reassemble_from_sse(&self, events: &[SseEvent]) -> Option<Value>;

    /// Normalize a provider usage object
    fn extract_usage(&self, usage: &Value) -> Option<Usage> {
        extract_usage(usage)
    }

    /// Re-serialize the last assistant turn as this provider's response body
    fn to_response(&self, conversation: &Conversation) -> Option<Value>;
}

/// Normalize usage objects from any supported provider
///
/// Accepts `input_tokens`/`prompt_tokens`, `output_tokens`/`completion_tokens`,
/// and cache-read counts as either `cache_read_input_tokens` or a nested
/// `*_tokens_details.cached_tokens`. Nested cached counts are carved out of the
/// input count so `input_tokens` only ever holds uncached input.
pub fn extract_usage(raw: &Value) -> Option<Usage> {
    if !raw.is_object() {
        return None;
    }
    let input = first_u64(raw, &["input_tokens", "prompt_tokens"]);
    let output = first_u64(raw, &["output_tokens", "completion_tokens"]);
    if input.is_none() && output.is_none() {
        return None;
    }

    let mut input = input.unwrap_or(0);
    let mut cache_read = first_u64(raw, &["cache_read_input_tokens"]);
    if cache_read.is_none() {
        // Nested cached counts are a subset of the input count, not an addition to it
        cache_read = ["input_tokens_details", "prompt_tokens_details"]
            .iter()
            .find_map(|details| raw.get(details)?.get("cached_tokens")?.as_u64());
        if let Some(cached) = cache_read {
            input = input.saturating_sub(cached);
        }
    }

    Some(Usage {
        input_tokens: input,
        output_tokens: output.unwrap_or(0),
        cache_read_tokens: cache_read,
        cache_write_tokens: first_u64(raw, &["cache_creation_input_tokens"]),
    })
}

fn first_u64(raw: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| raw.get(key)?.as_u64())
}

/// Deserialize an optional field, treating a malformed value as absent
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Largest block, item or part index accepted from a stream event
pub(crate) const MAX_STREAM_INDEX: usize = 1024;

/// Positional index of a stream event, 0 when the field is absent
///
/// Indices past `MAX_STREAM_INDEX` are logged and yield None so the caller
/// can skip the event instead of allocating for it.
pub(crate) fn stream_index(data: &Value, key: &str) -> Option<usize> {
    let Some(raw) = data.get(key).and_then(Value::as_u64) else {
        return Some(0);
    };
    match usize::try_from(raw) {
        Ok(index) if index <= MAX_STREAM_INDEX => Some(index),
        _ => {
            tracing::warn!(
                field = key,
                index = raw,
                max = MAX_STREAM_INDEX,
                "Skipping stream event with out-of-range index"
            );
            None
        }
    }
}

/// Get or lazily allocate the slot at `index`
pub(crate) fn slot_mut(
    slots: &mut Vec<Option<Value>>,
    index: usize,
) -> Option<&mut Option<Value>> {
    if index > MAX_STREAM_INDEX {
        return None;
    }
    if slots.len() <= index {
        slots.resize(index.checked_add(1)?, None);
    }
    slots.get_mut(index)
}

/// Append a string fragment onto `object[key]`, creating it if needed
pub(crate) fn append_str(object: &mut Value, key: &str, fragment: &str) {
    let Some(map) = object.as_object_mut() else {
        return;
    };
    match map.get_mut(key) {
        Some(Value::String(existing)) => existing.push_str(fragment),
        _ => {
            map.insert(key.to_string(), Value::String(fragment.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_usage_anthropic_shape() {
        let usage = extract_usage(&json!({
            "input_tokens": 12,
            "output_tokens": 34,
            "cache_read_input_tokens": 100,
            "cache_creation_input_tokens": 7
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
        assert_eq!(usage.cache_read_tokens, Some(100));
        assert_eq!(usage.cache_write_tokens, Some(7));
    }

    #[test]
    fn test_extract_usage_openai_synonyms() {
        let responses = extract_usage(&json!({
            "input_tokens": 50,
            "output_tokens": 5,
            "input_tokens_details": {"cached_tokens": 20}
        }))
        .unwrap();
        assert_eq!(responses.input_tokens, 30);
        assert_eq!(responses.cache_read_tokens, Some(20));

        let chat = extract_usage(&json!({
            "prompt_tokens": 9,
            "completion_tokens": 3,
            "prompt_tokens_details": {"cached_tokens": 4}
        }))
        .unwrap();
        assert_eq!(chat.input_tokens, 5);
        assert_eq!(chat.output_tokens, 3);
        assert_eq!(chat.cache_read_tokens, Some(4));
        assert_eq!(chat.cache_write_tokens, None);
    }

    #[test]
    fn test_extract_usage_cached_tokens_are_not_counted_twice() {
        let usage = extract_usage(&json!({
            "input_tokens": 1_000_000,
            "output_tokens": 0,
            "input_tokens_details": {"cached_tokens": 1_000_000}
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.cache_read_tokens, Some(1_000_000));

        // A cached count larger than the total never underflows
        let skewed = extract_usage(&json!({
            "prompt_tokens": 3,
            "prompt_tokens_details": {"cached_tokens": 10}
        }))
        .unwrap();
        assert_eq!(skewed.input_tokens, 0);
        assert_eq!(skewed.cache_read_tokens, Some(10));
    }

    #[test]
    fn test_extract_usage_rejects_non_usage() {
        assert!(extract_usage(&json!(null)).is_none());
        assert!(extract_usage(&json!({"total_tokens": 5})).is_none());
    }

    #[test]
    fn test_wire_format_round_trips_names() {
        let format: WireFormat = serde_json::from_value(json!("openai_responses")).unwrap();
        assert_eq!(format, WireFormat::OpenaiResponses);
        assert_eq!(format.adapter().name(), "openai_responses");
        assert_eq!(WireFormat::Anthropic.adapter().name(), "anthropic");
    }

    #[test]
    fn test_stream_index_bounds() {
        assert_eq!(stream_index(&json!({}), "index"), Some(0));
        assert_eq!(stream_index(&json!({"index": 3}), "index"), Some(3));
        assert_eq!(stream_index(&json!({"index": "3"}), "index"), Some(0));
        assert_eq!(stream_index(&json!({"index": u64::MAX}), "index"), None);
        assert_eq!(
            stream_index(&json!({"index": MAX_STREAM_INDEX + 1}), "index"),
            None
        );

        let mut slots = Vec::new();
        assert!(slot_mut(&mut slots, usize::MAX).is_none());
        assert!(slots.is_empty());
        *slot_mut(&mut slots, 2).unwrap() = Some(json!(1));
        assert_eq!(slots, vec![None, None, Some(json!(1))]);
    }

    #[test]
    fn test_append_str_concatenates_fragments() {
        let mut block = json!({"type": "text"});
        append_str(&mut block, "text", "Hel");
        append_str(&mut block, "text", "lo");
        assert_eq!(block["text"], "Hello");
    }
}
