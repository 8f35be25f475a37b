// Anthropic Messages adapter
//
// Request messages alternate user/assistant. Tool results ride inside user
// messages and carry only the id of the tool_use they answer, so names are
// resolved from the tool_use blocks seen earlier in the same conversion.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::models::{
    ApiRequest, ApiResponse, ContentBlock, MessageContent, MessageRole, SystemPrompt,
};
use super::{
    append_str, extract_usage, slot_mut, stream_index, ConversationError, WireAdapter,
};
use crate::conversation::{
    group_split, Content, Conversation, Message, Meta, Models, Part, Role, ToolDecl,
};
use crate::proxy::sse::SseEvent;

const NAME: &str = "anthropic";

/// Tool name used when a result references an id we never saw
const UNKNOWN_TOOL: &str = "unknown";

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

impl WireAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn parse_conversation(
        &self,
        request: Option<&Value>,
        response: Option<&Value>,
    ) -> Result<Conversation, ConversationError> {
        let request = request.ok_or_else(|| ConversationError::new(NAME, "request body missing"))?;
        let request: ApiRequest = serde_json::from_value(request.clone())
            .map_err(|e| ConversationError::new(NAME, format!("invalid request: {}", e)))?;

        let response = response.and_then(|value| {
            match serde_json::from_value::<ApiResponse>(value.clone()) {
                Ok(response) => Some(response),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unparseable anthropic response");
                    None
                }
            }
        });

        let mut tool_names: HashMap<String, String> = HashMap::new();
        let mut messages = Vec::new();

        match request.system {
            Some(SystemPrompt::Text(text)) => messages.push(Message::text(Role::System, text)),
            Some(SystemPrompt::Blocks(blocks)) => {
                let parts = convert_blocks(blocks, &mut tool_names);
                if !parts.is_empty() {
                    messages.push(Message::parts(Role::System, parts));
                }
            }
            None => {}
        }

        for (index, message) in request.messages.into_iter().enumerate() {
            match (message.role, message.content) {
                (MessageRole::User, MessageContent::Text(text)) => {
                    messages.push(Message::text(Role::User, text));
                }
                (MessageRole::User, MessageContent::Blocks(blocks)) => {
                    let start = messages.len();
                    messages.extend(split_user_turn(blocks, &mut tool_names));
                    group_split(&mut messages[start..], &format!("g{}", index));
                }
                (MessageRole::Assistant, content) => {
                    messages.push(assistant_message(content, &mut tool_names));
                }
            }
        }

        let mut meta = Meta {
            max_tokens: request.max_tokens,
            stream: request.stream,
            stop_reason: None,
            metadata: request.metadata,
        };
        let mut usage = None;

        if let Some(response) = response.filter(|r| !r.is_error()) {
            if !response.content.is_empty() {
                messages.push(assistant_message(
                    MessageContent::Blocks(response.content),
                    &mut tool_names,
                ));
            }
            meta.stop_reason = response.stop_reason;
            usage = response.usage.as_ref().and_then(extract_usage);
        }

        let tools = request
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| ToolDecl {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect();

        Ok(Conversation {
            messages,
            tools,
            // The response model is not echoed separately for this provider
            models: Models {
                request: request.model,
                response: None,
            },
            usage,
            meta,
        })
    }

    fn reassemble_from_sse(&self, events: &[SseEvent]) -> Option<Value> {
        let mut response: Option<Map<String, Value>> = None;
        let mut slots: Vec<Option<Value>> = Vec::new();
        let mut partial_json: HashMap<usize, String> = HashMap::new();

        for event in events {
            let Some(data) = event.data.json() else {
                continue;
            };
            let Some(index) = stream_index(data, "index") else {
                continue;
            };

            match event.event_type() {
                Some("message_start") => {
                    if let Some(Value::Object(message)) = data.get("message") {
                        response = Some(message.clone());
                    }
                }
                Some("content_block_start") => {
                    let block = data
                        .get("content_block")
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    if let Some(slot) = slot_mut(&mut slots, index) {
                        *slot = Some(block);
                    }
                }
                Some("content_block_delta") => {
                    let Some(delta) = data.get("delta") else {
                        continue;
                    };
                    let Some(slot) = slot_mut(&mut slots, index) else {
                        continue;
                    };
                    let block = slot.get_or_insert_with(|| placeholder_block(delta));
                    apply_delta(block, delta, partial_json.entry(index).or_default());
                }
                Some("message_delta") => {
                    let message = response.get_or_insert_with(empty_message);
                    if let Some(Value::Object(delta)) = data.get("delta") {
                        for (key, value) in delta {
                            message.insert(key.clone(), value.clone());
                        }
                    }
                    if let Some(Value::Object(usage)) = data.get("usage") {
                        merge_usage(message, usage);
                    }
                }
                // content_block_stop, message_stop, ping: nothing to accumulate
                _ => {}
            }
        }

        if response.is_none() && slots.iter().all(Option::is_none) {
            return None;
        }

        let content: Vec<Value> = slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let mut block = slot?;
                if let Some(buffer) = partial_json.get(&index).filter(|b| !b.is_empty()) {
                    let input = serde_json::from_str(buffer)
                        .unwrap_or_else(|_| Value::String(buffer.clone()));
                    if let Some(map) = block.as_object_mut() {
                        map.insert("input".to_string(), input);
                    }
                }
                Some(block)
            })
            .collect();

        let mut message = response.unwrap_or_else(empty_message);
        message.insert("content".to_string(), Value::Array(content));
        Some(Value::Object(message))
    }

    fn to_response(&self, conversation: &Conversation) -> Option<Value> {
        let assistant = conversation.last_with_role(Role::Assistant)?;
        let content: Vec<Value> = match &assistant.content {
            Content::Text(text) => vec![json!({"type": "text", "text": text})],
            Content::Parts(parts) => parts
                .iter()
                .filter_map(part_to_block)
                .filter_map(|block| serde_json::to_value(block).ok())
                .collect(),
        };

        let mut response = json!({
            "type": "message",
            "role": "assistant",
            "model": conversation.models.effective(),
            "content": content,
            "stop_reason": conversation.meta.stop_reason,
        });
        if let Some(usage) = conversation.usage {
            let mut wire = json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
            });
            if let Some(read) = usage.cache_read_tokens {
                wire["cache_read_input_tokens"] = json!(read);
            }
            if let Some(write) = usage.cache_write_tokens {
                wire["cache_creation_input_tokens"] = json!(write);
            }
            response["usage"] = wire;
        }
        Some(response)
    }
}

/// Split a user turn into ordered runs: plain parts stay on a user message,
/// consecutive tool results become one tool message
fn split_user_turn(
    blocks: Vec<ContentBlock>,
    tool_names: &mut HashMap<String, String>,
) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    let mut run: Vec<Part> = Vec::new();
    let mut run_role = Role::User;

    for block in blocks {
        let role = if matches!(block, ContentBlock::ToolResult { .. }) {
            Role::Tool
        } else {
            Role::User
        };
        let Some(part) = convert_block(block, tool_names) else {
            continue;
        };
        if role != run_role && !run.is_empty() {
            out.push(Message::parts(run_role, std::mem::take(&mut run)));
        }
        run_role = role;
        run.push(part);
    }
    if !run.is_empty() {
        out.push(Message::parts(run_role, run));
    }
    out
}

fn assistant_message(content: MessageContent, tool_names: &mut HashMap<String, String>) -> Message {
    let parts = match content {
        MessageContent::Text(text) => vec![Part::text(text)],
        MessageContent::Blocks(blocks) => convert_blocks(blocks, tool_names),
    };
    Message::parts(Role::Assistant, parts)
}

fn convert_blocks(blocks: Vec<ContentBlock>, tool_names: &mut HashMap<String, String>) -> Vec<Part> {
    blocks
        .into_iter()
        .filter_map(|block| convert_block(block, tool_names))
        .collect()
}

fn convert_block(block: ContentBlock, tool_names: &mut HashMap<String, String>) -> Option<Part> {
    let part = match block {
        ContentBlock::Text { text } => Part::Text { text },
        ContentBlock::ToolUse { id, name, input } => {
            // First occurrence of an id wins
            tool_names.entry(id.clone()).or_insert_with(|| name.clone());
            Part::ToolCall {
                id,
                name,
                args: input,
            }
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Part::ToolResult {
            tool_name: tool_names
                .get(&tool_use_id)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_TOOL.to_string()),
            tool_call_id: tool_use_id,
            output: content,
            is_error,
        },
        ContentBlock::Thinking { thinking, .. } => Part::Reasoning { text: thinking },
        ContentBlock::RedactedThinking { .. } => Part::Reasoning {
            text: "[Reasoning (redacted)]".to_string(),
        },
        ContentBlock::Image { source } => Part::Image { source },
        ContentBlock::Document { source } => Part::File {
            media_type: source
                .get("media_type")
                .and_then(Value::as_str)
                .map(String::from),
            data: source,
        },
        ContentBlock::Other => return None,
    };
    Some(part)
}

fn part_to_block(part: &Part) -> Option<ContentBlock> {
    let block = match part {
        Part::Text { text } => ContentBlock::Text { text: text.clone() },
        Part::ToolCall { id, name, args } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: args.clone(),
        },
        Part::Reasoning { text } => ContentBlock::Thinking {
            thinking: text.clone(),
            signature: None,
        },
        Part::Image { source } => ContentBlock::Image {
            source: source.clone(),
        },
        Part::File { data, .. } => ContentBlock::Document {
            source: data.clone(),
        },
        Part::ToolResult { .. } => return None,
    };
    Some(block)
}

fn empty_message() -> Map<String, Value> {
    let mut message = Map::new();
    message.insert("type".to_string(), json!("message"));
    message.insert("role".to_string(), json!("assistant"));
    message
}

/// Block for a delta whose content_block_start never arrived
fn placeholder_block(delta: &Value) -> Value {
    match delta.get("type").and_then(Value::as_str) {
        Some("input_json_delta") => json!({"type": "tool_use", "input": {}}),
        Some("thinking_delta") | Some("signature_delta") => json!({"type": "thinking", "thinking": ""}),
        _ => json!({"type": "text", "text": ""}),
    }
}

fn apply_delta(block: &mut Value, delta: &Value, partial_json: &mut String) {
    let str_field = |key: &str| delta.get(key).and_then(Value::as_str);
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => {
            if let Some(text) = str_field("text") {
                append_str(block, "text", text);
            }
        }
        Some("input_json_delta") => {
            if let Some(fragment) = str_field("partial_json") {
                partial_json.push_str(fragment);
            }
        }
        Some("thinking_delta") => {
            if let Some(thinking) = str_field("thinking") {
                append_str(block, "thinking", thinking);
            }
        }
        Some("signature_delta") => {
            if let (Some(signature), Some(map)) = (str_field("signature"), block.as_object_mut()) {
                map.insert("signature".to_string(), json!(signature));
            }
        }
        Some("citations_delta") => {
            if let (Some(citation), Some(map)) = (delta.get("citation"), block.as_object_mut()) {
                let citations = map
                    .entry("citations")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Some(list) = citations.as_array_mut() {
                    list.push(citation.clone());
                }
            }
        }
        other => tracing::trace!(delta_type = ?other, "ignoring unknown content delta"),
    }
}

fn merge_usage(message: &mut Map<String, Value>, usage: &Map<String, Value>) {
    let target = message
        .entry("usage")
        .or_insert_with(|| Value::Object(Map::new()));
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(target) = target.as_object_mut() {
        for (key, value) in usage {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::sse;
    use serde_json::json;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter
    }

    fn events(raw: &str) -> Vec<SseEvent> {
        sse::parse(raw.as_bytes()).unwrap()
    }

    const TEXT_STREAM: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-x\",\"content\":[],\"stop_reason\":null,\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: ping\n\
data: {\"type\":\"ping\"}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", wor\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ld! \u{00e9}\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":12}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

    #[test]
    fn test_request_and_response_parse_to_two_messages() {
        let request = json!({
            "model": "claude-x",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let response = json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "hello"}]
        });
        let conv = adapter()
            .parse_conversation(Some(&request), Some(&response))
            .unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[0].content, Content::Text("hi".to_string()));
        assert_eq!(conv.messages[1].role, Role::Assistant);
        assert_eq!(conv.messages[1].content, Content::Parts(vec![Part::text("hello")]));
        assert_eq!(conv.models.request, "claude-x");
        assert!(conv.models.response.is_none());
    }

    #[test]
    fn test_tool_result_resolves_name_from_earlier_tool_use() {
        let request = json!({
            "model": "claude-x",
            "messages": [
                {"role": "user", "content": "list files"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Running ls"},
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "a.txt"},
                    {"type": "tool_result", "tool_use_id": "toolu_missing", "content": "?", "is_error": true},
                    {"type": "text", "text": "thanks"}
                ]}
            ]
        });
        let conv = adapter().parse_conversation(Some(&request), None).unwrap();
        assert_eq!(conv.messages.len(), 4);

        let tool = &conv.messages[2];
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.group.as_deref(), Some("g2"));
        match tool.content.parts() {
            [Part::ToolResult { tool_name: first, .. }, Part::ToolResult { tool_name: second, is_error, .. }] => {
                assert_eq!(first, "Bash");
                assert_eq!(second, "unknown");
                assert!(*is_error);
            }
            other => panic!("unexpected parts: {:?}", other),
        }

        let trailing = &conv.messages[3];
        assert_eq!(trailing.role, Role::User);
        assert_eq!(trailing.group.as_deref(), Some("g2"));
        assert_eq!(trailing.content.text().as_deref(), Some("thanks"));
    }

    #[test]
    fn test_assistant_string_becomes_part_list() {
        let request = json!({
            "model": "claude-x",
            "system": [{"type": "text", "text": "be brief"}],
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "a"}
            ]
        });
        let conv = adapter().parse_conversation(Some(&request), None).unwrap();
        assert_eq!(conv.messages[0].role, Role::System);
        assert_eq!(conv.messages[0].content.text().as_deref(), Some("be brief"));
        assert_eq!(conv.messages[2].content, Content::Parts(vec![Part::text("a")]));
    }

    #[test]
    fn test_missing_required_fields_fail() {
        let err = adapter()
            .parse_conversation(Some(&json!({"model": "claude-x"})), None)
            .unwrap_err();
        assert_eq!(err.adapter, "anthropic");
        assert!(adapter().parse_conversation(None, None).is_err());
    }

    #[test]
    fn test_response_usage_meta_and_tools() {
        let request = json!({
            "model": "claude-x",
            "max_tokens": 1024,
            "stream": false,
            "tools": [{"name": "Read", "description": "read a file", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "hi"}]
        });
        let response = json!({
            "type": "message",
            "model": "claude-x-20250101",
            "content": [{"type": "thinking", "thinking": "hmm", "signature": "sig"}, {"type": "text", "text": "yo"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 4, "cache_creation_input_tokens": 2}
        });
        let conv = adapter()
            .parse_conversation(Some(&request), Some(&response))
            .unwrap();
        assert_eq!(conv.meta.max_tokens, Some(1024));
        assert_eq!(conv.meta.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(conv.tools.len(), 1);
        assert_eq!(conv.tools[0].name, "Read");
        let usage = conv.usage.unwrap();
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.cache_write_tokens, Some(2));
        assert_eq!(
            conv.messages[1].content.parts()[0],
            Part::Reasoning {
                text: "hmm".to_string()
            }
        );
    }

    #[test]
    fn test_error_response_adds_no_assistant_turn() {
        let request = json!({"model": "claude-x", "messages": [{"role": "user", "content": "hi"}]});
        let response = json!({"type": "error", "error": {"type": "overloaded_error", "message": "busy"}});
        let conv = adapter()
            .parse_conversation(Some(&request), Some(&response))
            .unwrap();
        assert_eq!(conv.messages.len(), 1);
    }

    #[test]
    fn test_reassembly_matches_non_streaming_text() {
        let non_streaming = json!({
            "content": [{"type": "text", "text": "Hello, world! \u{00e9}"}]
        });
        let rebuilt = adapter().reassemble_from_sse(&events(TEXT_STREAM)).unwrap();
        assert_eq!(rebuilt["content"][0]["text"], non_streaming["content"][0]["text"]);
        assert_eq!(rebuilt["model"], "claude-x");
        assert_eq!(rebuilt["stop_reason"], "end_turn");
        assert_eq!(rebuilt["usage"]["input_tokens"], 10);
        assert_eq!(rebuilt["usage"]["output_tokens"], 12);
        assert_eq!(rebuilt["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_reassembly_accumulates_tool_input_and_thinking() {
        let raw = "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-x\",\"content\":[]}}\n\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\"}}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"let me \"}}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"look\"}}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"signature_delta\",\"signature\":\"abc\"}}\n\n\
data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_9\",\"name\":\"Read\",\"input\":{}}}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"path\\\":\"}}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"a.rs\\\"}\"}}\n\n\
data: {\"type\":\"message_stop\"}\n\n";
        let rebuilt = adapter().reassemble_from_sse(&events(raw)).unwrap();
        let content = rebuilt["content"].as_array().unwrap();
        assert_eq!(content[0]["thinking"], "let me look");
        assert_eq!(content[0]["signature"], "abc");
        assert_eq!(content[1]["input"], json!({"path": "a.rs"}));
        assert_eq!(content[1]["name"], "Read");
    }

    #[test]
    fn test_reassembly_allocates_lazily_and_drops_gaps() {
        let raw = "data: {\"type\":\"content_block_delta\",\"index\":2,\"delta\":{\"type\":\"text_delta\",\"text\":\"late\"}}\n\n";
        let rebuilt = adapter().reassemble_from_sse(&events(raw)).unwrap();
        let content = rebuilt["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0], json!({"type": "text", "text": "late"}));
    }

    #[test]
    fn test_reassembly_skips_out_of_range_indices() {
        let hostile = "data: {\"type\":\"content_block_start\",\"index\":18446744073709551615,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
data: {\"type\":\"content_block_delta\",\"index\":4294967296,\"delta\":{\"type\":\"text_delta\",\"text\":\"boom\"}}\n\n";
        let raw = format!("{}{}", hostile, TEXT_STREAM);
        let rebuilt = adapter().reassemble_from_sse(&events(&raw)).unwrap();
        let content = rebuilt["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["text"], "Hello, world! \u{00e9}");
    }

    #[test]
    fn test_reassembly_of_nothing_is_none() {
        assert!(adapter().reassemble_from_sse(&[]).is_none());
        assert!(adapter()
            .reassemble_from_sse(&events("data: {\"type\":\"ping\"}\n\n"))
            .is_none());
    }

    #[test]
    fn test_to_response_reserializes_last_assistant_turn() {
        let request = json!({"model": "claude-x", "messages": [{"role": "user", "content": "hi"}]});
        let response = json!({
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"path": "x"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 2}
        });
        let conv = adapter()
            .parse_conversation(Some(&request), Some(&response))
            .unwrap();
        let rebuilt = adapter().to_response(&conv).unwrap();
        assert_eq!(rebuilt["content"], response["content"]);
        assert_eq!(rebuilt["stop_reason"], "tool_use");
        assert_eq!(rebuilt["usage"], json!({"input_tokens": 1, "output_tokens": 2}));
        assert_eq!(rebuilt["model"], "claude-x");
    }
}
