// OpenAI Responses adapter
//
// Requests carry an `input` list mixing user messages, prior assistant output
// items (messages, reasoning, function calls) and function call outputs.
// Consecutive assistant-side items form one canonical assistant turn.
// Function call arguments arrive as a JSON-encoded string; a call whose
// arguments don't decode fails the whole conversion rather than being dropped.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::{
    append_str, extract_usage, lenient, slot_mut, stream_index, ConversationError, WireAdapter,
    MAX_STREAM_INDEX,
};
use crate::conversation::{Content, Conversation, Message, Meta, Models, Part, Role, ToolDecl};
use crate::proxy::sse::SseEvent;

const NAME: &str = "openai_responses";

/// Stand-in text for reasoning that was returned without plaintext
pub const ENCRYPTED_REASONING: &str = "[Reasoning (encrypted)]";

const UNKNOWN_TOOL: &str = "unknown";

#[derive(Debug, Clone, Deserialize)]
struct ResponsesRequest {
    model: String,
    #[serde(default)]
    input: Option<Input>,
    #[serde(default, deserialize_with = "lenient")]
    instructions: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    tools: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "lenient")]
    max_output_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    stream: Option<bool>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponsesResponse {
    #[serde(default, deserialize_with = "lenient")]
    model: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    status: Option<String>,
    #[serde(default)]
    output: Vec<Item>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Input {
    Text(String),
    Items(Vec<Item>),
}

/// One input or output item
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Item {
    Text(String),
    Typed(TypedItem),
    /// `{role, content}` without a `type` discriminator
    Bare(MessageItem),
}

#[derive(Debug, Clone, Deserialize)]
struct MessageItem {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedItem {
    Message {
        role: String,
        content: MessageContent,
    },
    Reasoning {
        #[serde(default, deserialize_with = "lenient")]
        content: Option<Vec<ReasoningText>>,
    },
    FunctionCall(FunctionCall),
    FunctionCallOutput(FunctionCallOutput),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FunctionCallOutput {
    call_id: String,
    #[serde(default)]
    output: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ReasoningText {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    InputText {
        text: String,
    },
    OutputText {
        text: String,
    },
    Refusal {
        refusal: String,
    },
    InputImage {
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default)]
        file_id: Option<String>,
    },
    InputFile {
        #[serde(default)]
        file_data: Option<String>,
        #[serde(default)]
        file_id: Option<String>,
        #[serde(default)]
        filename: Option<String>,
    },
    FunctionCall(FunctionCall),
    FunctionCallOutput(FunctionCallOutput),
    Reasoning {
        #[serde(default, deserialize_with = "lenient")]
        content: Option<Vec<ReasoningText>>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiResponsesAdapter;

impl WireAdapter for OpenAiResponsesAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn parse_conversation(
        &self,
        request: Option<&Value>,
        response: Option<&Value>,
    ) -> Result<Conversation, ConversationError> {
        let request = request
            .map(|value| {
                serde_json::from_value::<ResponsesRequest>(value.clone())
                    .map_err(|e| ConversationError::new(NAME, format!("invalid request: {}", e)))
            })
            .transpose()?;

        let response = response.and_then(|value| {
            match serde_json::from_value::<ResponsesResponse>(value.clone()) {
                Ok(response) => Some(response),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unparseable responses body");
                    None
                }
            }
        });

        if request.is_none() && response.is_none() {
            return Err(ConversationError::new(
                NAME,
                "neither request nor response body available",
            ));
        }

        let mut builder = TurnBuilder::default();
        let mut meta = Meta::default();
        let mut tools = Vec::new();
        let mut requested_model = String::new();

        if let Some(request) = request {
            if let Some(instructions) = request.instructions {
                builder.push(Message::text(Role::System, instructions));
            }
            match request.input {
                Some(Input::Text(text)) => builder.push(Message::text(Role::User, text)),
                Some(Input::Items(items)) => {
                    for item in items {
                        builder.item(item)?;
                    }
                }
                None => {}
            }
            tools = request
                .tools
                .unwrap_or_default()
                .iter()
                .filter_map(tool_decl)
                .collect();
            meta.max_tokens = request.max_output_tokens;
            meta.stream = request.stream;
            meta.metadata = request.metadata;
            requested_model = request.model;
        }

        let mut usage = None;
        let mut response_model = None;
        if let Some(response) = response {
            builder.flush();
            for item in response.output {
                builder.item(item)?;
            }
            meta.stop_reason = response.status;
            usage = response.usage.as_ref().and_then(extract_usage);
            response_model = response.model;
        }

        if requested_model.is_empty() {
            // Response-only replay: the response model is all we know
            requested_model = response_model.clone().unwrap_or_default();
        }

        Ok(Conversation {
            messages: builder.finish(),
            tools,
            models: Models {
                request: requested_model,
                response: response_model,
            },
            usage,
            meta,
        })
    }

    fn reassemble_from_sse(&self, events: &[SseEvent]) -> Option<Value> {
        let mut response: Option<Map<String, Value>> = None;
        let mut slots: Vec<Option<Value>> = Vec::new();

        for event in events {
            let Some(data) = event.data.json() else {
                continue;
            };
            let Some(output_index) = stream_index(data, "output_index") else {
                continue;
            };

            match event.event_type() {
                Some("response.created") | Some("response.in_progress") => {
                    if let Some(Value::Object(snapshot)) = data.get("response") {
                        response = Some(snapshot.clone());
                    }
                }
                Some("response.completed")
                | Some("response.incomplete")
                | Some("response.failed") => {
                    if let Some(Value::Object(snapshot)) = data.get("response") {
                        response = Some(snapshot.clone());
                    }
                }
                Some("response.output_item.added") | Some("response.output_item.done") => {
                    if let (Some(item), Some(slot)) =
                        (data.get("item"), slot_mut(&mut slots, output_index))
                    {
                        *slot = Some(item.clone());
                    }
                }
                Some("response.content_part.added") => {
                    let (Some(part), Some(content_index)) =
                        (data.get("part"), stream_index(data, "content_index"))
                    else {
                        continue;
                    };
                    let Some(slot) = slot_mut(&mut slots, output_index) else {
                        continue;
                    };
                    let item = slot.get_or_insert_with(empty_message_item);
                    if let Some(entry) = list_slot(item, "content", content_index) {
                        if entry.is_null() {
                            *entry = part.clone();
                        }
                    }
                }
                Some("response.output_text.delta") => {
                    let Some(content_index) = stream_index(data, "content_index") else {
                        continue;
                    };
                    let Some(slot) = slot_mut(&mut slots, output_index) else {
                        continue;
                    };
                    let item = slot.get_or_insert_with(empty_message_item);
                    let Some(part) = list_slot(item, "content", content_index) else {
                        continue;
                    };
                    if part.is_null() {
                        *part = json!({"type": "output_text", "text": ""});
                    }
                    if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                        append_str(part, "text", delta);
                    }
                }
                Some("response.function_call_arguments.delta") => {
                    let Some(slot) = slot_mut(&mut slots, output_index) else {
                        continue;
                    };
                    let item =
                        slot.get_or_insert_with(|| json!({"type": "function_call", "arguments": ""}));
                    if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                        append_str(item, "arguments", delta);
                    }
                }
                Some("response.reasoning_text.delta") => {
                    let Some(content_index) = stream_index(data, "content_index") else {
                        continue;
                    };
                    let Some(slot) = slot_mut(&mut slots, output_index) else {
                        continue;
                    };
                    let item = slot.get_or_insert_with(|| json!({"type": "reasoning"}));
                    let Some(part) = list_slot(item, "content", content_index) else {
                        continue;
                    };
                    if part.is_null() {
                        *part = json!({"type": "reasoning_text", "text": ""});
                    }
                    if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                        append_str(part, "text", delta);
                    }
                }
                Some("response.reasoning_summary_text.delta") => {
                    let Some(summary_index) = stream_index(data, "summary_index") else {
                        continue;
                    };
                    let Some(slot) = slot_mut(&mut slots, output_index) else {
                        continue;
                    };
                    let item = slot.get_or_insert_with(|| json!({"type": "reasoning"}));
                    let Some(part) = list_slot(item, "summary", summary_index) else {
                        continue;
                    };
                    if part.is_null() {
                        *part = json!({"type": "summary_text", "text": ""});
                    }
                    if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                        append_str(part, "text", delta);
                    }
                }
                _ => {}
            }
        }

        if response.is_none() && slots.iter().all(Option::is_none) {
            return None;
        }

        let mut response = response.unwrap_or_else(|| {
            let mut map = Map::new();
            map.insert("object".to_string(), json!("response"));
            map
        });

        let snapshot_has_output = response
            .get("output")
            .and_then(Value::as_array)
            .map(|output| !output.is_empty())
            .unwrap_or(false);
        if !snapshot_has_output {
            let output: Vec<Value> = slots.into_iter().flatten().map(drop_null_entries).collect();
            response.insert("output".to_string(), Value::Array(output));
        }
        Some(Value::Object(response))
    }

    fn to_response(&self, conversation: &Conversation) -> Option<Value> {
        let assistant = conversation.last_with_role(Role::Assistant)?;
        let mut output = Vec::new();
        let mut texts = Vec::new();

        let parts: Vec<Part> = match &assistant.content {
            Content::Text(text) => vec![Part::text(text.clone())],
            Content::Parts(parts) => parts.clone(),
        };
        for part in parts {
            match part {
                Part::Text { text } => {
                    texts.push(json!({"type": "output_text", "text": text, "annotations": []}))
                }
                Part::ToolCall { id, name, args } => output.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": args.to_string(),
                })),
                Part::Reasoning { text } => output.push(json!({
                    "type": "reasoning",
                    "content": [{"type": "reasoning_text", "text": text}],
                })),
                _ => {}
            }
        }
        if !texts.is_empty() {
            output.push(json!({
                "type": "message",
                "role": "assistant",
                "status": "completed",
                "content": texts,
            }));
        }

        let mut response = json!({
            "object": "response",
            "model": conversation.models.effective(),
            "status": conversation.meta.stop_reason.as_deref().unwrap_or("completed"),
            "output": output,
        });
        if let Some(usage) = conversation.usage {
            // The wire input count includes cached tokens
            let cached = usage.cache_read_tokens.unwrap_or(0);
            let input = usage.input_tokens.saturating_add(cached);
            response["usage"] = json!({
                "input_tokens": input,
                "output_tokens": usage.output_tokens,
                "total_tokens": input.saturating_add(usage.output_tokens),
                "input_tokens_details": {"cached_tokens": cached},
            });
        }
        Some(response)
    }
}

/// Accumulates canonical messages, merging consecutive assistant-side items
#[derive(Default)]
struct TurnBuilder {
    messages: Vec<Message>,
    assistant: Vec<Part>,
    tool_names: HashMap<String, String>,
}

impl TurnBuilder {
    fn push(&mut self, message: Message) {
        self.flush();
        self.messages.push(message);
    }

    fn flush(&mut self) {
        if !self.assistant.is_empty() {
            let parts = std::mem::take(&mut self.assistant);
            self.messages.push(Message::parts(Role::Assistant, parts));
        }
    }

    fn finish(mut self) -> Vec<Message> {
        self.flush();
        self.messages
    }

    fn item(&mut self, item: Item) -> Result<(), ConversationError> {
        match item {
            Item::Text(text) => self.push(Message::text(Role::User, text)),
            Item::Bare(MessageItem { role, content })
            | Item::Typed(TypedItem::Message { role, content }) => self.message(&role, content)?,
            Item::Typed(TypedItem::Reasoning { content }) => {
                self.assistant.push(reasoning_part(content));
            }
            Item::Typed(TypedItem::FunctionCall(call)) => {
                let part = self.function_call(call)?;
                self.assistant.push(part);
            }
            Item::Typed(TypedItem::FunctionCallOutput(output)) => {
                let part = self.function_output(output);
                self.push(Message::parts(Role::Tool, vec![part]));
            }
            Item::Typed(TypedItem::Other) => {}
        }
        Ok(())
    }

    fn message(&mut self, role: &str, content: MessageContent) -> Result<(), ConversationError> {
        let role = match role {
            "assistant" => Role::Assistant,
            "system" | "developer" => Role::System,
            _ => Role::User,
        };

        let parts = match content {
            MessageContent::Text(text) if role != Role::Assistant => {
                self.push(Message::text(role, text));
                return Ok(());
            }
            MessageContent::Text(text) => vec![Part::text(text)],
            MessageContent::Parts(parts) => {
                let mut converted = Vec::with_capacity(parts.len());
                for part in parts {
                    if let Some(part) = self.content_part(part)? {
                        converted.push(part);
                    }
                }
                converted
            }
        };

        if role == Role::Assistant {
            self.assistant.extend(parts);
        } else {
            self.push(Message::parts(role, parts));
        }
        Ok(())
    }

    fn content_part(&mut self, part: ContentPart) -> Result<Option<Part>, ConversationError> {
        let part = match part {
            ContentPart::InputText { text } | ContentPart::OutputText { text } => Part::Text { text },
            ContentPart::Refusal { refusal } => Part::Text { text: refusal },
            ContentPart::InputImage { image_url, file_id } => Part::Image {
                source: json!({"url": image_url, "fileId": file_id}),
            },
            ContentPart::InputFile {
                file_data,
                file_id,
                filename,
            } => Part::File {
                data: json!({"data": file_data, "fileId": file_id, "filename": filename}),
                media_type: None,
            },
            ContentPart::FunctionCall(call) => self.function_call(call)?,
            ContentPart::FunctionCallOutput(output) => self.function_output(output),
            ContentPart::Reasoning { content } => reasoning_part(content),
            ContentPart::Other => return Ok(None),
        };
        Ok(Some(part))
    }

    fn function_call(&mut self, call: FunctionCall) -> Result<Part, ConversationError> {
        let id = call.call_id.or(call.id).unwrap_or_default();
        let args: Value = serde_json::from_str(&call.arguments).map_err(|e| {
            ConversationError::new(
                NAME,
                format!("function call {} has undecodable arguments: {}", call.name, e),
            )
        })?;
        self.tool_names
            .entry(id.clone())
            .or_insert_with(|| call.name.clone());
        Ok(Part::ToolCall {
            id,
            name: call.name,
            args,
        })
    }

    fn function_output(&self, output: FunctionCallOutput) -> Part {
        Part::ToolResult {
            tool_name: self
                .tool_names
                .get(&output.call_id)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_TOOL.to_string()),
            tool_call_id: output.call_id,
            output: output.output,
            is_error: false,
        }
    }
}

fn reasoning_part(content: Option<Vec<ReasoningText>>) -> Part {
    let text = content
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        Part::Reasoning {
            text: ENCRYPTED_REASONING.to_string(),
        }
    } else {
        Part::Reasoning { text }
    }
}

fn tool_decl(tool: &Value) -> Option<ToolDecl> {
    let name = tool
        .get("name")
        .or_else(|| tool.get("type"))
        .and_then(Value::as_str)?;
    Some(ToolDecl {
        name: name.to_string(),
        description: tool
            .get("description")
            .and_then(Value::as_str)
            .map(String::from),
        input_schema: tool.get("parameters").cloned().unwrap_or(Value::Null),
    })
}

fn empty_message_item() -> Value {
    json!({"type": "message", "role": "assistant", "content": []})
}

/// Get or lazily allocate `item[key][index]`, padding with nulls
fn list_slot<'a>(item: &'a mut Value, key: &str, index: usize) -> Option<&'a mut Value> {
    if index > MAX_STREAM_INDEX {
        return None;
    }
    if !item.is_object() {
        *item = json!({});
    }
    let list = &mut item[key];
    let mut entries = match list.take() {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    };
    if entries.len() <= index {
        entries.resize(index.checked_add(1)?, Value::Null);
    }
    *list = Value::Array(entries);
    list.get_mut(index)
}

/// Remove null padding from content/summary lists of a rebuilt item
fn drop_null_entries(mut item: Value) -> Value {
    for key in ["content", "summary"] {
        if let Some(entries) = item.get_mut(key).and_then(Value::as_array_mut) {
            entries.retain(|entry| !entry.is_null());
        }
    }
    item
}
