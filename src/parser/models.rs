// Data models for the Anthropic Messages API
//
// These structs map to the Anthropic Messages API format.
// Required fields (`model`, `messages`, block payloads) fail deserialization
// when absent; optional fields go through `lenient` so a malformed value is
// dropped instead of failing the whole request. Serde ignores extra fields,
// making this robust to API changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lenient;

/// Represents an Anthropic API request
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRequest {
    pub model: String,
    pub messages: Vec<Message>,

    #[serde(default, deserialize_with = "lenient")]
    pub system: Option<SystemPrompt>,
    #[serde(default, deserialize_with = "lenient")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, deserialize_with = "lenient")]
    pub max_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub stream: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Represents an Anthropic API response
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, deserialize_with = "lenient")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
}

impl ApiResponse {
    /// Error envelopes (`{"type":"error",...}`) carry no assistant turn
    pub fn is_error(&self) -> bool {
        self.kind.as_deref() == Some("error")
    }
}

/// The system prompt is a string or a list of text blocks
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A message in the conversation
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
}

/// Message content can be a string or an array of content blocks
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A content block in a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    RedactedThinking {
        #[serde(default)]
        data: String,
    },

    Image {
        source: Value,
    },

    Document {
        source: Value,
    },

    /// Catch-all for other content types we don't care about
    #[serde(other)]
    Other,
}

/// Tool definition in the API
///
/// Server tools (web search etc.) have no `input_schema`.
#[derive(Debug, Clone, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_block_type_is_other() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type": "server_tool_use", "id": "x"})).unwrap();
        assert_eq!(block, ContentBlock::Other);
    }

    #[test]
    fn test_malformed_optional_fields_are_dropped() {
        let request: ApiRequest = serde_json::from_value(json!({
            "model": "claude-x",
            "messages": [],
            "system": 42,
            "tools": "nope",
            "max_tokens": "many",
            "stream": true
        }))
        .unwrap();
        assert!(request.system.is_none());
        assert!(request.tools.is_none());
        assert!(request.max_tokens.is_none());
        assert_eq!(request.stream, Some(true));
    }

    #[test]
    fn test_missing_required_fields_fail() {
        assert!(serde_json::from_value::<ApiRequest>(json!({"messages": []})).is_err());
        assert!(serde_json::from_value::<ApiRequest>(json!({"model": "m"})).is_err());
    }
}
