// Canonical conversation model
//
// Every provider wire format is converted into this one representation so
// storage, pricing and previews never need to know which API was called.
// Serialized field names are camelCase to match what the dashboard reads.

pub mod preview;

use serde::{Deserialize, Serialize};

/// Role of a canonical turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A typed piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Image {
        source: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    File {
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    Reasoning {
        text: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

/// Message content: plain text or an ordered list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

impl Content {
    /// Concatenated text of all text parts (reasoning excluded)
    pub fn text(&self) -> Option<String> {
        match self {
            Content::Text(s) => Some(s.clone()),
            Content::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
        }
    }

    pub fn parts(&self) -> &[Part] {
        match self {
            Content::Text(_) => &[],
            Content::Parts(parts) => parts,
        }
    }
}

/// One role-tagged turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    /// Correlation id shared by messages split out of one provider turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            group: None,
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, Content::Text(text.into()))
    }

    pub fn parts(role: Role, parts: Vec<Part>) -> Self {
        Self::new(role, Content::Parts(parts))
    }
}

/// A callable tool declared in the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Requested model vs. the model the provider reports having used
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Models {
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl Models {
    /// Model id used for pricing: what the provider says it ran, else what was asked for
    pub fn effective(&self) -> &str {
        self.response.as_deref().unwrap_or(&self.request)
    }
}

/// Normalized token usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

/// Provider-opaque request metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The provider-agnostic view of one exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDecl>,
    pub models: Models,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub meta: Meta,
}

impl Conversation {
    /// Last message with the given role
    pub fn last_with_role(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == role)
    }
}

/// Assigns a shared group id to a run of messages split from one provider turn.
/// A run of one message is left ungrouped.
pub(crate) fn group_split(messages: &mut [Message], group: &str) {
    if messages.len() < 2 {
        return;
    }
    for message in messages {
        message.group = Some(group.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_serializes_with_kebab_tag() {
        let part = Part::ToolResult {
            tool_call_id: "toolu_1".to_string(),
            tool_name: "Read".to_string(),
            output: json!("ok"),
            is_error: false,
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool-result");
        assert_eq!(value["toolCallId"], "toolu_1");
        assert_eq!(value["toolName"], "Read");
        assert!(value.get("isError").is_none());
    }

    #[test]
    fn test_content_text_joins_text_parts_only() {
        let content = Content::Parts(vec![
            Part::Reasoning {
                text: "hmm".to_string(),
            },
            Part::text("one"),
            Part::text("two"),
        ]);
        assert_eq!(content.text().as_deref(), Some("one\ntwo"));
        assert_eq!(Content::Parts(vec![]).text(), None);
    }

    #[test]
    fn test_group_split_leaves_single_message_alone() {
        let mut single = vec![Message::text(Role::User, "hi")];
        group_split(&mut single, "g0");
        assert!(single[0].group.is_none());

        let mut pair = vec![
            Message::text(Role::User, "hi"),
            Message::text(Role::Tool, "out"),
        ];
        group_split(&mut pair, "g3");
        assert!(pair.iter().all(|m| m.group.as_deref() == Some("g3")));
    }

    #[test]
    fn test_effective_model_prefers_response() {
        let mut models = Models {
            request: "gpt-x".to_string(),
            response: None,
        };
        assert_eq!(models.effective(), "gpt-x");
        models.response = Some("gpt-x-2025".to_string());
        assert_eq!(models.effective(), "gpt-x-2025");
    }
}
