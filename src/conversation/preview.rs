//! Short previews for list views
//!
//! A preview is the last user turn and the last assistant turn, flattened to
//! text and truncated on a UTF-8 boundary.

use serde::{Deserialize, Serialize};

use super::{Content, Conversation, Part, Role};
use crate::util::truncate_utf8_safe;

/// Default maximum preview length in bytes
pub const DEFAULT_PREVIEW_MAX_BYTES: usize = 280;

/// Last user / assistant text for a conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assistant: Option<String>,
}

impl Preview {
    pub fn is_empty(&self) -> bool {
        self.last_user.is_none() && self.last_assistant.is_none()
    }
}

/// Build a preview from a conversation
///
/// Tool-role messages never count as the user's turn. When the last assistant
/// turn has no text (pure tool use), the tool names stand in for it.
pub fn extract_preview(conversation: &Conversation, max_bytes: usize) -> Preview {
    let last_user = conversation
        .last_with_role(Role::User)
        .and_then(|m| m.content.text())
        .map(|text| clip(&text, max_bytes));

    let last_assistant = conversation
        .last_with_role(Role::Assistant)
        .and_then(|m| m.content.text().or_else(|| tool_summary(&m.content)))
        .map(|text| clip(&text, max_bytes));

    Preview {
        last_user,
        last_assistant,
    }
}

fn tool_summary(content: &Content) -> Option<String> {
    let names: Vec<String> = content
        .parts()
        .iter()
        .filter_map(|p| match p {
            Part::ToolCall { name, .. } => Some(format!("[tool: {}]", name)),
            _ => None,
        })
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(" "))
    }
}

fn clip(text: &str, max_bytes: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= max_bytes {
        return collapsed;
    }
    let mut clipped = truncate_utf8_safe(&collapsed, max_bytes.saturating_sub(3)).to_string();
    clipped.push_str("...");
    clipped
}
