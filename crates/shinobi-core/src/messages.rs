use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// One turn of a conversation. Persona text is not a message; it travels in
/// [`CompletionRequest::system`](crate::gateway::CompletionRequest).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallBlock>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A model request to invoke a capability by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallBlock {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage { text: text.into() })
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        })
    }

    pub fn tool_result(
        call: &ToolCallBlock,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error,
        })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::ToolResult(_) => "tool_result",
        }
    }
}

impl AssistantMessage {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text_content(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_tags() {
        let json = serde_json::to_value(Message::user_text("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["text"], "hi");

        let call = ToolCallBlock::new("add", serde_json::json!({"a": 1}));
        let json = serde_json::to_value(Message::tool_result(&call, "2", false)).unwrap();
        assert_eq!(json["role"], "tool_result");
        assert_eq!(json["name"], "add");
        assert_eq!(json["tool_call_id"], call.id.as_str());
    }

    #[test]
    fn assistant_without_tool_calls_omits_field() {
        let json = serde_json::to_value(Message::assistant_text("done")).unwrap();
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn assistant_helpers() {
        let msg = AssistantMessage {
            text: None,
            tool_calls: vec![ToolCallBlock::new("search", serde_json::json!({}))],
        };
        assert!(msg.has_tool_calls());
        assert_eq!(msg.text_content(), "");
    }
}
