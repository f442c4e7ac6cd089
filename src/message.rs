use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TetherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A model-issued request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            status: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            status: Some(ToolStatus::Success),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn tool_error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            status: Some(ToolStatus::Error),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(ToolStatus::Error)
    }
}

/// Checks that every tool message answers exactly one earlier, still-open tool call.
pub fn validate_tool_pairing(messages: &[Message]) -> Result<()> {
    let mut open: HashSet<&str> = HashSet::new();
    let mut answered: HashSet<&str> = HashSet::new();

    for (idx, message) in messages.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                for call in &message.tool_calls {
                    if !open.insert(call.id.as_str()) || answered.contains(call.id.as_str()) {
                        return Err(TetherError::Protocol(format!(
                            "duplicate tool call id `{}` at message {idx}",
                            call.id
                        )));
                    }
                }
            }
            Role::Tool => {
                let id = message.tool_call_id.as_deref().ok_or_else(|| {
                    TetherError::Protocol(format!("tool message {idx} has no tool_call_id"))
                })?;
                if !open.remove(id) {
                    return Err(TetherError::Protocol(format!(
                        "tool message {idx} answers unknown or already answered call `{id}`"
                    )));
                }
                answered.insert(id);
            }
            Role::System | Role::User => {}
        }
    }

    Ok(())
}

/// Renders messages as `Prefix: content` lines.
pub fn to_buffer_string(messages: &[Message], human_prefix: &str, ai_prefix: &str) -> String {
    messages
        .iter()
        .map(|message| {
            let prefix = match message.role {
                Role::System => "System",
                Role::User => human_prefix,
                Role::Assistant => ai_prefix,
                Role::Tool => "Tool",
            };
            format!("{prefix}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairing_accepts_answered_calls() {
        let messages = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCall::new("a", "calc", json!({})),
                    ToolCall::new("b", "calc", json!({})),
                ],
            ),
            Message::tool_result("a", "1"),
            Message::tool_error("b", "boom"),
            Message::assistant("done"),
        ];
        validate_tool_pairing(&messages).unwrap();
    }

    #[test]
    fn pairing_rejects_orphans_and_duplicates() {
        let orphan = vec![Message::user("hi"), Message::tool_result("x", "1")];
        assert!(validate_tool_pairing(&orphan).is_err());

        let twice = vec![
            Message::assistant_with_tool_calls("", vec![ToolCall::new("a", "t", json!({}))]),
            Message::tool_result("a", "1"),
            Message::tool_result("a", "2"),
        ];
        assert!(validate_tool_pairing(&twice).is_err());
    }

    #[test]
    fn serializes_without_empty_fields() {
        let raw = serde_json::to_string(&Message::user("hello")).unwrap();
        assert_eq!(raw, r#"{"role":"user","content":"hello"}"#);

        let back: Message = serde_json::from_str(
            r#"{"role":"tool","content":"4","tool_call_id":"a","status":"success"}"#,
        )
        .unwrap();
        assert_eq!(back, Message::tool_result("a", "4"));
    }

    #[test]
    fn buffer_string_uses_prefixes() {
        let text = to_buffer_string(
            &[Message::user("hello"), Message::assistant("hi")],
            "User",
            "Assistant",
        );
        assert_eq!(text, "User: hello\nAssistant: hi");
    }
}
