//! Canonical, backend-agnostic conversation model.
//!
//! Every provider adapter translates from these types to its own wire
//! format and back. The serialized shape follows the chat-completions
//! convention so transcripts stay readable.

use std::collections::HashSet;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

/// Typed content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Image reference: an `http(s)` URL or a `data:` URI.
    Image { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Build an inline image part from raw bytes.
    pub fn image_from_bytes(mime_type: &str, data: &[u8]) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD.encode(data);
        ContentPart::Image {
            url: format!("data:{mime_type};base64,{b64}"),
        }
    }
}

/// Message content: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl Content {
    /// Text view of the content; image parts are skipped, text parts joined by newlines.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, Content::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(t) => t.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }

    /// Parts view; plain text becomes a single text part.
    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Content::Text(t) => vec![ContentPart::text(t.clone())],
            Content::Parts(parts) => parts.clone(),
        }
    }
}

/// A model-issued request to run a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Serialized JSON arguments, kept verbatim as the backend sent them.
    pub arguments: String,
}

#[derive(Debug, Error)]
pub enum ArgumentsError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the arguments into a named-parameter map. Scalars and arrays are rejected.
    pub fn parse_arguments(&self) -> Result<Map<String, Value>, ArgumentsError> {
        let raw = if self.arguments.trim().is_empty() {
            "{}"
        } else {
            self.arguments.as_str()
        };
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            other => Err(ArgumentsError::NotAnObject(json_kind(&other))),
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome of one tool call, returned to the model as a tool message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub text: String,
}

/// Tool advertisement sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, rename = "name", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Provider-specific copy of the raw assistant output, replayed verbatim when possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}

impl Message {
    fn with_role(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_name: None,
            tool_call_id: None,
            envelope: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, Content::Text(text.into()))
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::with_role(Role::User, Content::Parts(parts))
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, Content::Text(text.into()))
        }
    }

    pub fn tool(result: ToolCallResult, tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            tool_call_id: Some(result.call_id),
            ..Self::with_role(Role::Tool, Content::Text(result.text))
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Drop tool messages that do not answer a tool call of an earlier assistant message.
///
/// Backends reject such orphans, which can appear after history truncation.
pub fn sanitize_for_tools(messages: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cleaned = Vec::with_capacity(messages.len());

    for m in messages {
        match m.role {
            Role::Assistant => {
                for tc in &m.tool_calls {
                    if !tc.id.is_empty() {
                        seen.insert(tc.id.as_str());
                    }
                }
                cleaned.push(m.clone());
            }
            Role::Tool => match m.tool_call_id.as_deref() {
                Some(id) if seen.contains(id) => cleaned.push(m.clone()),
                _ => {
                    tracing::debug!(tool_call_id = ?m.tool_call_id, "Dropping orphan tool message");
                }
            },
            Role::System | Role::User => cleaned.push(m.clone()),
        }
    }

    cleaned
}

pub const SECRET_DISPLAY: &str = "[SECRET]";
const MASKED_REPLY: &str = "********";

/// Copy of `message` that is safe to persist: secret human replies are masked.
pub fn masked_for_log(message: &Message) -> Message {
    let mut out = message.clone();
    if out.role != Role::Tool {
        return out;
    }
    let Content::Text(text) = &out.content else {
        return out;
    };
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return out;
    }
    if let Ok(Value::Object(mut payload)) = serde_json::from_str::<Value>(trimmed) {
        let is_secret = payload.get("display_reply").and_then(Value::as_str) == Some(SECRET_DISPLAY);
        if is_secret && payload.contains_key("user_reply") {
            payload.insert("user_reply".into(), Value::String(MASKED_REPLY.into()));
            out.content = Content::Text(Value::Object(payload).to_string());
        }
    }
    out
}

/// Compact JSON with object keys sorted at every level, for hashing and cache keys.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for k in keys {
                    out.insert(k.clone(), sorted(&map[k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [{"d": 1, "c": 2}]}});
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[{"c":2,"d":1}],"z":true},"b":1}"#);
    }

    #[test]
    fn test_parse_arguments_object() {
        let call = ToolCallRequest::new("c1", "calculator", r#"{"expression":"2+2"}"#);
        let args = call.parse_arguments().unwrap();
        assert_eq!(args["expression"], "2+2");
    }

    #[test]
    fn test_parse_arguments_rejects_scalar_and_list() {
        let scalar = ToolCallRequest::new("c1", "f", "42");
        assert!(matches!(scalar.parse_arguments(), Err(ArgumentsError::NotAnObject("number"))));

        let list = ToolCallRequest::new("c1", "f", "[1,2]");
        assert!(matches!(list.parse_arguments(), Err(ArgumentsError::NotAnObject("array"))));

        let broken = ToolCallRequest::new("c1", "f", "{\"a\":");
        assert!(matches!(broken.parse_arguments(), Err(ArgumentsError::Json(_))));
    }

    #[test]
    fn test_empty_arguments_are_empty_object() {
        let call = ToolCallRequest::new("c1", "f", "");
        assert!(call.parse_arguments().unwrap().is_empty());
    }

    #[test]
    fn test_sanitize_drops_orphan_tool_messages() {
        let history = vec![
            Message::system("sys"),
            Message::tool(
                ToolCallResult { call_id: "ghost".into(), text: "stale".into() },
                "f",
            ),
            Message::user("hi"),
            Message::assistant("", vec![ToolCallRequest::new("call_1", "f", "{}")]),
            Message::tool(
                ToolCallResult { call_id: "call_1".into(), text: "ok".into() },
                "f",
            ),
        ];
        let cleaned = sanitize_for_tools(&history);
        assert_eq!(cleaned.len(), 4);
        assert!(cleaned.iter().all(|m| m.tool_call_id.as_deref() != Some("ghost")));
        assert_eq!(cleaned[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_tool_message_serializes_name_field() {
        let msg = Message::tool(
            ToolCallResult { call_id: "call_9".into(), text: "4".into() },
            "calculator",
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["name"], "calculator");
        assert_eq!(v["tool_call_id"], "call_9");
        assert_eq!(v["content"], "4");
        assert!(v.get("tool_calls").is_none());
    }

    #[test]
    fn test_content_parts_text_view() {
        let content = Content::Parts(vec![
            ContentPart::text("look"),
            ContentPart::image_from_bytes("image/png", b"png"),
            ContentPart::text("here"),
        ]);
        assert_eq!(content.as_text(), "look\nhere");
        assert!(content.has_images());
        match &content.parts()[1] {
            ContentPart::Image { url } => assert!(url.starts_with("data:image/png;base64,")),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn test_masked_for_log_hides_secret_reply() {
        let payload = json!({
            "tool": "human_ask",
            "message": "token?",
            "user_reply": "hunter2",
            "display_reply": "[SECRET]",
            "cancelled": false,
        });
        let msg = Message::tool(
            ToolCallResult { call_id: "c".into(), text: payload.to_string() },
            "human_ask",
        );
        let masked = masked_for_log(&msg);
        assert!(!masked.text().contains("hunter2"));
        assert!(masked.text().contains("********"));
        // The live message keeps the real reply.
        assert!(msg.text().contains("hunter2"));
    }

    #[test]
    fn test_masked_for_log_leaves_plain_replies() {
        let payload = json!({"tool": "human_ask", "user_reply": "yes", "display_reply": "yes"});
        let msg = Message::tool(
            ToolCallResult { call_id: "c".into(), text: payload.to_string() },
            "human_ask",
        );
        assert_eq!(masked_for_log(&msg), msg);
    }
}
