//! Google Generative AI (Gemini) adapter.
//!
//! Uses the `generateContent` REST endpoint. The model's raw `content`
//! object is kept as the message envelope and replayed verbatim, which
//! preserves thought signatures across tool rounds.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tooldrive_core::message::{ContentPart, Message, Role, ToolCallRequest, ToolSpec};
use tracing::debug;

use crate::schema::{object_schema_or_empty, sanitize_gemini_parameters};
use crate::{AssistantTurn, CacheBackend, DeltaSink, ModelApi, ProviderAdapter, ProviderError, TurnRequest, check_status};

/// Lets replayed function calls without a recorded signature pass validation.
const SKIP_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

pub struct GeminiAdapter {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn model_path(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Append a part, merging into the previous turn when the role repeats.
fn push_part(contents: &mut Vec<Value>, role: &str, part: Value) {
    if let Some(last) = contents.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(parts) = last.get_mut("parts").and_then(Value::as_array_mut) {
                parts.push(part);
                return;
            }
        }
    }
    contents.push(json!({"role": role, "parts": [part]}));
}

fn image_part(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return json!({"inlineData": {"mimeType": mime, "data": data}});
        }
    }
    json!({"fileData": {"fileUri": url}})
}

fn function_response(name: &str, text: &str) -> Value {
    let response = match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(obj)) => Value::Object(obj),
        _ => json!({"content": text}),
    };
    json!({"functionResponse": {"name": name, "response": response}})
}

/// Build `(systemInstruction text, contents)` from the history.
pub fn gemini_contents(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                let text = m.text();
                if !text.trim().is_empty() {
                    system.push(text.trim().to_string());
                }
            }
            Role::User => {
                for part in m.content.parts() {
                    match part {
                        ContentPart::Text { text } if text.trim().is_empty() => {}
                        ContentPart::Text { text } => push_part(&mut contents, "user", json!({"text": text})),
                        ContentPart::Image { url } => push_part(&mut contents, "user", image_part(&url)),
                    }
                }
            }
            Role::Assistant => {
                if let Some(envelope) = m.envelope.as_ref().filter(|e| e.get("parts").is_some()) {
                    contents.push(envelope.clone());
                    continue;
                }
                let text = m.text();
                if !text.trim().is_empty() {
                    push_part(&mut contents, "model", json!({"text": text}));
                }
                for (i, tc) in m.tool_calls.iter().enumerate() {
                    let args = tc.parse_arguments().map(Value::Object).unwrap_or_else(|_| json!({}));
                    let mut part = json!({"functionCall": {"name": tc.name, "args": args}});
                    if i == 0 {
                        part["thoughtSignature"] = json!(SKIP_THOUGHT_SIGNATURE);
                    }
                    push_part(&mut contents, "model", part);
                }
            }
            Role::Tool => {
                let name = m.tool_name.as_deref().filter(|n| !n.is_empty()).unwrap_or("tool");
                push_part(&mut contents, "user", function_response(name, &m.text()));
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, contents)
}

/// `tools` entry holding every function declaration.
pub fn gemini_tools(tools: &[ToolSpec]) -> Value {
    let decls: Vec<Value> = tools
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": sanitize_gemini_parameters(&object_schema_or_empty(&t.parameters)),
            })
        })
        .collect();
    json!([{"functionDeclarations": decls}])
}

fn args_string(args: Option<&Value>) -> String {
    match args {
        Some(Value::Object(obj)) => Value::Object(obj.clone()).to_string(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => v.to_string(),
            _ => json!({"_raw": raw}).to_string(),
        },
        _ => "{}".to_string(),
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> &str {
        "gemini"
    }

    fn api(&self) -> ModelApi {
        ModelApi::GoogleGenerativeAi
    }

    fn build_request(&self, request: &TurnRequest) -> Value {
        let (system, mut contents) = gemini_contents(&request.messages);
        if contents.is_empty() && request.cached_content.is_none() {
            contents.push(json!({"role": "user", "parts": [{"text": ""}]}));
        }

        let mut body = json!({"contents": contents});
        if let Some(handle) = &request.cached_content {
            body["cachedContent"] = json!(handle);
            return body;
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = gemini_tools(tools);
            body["toolConfig"] = json!({"functionCallingConfig": {"mode": "AUTO"}});
        }
        if let Some(system) = system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }

    fn parse_response(&self, body: &Value) -> AssistantTurn {
        let Some(content) = body.pointer("/candidates/0/content").filter(|c| c.is_object()) else {
            return AssistantTurn::default();
        };

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in content
            .get("parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(fc) = part.get("functionCall") {
                if let Some(name) = fc.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()) {
                    let id = format!("gemini_fc_{}", tool_calls.len() + 1);
                    tool_calls.push(ToolCallRequest::new(id, name, args_string(fc.get("args"))));
                }
            }
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                if !is_thought {
                    text.push_str(t);
                }
            }
        }

        AssistantTurn {
            text,
            tool_calls,
            envelope: Some(content.clone()),
        }
    }

    async fn complete(
        &self,
        request: &TurnRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<AssistantTurn, ProviderError> {
        let body = self.build_request(request);
        let url = self.url(&format!("{}:generateContent", Self::model_path(&request.model)));
        debug!(
            provider = "gemini",
            model = %request.model,
            cached = request.cached_content.is_some(),
            "Sending generateContent request"
        );

        let response = self
            .client
            .post(url)
            .query(&[("key", &self.api_key)])
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let turn = self.parse_response(&value);
        if request.stream && !turn.text.is_empty() {
            on_delta(&turn.text);
        }
        Ok(turn)
    }

    fn cache_backend(&self) -> Option<&dyn CacheBackend> {
        Some(self)
    }
}

#[async_trait]
impl CacheBackend for GeminiAdapter {
    async fn create_cache(
        &self,
        model: &str,
        system_instruction: &str,
        tools: &[ToolSpec],
        documents: &[String],
        ttl_secs: u64,
    ) -> Result<String, ProviderError> {
        let mut body = Map::new();
        body.insert("model".into(), json!(Self::model_path(model)));
        body.insert("ttl".into(), json!(format!("{ttl_secs}s")));
        if !system_instruction.trim().is_empty() {
            body.insert(
                "systemInstruction".into(),
                json!({"parts": [{"text": system_instruction}]}),
            );
        }
        if !tools.is_empty() {
            body.insert("tools".into(), gemini_tools(tools));
        }
        if !documents.is_empty() {
            let parts: Vec<Value> = documents.iter().map(|d| json!({"text": d})).collect();
            body.insert("contents".into(), json!([{"role": "user", "parts": parts}]));
        }

        let response = self
            .client
            .post(self.url("cachedContents"))
            .query(&[("key", &self.api_key)])
            .json(&Value::Object(body))
            .send()
            .await?;
        let response = check_status(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        value
            .get("name")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::Decode("cachedContents response has no name".into()))
    }

    async fn delete_cache(&self, handle: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.url(handle))
            .query(&[("key", &self.api_key)])
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tooldrive_core::message::ToolCallResult;

    use super::*;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new("https://generativelanguage.googleapis.com/v1beta/", "k")
    }

    fn tool_msg(id: &str, name: &str, text: &str) -> Message {
        Message::tool(
            ToolCallResult {
                call_id: id.into(),
                text: text.into(),
            },
            name,
        )
    }

    #[test]
    fn test_contents_roles_and_merging() {
        let history = vec![
            Message::system("sys one"),
            Message::system("sys two"),
            Message::user("hello"),
            Message::user("again"),
            Message::assistant(
                "checking",
                vec![
                    ToolCallRequest::new("c1", "read_file", r#"{"filename":"a.txt"}"#),
                    ToolCallRequest::new("c2", "calculator", "not json"),
                ],
            ),
            tool_msg("c1", "read_file", r#"{"ok": true}"#),
            tool_msg("c2", "calculator", "4"),
        ];
        let (system, contents) = gemini_contents(&history);
        assert_eq!(system.as_deref(), Some("sys one\n\nsys two"));
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);

        let model_parts = contents[1]["parts"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(model_parts[1]["functionCall"]["args"]["filename"], "a.txt");
        assert_eq!(model_parts[1]["thoughtSignature"], SKIP_THOUGHT_SIGNATURE);
        assert_eq!(model_parts[2]["functionCall"]["args"], json!({}));
        assert!(model_parts[2].get("thoughtSignature").is_none());

        let responses = contents[2]["parts"].as_array().unwrap();
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(responses[0]["functionResponse"]["response"], json!({"ok": true}));
        assert_eq!(responses[1]["functionResponse"]["response"], json!({"content": "4"}));
    }

    #[test]
    fn test_envelope_is_replayed_verbatim() {
        let envelope = json!({"role": "model", "parts": [{"functionCall": {"name": "f", "args": {}}, "thoughtSignature": "abc"}]});
        let mut assistant = Message::assistant("", vec![ToolCallRequest::new("gemini_fc_1", "f", "{}")]);
        assistant.envelope = Some(envelope.clone());
        let (_, contents) = gemini_contents(&[Message::user("go"), assistant]);
        assert_eq!(contents[1], envelope);
    }

    #[test]
    fn test_inline_image_part() {
        let msg = Message::user_parts(vec![ContentPart::image_from_bytes("image/jpeg", b"jpg")]);
        let (_, contents) = gemini_contents(&[msg]);
        assert_eq!(contents[0]["parts"][0]["inlineData"]["mimeType"], "image/jpeg");
    }

    #[test]
    fn test_cached_content_replaces_tools_and_system() {
        let tools = vec![ToolSpec {
            name: "f".into(),
            description: "d".into(),
            parameters: json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
        }];
        let history = vec![Message::system("sys"), Message::user("hi")];

        let plain = adapter().build_request(
            &TurnRequest::new("gemini-1.5-flash", history.clone()).with_tools(Some(tools.clone())),
        );
        assert_eq!(plain["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(
            plain["tools"][0]["functionDeclarations"][0]["parameters"]["properties"]["x"]["type"],
            "INTEGER"
        );

        let cached = adapter().build_request(
            &TurnRequest::new("gemini-1.5-flash", history)
                .with_tools(Some(tools))
                .with_cached_content(Some("cachedContents/abc".into())),
        );
        assert_eq!(cached["cachedContent"], "cachedContents/abc");
        assert!(cached.get("tools").is_none());
        assert!(cached.get("systemInstruction").is_none());
    }

    #[test]
    fn test_null_tool_schema_becomes_empty_object() {
        let tools = vec![ToolSpec {
            name: "f".into(),
            description: "d".into(),
            parameters: Value::Null,
        }];
        let body = adapter().build_request(
            &TurnRequest::new("gemini-1.5-flash", vec![Message::user("hi")]).with_tools(Some(tools)),
        );
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["parameters"],
            json!({"type": "OBJECT", "properties": {}})
        );
    }

    #[test]
    fn test_empty_history_gets_placeholder_turn() {
        let body = adapter().build_request(&TurnRequest::new("m", vec![]));
        assert_eq!(body["contents"], json!([{"role": "user", "parts": [{"text": ""}]}]));
    }

    #[test]
    fn test_parse_response_synthesizes_ids() {
        let body = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "thinking...", "thought": true},
                        {"text": "Let me look."},
                        {"functionCall": {"name": "read_file", "args": {"filename": "x"}}},
                        {"functionCall": {"name": "calculator", "args": "{\"expression\":\"1\"}"}}
                    ]
                }
            }]
        });
        let turn = adapter().parse_response(&body);
        assert_eq!(turn.text, "Let me look.");
        assert_eq!(turn.tool_calls[0].id, "gemini_fc_1");
        assert_eq!(turn.tool_calls[1].id, "gemini_fc_2");
        assert_eq!(turn.tool_calls[1].arguments, r#"{"expression":"1"}"#);
        assert_eq!(turn.envelope.unwrap()["role"], "model");
    }

    #[test]
    fn test_parse_response_without_candidates() {
        let turn = adapter().parse_response(&json!({"promptFeedback": {}}));
        assert_eq!(turn, AssistantTurn::default());
    }
}
