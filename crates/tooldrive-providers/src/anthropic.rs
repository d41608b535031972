//! Anthropic Messages API adapter.

use async_trait::async_trait;
use serde_json::{Value, json};
use tooldrive_core::message::{ContentPart, Message, Role, ToolCallRequest, ToolSpec};
use tracing::debug;

use crate::openai::fallback_call_id;
use crate::schema::object_schema_or_empty;
use crate::{AssistantTurn, DeltaSink, ModelApi, ProviderAdapter, ProviderError, TurnRequest, check_status};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

fn push_block(turns: &mut Vec<Value>, role: &str, block: Value) {
    if let Some(last) = turns.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.push(block);
                return;
            }
        }
    }
    turns.push(json!({"role": role, "content": [block]}));
}

fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return json!({"type": "image", "source": {"type": "base64", "media_type": mime, "data": data}});
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

/// Split the history into the system prompt and alternating message turns.
pub fn anthropic_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system = Vec::new();
    let mut turns: Vec<Value> = Vec::new();
    let mut marked = false;

    for m in messages {
        match m.role {
            Role::System => {
                let text = m.text();
                if !text.trim().is_empty() {
                    system.push(text);
                }
            }
            Role::User => {
                for part in m.content.parts() {
                    let block = match part {
                        ContentPart::Text { text } if text.is_empty() => continue,
                        ContentPart::Text { text } => {
                            let mut block = json!({"type": "text", "text": text});
                            if !marked {
                                block["cache_control"] = json!({"type": "ephemeral"});
                                marked = true;
                            }
                            block
                        }
                        ContentPart::Image { url } => image_block(&url),
                    };
                    push_block(&mut turns, "user", block);
                }
            }
            Role::Assistant => {
                let text = m.text();
                if !text.is_empty() {
                    push_block(&mut turns, "assistant", json!({"type": "text", "text": text}));
                }
                for tc in &m.tool_calls {
                    let input = tc.parse_arguments().map(Value::Object).unwrap_or_else(|_| json!({}));
                    push_block(
                        &mut turns,
                        "assistant",
                        json!({"type": "tool_use", "id": tc.id, "name": tc.name, "input": input}),
                    );
                }
            }
            Role::Tool => {
                let id = m.tool_call_id.clone().unwrap_or_default();
                push_block(
                    &mut turns,
                    "user",
                    json!({"type": "tool_result", "tool_use_id": id, "content": m.text()}),
                );
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

pub fn anthropic_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": object_schema_or_empty(&t.parameters),
            })
        })
        .collect()
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        "claude"
    }

    fn api(&self) -> ModelApi {
        ModelApi::AnthropicMessages
    }

    fn build_request(&self, request: &TurnRequest) -> Value {
        let (system, messages) = anthropic_messages(&request.messages);
        let mut body = json!({
            "model": request.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!([{
                "type": "text",
                "text": system,
                "cache_control": {"type": "ephemeral"}
            }]);
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = json!(anthropic_tools(tools));
        }
        body
    }

    fn parse_response(&self, body: &Value) -> AssistantTurn {
        let mut turn = AssistantTurn::default();
        for block in body["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => turn.text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => {
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    let id = block["id"]
                        .as_str()
                        .filter(|s| !s.is_empty())
                        .map_or_else(fallback_call_id, str::to_string);
                    turn.tool_calls.push(ToolCallRequest::new(
                        id,
                        block["name"].as_str().unwrap_or_default(),
                        input.to_string(),
                    ));
                }
                _ => {}
            }
        }
        turn
    }

    async fn complete(
        &self,
        request: &TurnRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<AssistantTurn, ProviderError> {
        let body = self.build_request(request);
        debug!(provider = "claude", model = %request.model, "Sending messages request");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
}
