//! OpenAI / Azure Responses API adapter.
//!
//! The Responses API has no tool role and no assistant tool-call history, so
//! the conversation is flattened: system text and a summary of earlier tool
//! calls go into `instructions`, and tool results are replayed as user turns.

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tooldrive_core::message::{Content, ContentPart, Message, Role, ToolCallRequest, ToolSpec};
use tracing::{debug, trace};

use crate::accumulator::{AccumulatorState, StreamAccumulator};
use crate::debug_dump::StreamDump;
use crate::openai::Endpoint;
use crate::schema::object_schema_or_empty;
use crate::sse::{SseEvent, parse_sse_stream};
use crate::{AssistantTurn, DeltaSink, ModelApi, ProviderAdapter, ProviderError, TurnRequest, check_status};

/// Prepended to `instructions` so the model always sends complete argument objects.
pub const TOOL_CALLING_RULES: &str = "[Tool calling rules]\n\
- When calling a tool/function, you MUST provide function_call.arguments as a JSON object.\n\
- The JSON object MUST include all required parameters defined in the tool schema.\n\
- Never call a tool with an empty object {} unless the tool has no required parameters.\n\
- If you do not have a required parameter, ask the user for it using human_ask instead of guessing.\n";

const ASSISTANT_IMAGE_WARNING: &str =
    "[WARN] assistant history contained image content; converted to text.";

pub struct ResponsesAdapter {
    endpoint: Endpoint,
    dump: StreamDump,
    client: reqwest::Client,
}

impl ResponsesAdapter {
    pub fn new(endpoint: Endpoint, dump: StreamDump) -> Self {
        Self {
            endpoint,
            dump,
            client: reqwest::Client::new(),
        }
    }
}

fn content_items(content: &Content, role: Role) -> Vec<Value> {
    let text_type = if role == Role::Assistant {
        "output_text"
    } else {
        "input_text"
    };
    let items: Vec<Value> = content
        .parts()
        .into_iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": text_type, "text": text}),
            ContentPart::Image { .. } if role == Role::Assistant => {
                json!({"type": "output_text", "text": ASSISTANT_IMAGE_WARNING})
            }
            ContentPart::Image { url } => json!({"type": "input_image", "image_url": {"url": url}}),
        })
        .collect();
    if items.is_empty() {
        vec![json!({"type": text_type, "text": ""})]
    } else {
        items
    }
}

/// Split history into `(instructions, input)`.
pub fn flatten_history(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut instructions = vec![TOOL_CALLING_RULES.to_string()];
    let mut input = Vec::new();

    for m in messages {
        match m.role {
            Role::System => instructions.push(m.text()),
            Role::Tool => {
                let name = m.tool_name.as_deref().unwrap_or("unknown");
                let text = format!("[System: Tool '{name}' returned result]\n{}", m.text());
                input.push(json!({
                    "role": "user",
                    "content": content_items(&Content::Text(text), Role::User),
                }));
            }
            Role::Assistant => {
                if !m.tool_calls.is_empty() {
                    let summary: Vec<String> = m
                        .tool_calls
                        .iter()
                        .map(|tc| format!("{}({})", tc.name, tc.arguments))
                        .collect();
                    instructions.push(format!(
                        "[System: The assistant previously executed tools: {}]",
                        summary.join(", ")
                    ));
                }
                input.push(json!({
                    "role": "assistant",
                    "content": content_items(&m.content, Role::Assistant),
                }));
            }
            Role::User => input.push(json!({
                "role": "user",
                "content": content_items(&m.content, Role::User),
            })),
        }
    }

    let joined = instructions.join("\n");
    let instructions = (!joined.trim().is_empty()).then_some(joined);
    (instructions, input)
}

/// Flat tool specs: `{type, name, description, parameters}`.
pub fn flat_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            let parameters = object_schema_or_empty(&t.parameters);
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": parameters,
            })
        })
        .collect()
}

impl ResponsesAdapter {
    async fn collect_stream<S>(
        &self,
        sse: S,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<AssistantTurn, ProviderError>
    where
        S: Stream<Item = Result<SseEvent, ProviderError>>,
    {
        let mut sse = std::pin::pin!(sse);
        let mut acc = StreamAccumulator::new();

        while let Some(event) = sse.next().await {
            let event = event?;
            if event.is_done() {
                break;
            }
            let value: Value = match serde_json::from_str(event.data.trim()) {
                Ok(v) => v,
                Err(e) => {
                    trace!(%e, data = %event.data, "Skipping non-JSON stream event");
                    continue;
                }
            };
            self.dump.record(&value).await;

            let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
            if kind == "error" || kind == "response.failed" {
                let message = value
                    .pointer("/error/message")
                    .or_else(|| value.pointer("/response/error/message"))
                    .or_else(|| value.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                return Err(ProviderError::Connection(format!("stream error: {message}")));
            }

            if let Some(delta) = acc.push(&value) {
                on_delta(&delta);
            }
            if acc.state() == AccumulatorState::Done {
                break;
            }
        }

        Ok(acc.finish())
    }
}

#[async_trait]
impl ProviderAdapter for ResponsesAdapter {
    fn id(&self) -> &str {
        self.endpoint.id()
    }

    fn api(&self) -> ModelApi {
        ModelApi::OpenAiResponses
    }

    fn build_request(&self, request: &TurnRequest) -> Value {
        let (instructions, input) = flatten_history(&request.messages);
        let mut body = json!({
            "model": request.model,
            "input": input,
            "stream": request.stream,
        });
        if let Some(instructions) = instructions {
            body["instructions"] = json!(instructions);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = Value::Array(flat_tools(tools));
            body["tool_choice"] = json!("auto");
        }
        body
    }

    fn parse_response(&self, body: &Value) -> AssistantTurn {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for item in body
            .get("output")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match item.get("type").and_then(Value::as_str) {
                Some("message") => {
                    for c in item
                        .get("content")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                    {
                        let ct = c.get("type").and_then(Value::as_str);
                        if matches!(ct, Some("output_text") | Some("text")) {
                            text.push_str(c.get("text").and_then(Value::as_str).unwrap_or_default());
                        }
                    }
                }
                Some("function_call") => {
                    let arguments = match item.get("arguments") {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => "{}".to_string(),
                        Some(other) => other.to_string(),
                    };
                    let id = item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    let name = item.get("name").and_then(Value::as_str).unwrap_or("unknown");
                    tool_calls.push(ToolCallRequest::new(id, name, arguments));
                }
                _ => {}
            }
        }

        AssistantTurn {
            text,
            tool_calls,
            envelope: None,
        }
    }

    async fn complete(
        &self,
        request: &TurnRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<AssistantTurn, ProviderError> {
        let body = self.build_request(request);
        debug!(
            provider = self.id(),
            model = %request.model,
            stream = request.stream,
            "Sending responses request"
        );

        let response = self
            .endpoint
            .authorize(self.client.post(self.endpoint.responses_url()))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        if request.stream {
            self.collect_stream(parse_sse_stream(response), on_delta).await
        } else {
            let value: Value = response
                .json()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            Ok(self.parse_response(&value))
        }
    }
}
