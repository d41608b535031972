//! OpenAI Chat Completions API adapter.
//!
//! Serves OpenAI, Azure OpenAI, OpenRouter, xAI Grok and NVIDIA, which all
//! speak the `/chat/completions` dialect with small differences in URL
//! layout and headers (see [`Endpoint`]).

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tooldrive_core::config::ProviderKind;
use tooldrive_core::message::{Content, ContentPart, Message, Role, ToolCallRequest, ToolSpec};
use tracing::{debug, trace};

use crate::schema::object_schema_or_empty;
use crate::sse::{SseEvent, parse_sse_stream};
use crate::{AssistantTurn, DeltaSink, ModelApi, ProviderAdapter, ProviderError, TurnRequest, check_status};

const OPENROUTER_AUTO_MODEL: &str = "openrouter/auto";
const OPENROUTER_REFERER: &str = "https://localhost/agent";
const OPENROUTER_TITLE: &str = "tooldrive";

/// API style: determines URL layout and auth headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    Azure,
    OpenRouter,
    Grok,
    Nvidia,
}

/// Where and how to reach an OpenAI-compatible service.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub style: ApiStyle,
    pub base_url: String,
    api_key: String,
    api_version: Option<String>,
}

impl Endpoint {
    pub fn new(style: ApiStyle, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            style,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_version: None,
        }
    }

    pub fn azure(base_url: &str, api_key: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            api_version: Some(api_version.into()),
            ..Self::new(ApiStyle::Azure, base_url, api_key)
        }
    }

    pub fn for_kind(
        kind: ProviderKind,
        base_url: String,
        api_key: String,
        api_version: Option<String>,
    ) -> anyhow::Result<Self> {
        let style = match kind {
            ProviderKind::OpenAi => ApiStyle::OpenAi,
            ProviderKind::OpenRouter => ApiStyle::OpenRouter,
            ProviderKind::Grok => ApiStyle::Grok,
            ProviderKind::Nvidia => ApiStyle::Nvidia,
            ProviderKind::Azure => {
                let version = api_version
                    .ok_or_else(|| anyhow::anyhow!("Azure requires UAGENT_AZURE_API_VERSION"))?;
                return Ok(Self::azure(&base_url, api_key, version));
            }
            ProviderKind::Gemini | ProviderKind::Claude => {
                anyhow::bail!("'{kind}' does not speak the OpenAI API")
            }
        };
        Ok(Self::new(style, &base_url, api_key))
    }

    pub fn id(&self) -> &'static str {
        match self.style {
            ApiStyle::OpenAi => "openai",
            ApiStyle::Azure => "azure",
            ApiStyle::OpenRouter => "openrouter",
            ApiStyle::Grok => "grok",
            ApiStyle::Nvidia => "nvidia",
        }
    }

    fn api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or_default()
    }

    pub fn chat_url(&self, model: &str) -> String {
        match self.style {
            ApiStyle::Azure => format!(
                "{}/openai/deployments/{model}/chat/completions?api-version={}",
                self.base_url,
                self.api_version()
            ),
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    pub fn responses_url(&self) -> String {
        match self.style {
            ApiStyle::Azure => format!(
                "{}/openai/responses?api-version={}",
                self.base_url,
                self.api_version()
            ),
            _ => format!("{}/responses", self.base_url),
        }
    }

    pub fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("content-type", "application/json");
        match self.style {
            ApiStyle::Azure => builder.header("api-key", &self.api_key),
            ApiStyle::OpenRouter => builder
                .header("authorization", format!("Bearer {}", self.api_key))
                .header("HTTP-Referer", OPENROUTER_REFERER)
                .header("X-Title", OPENROUTER_TITLE),
            _ => builder.header("authorization", format!("Bearer {}", self.api_key)),
        }
    }
}

// --- streaming chunk types ---

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

pub struct OpenAiAdapter {
    endpoint: Endpoint,
    fallback_models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(endpoint: Endpoint, fallback_models: Vec<String>) -> Self {
        Self {
            endpoint,
            fallback_models,
            client: reqwest::Client::new(),
        }
    }
}

/// Convert canonical messages into chat-completions messages.
pub fn chat_messages(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(chat_message).collect()
}

fn chat_message(m: &Message) -> Value {
    match m.role {
        Role::System => json!({"role": "system", "content": m.text()}),
        Role::User => json!({"role": "user", "content": user_content(&m.content)}),
        Role::Assistant => {
            let mut msg = json!({"role": "assistant"});
            let text = m.text();
            msg["content"] = if text.is_empty() && !m.tool_calls.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            if !m.tool_calls.is_empty() {
                msg["tool_calls"] = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments},
                        })
                    })
                    .collect();
            }
            msg
        }
        Role::Tool => {
            let mut msg = json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.text(),
            });
            if let Some(name) = &m.tool_name {
                msg["name"] = json!(name);
            }
            msg
        }
    }
}

fn user_content(content: &Content) -> Value {
    match content {
        Content::Text(t) => Value::String(t.clone()),
        Content::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { url } => json!({"type": "image_url", "image_url": {"url": url}}),
            })
            .collect(),
    }
}

/// Tools wrapped as `{type: function, function: {...}}`.
pub fn chat_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": object_schema_or_empty(&t.parameters),
                }
            })
        })
        .collect()
}

pub(crate) fn fallback_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// `arguments` may arrive as a JSON string or (from some gateways) an object.
fn arguments_string(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Upper bound on tool-call slots in one streamed reply.
const MAX_STREAM_TOOL_CALLS: usize = 128;

/// Drain an SSE stream of chat-completion chunks into a turn.
pub(crate) async fn collect_chat_stream<S>(
    sse: S,
    on_delta: &mut DeltaSink<'_>,
) -> Result<AssistantTurn, ProviderError>
where
    S: Stream<Item = Result<SseEvent, ProviderError>>,
{
    let mut sse = std::pin::pin!(sse);
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();

    while let Some(event) = sse.next().await {
        let event = event?;
        if event.is_done() {
            break;
        }
        let chunk: ChatCompletionChunk = match serde_json::from_str(event.data.trim()) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, data = %event.data, "Failed to parse chat completion chunk");
                continue;
            }
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            continue;
        };

        if let Some(deltas) = choice.delta.tool_calls {
            for tc in deltas {
                if tc.index >= MAX_STREAM_TOOL_CALLS {
                    return Err(ProviderError::Decode(format!(
                        "tool call index {} exceeds limit of {MAX_STREAM_TOOL_CALLS}",
                        tc.index
                    )));
                }
                if tool_calls.len() <= tc.index {
                    tool_calls.resize_with(tc.index + 1, Default::default);
                }
                let acc = &mut tool_calls[tc.index];
                if let Some(id) = tc.id.filter(|s| !s.is_empty()) {
                    acc.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name.filter(|s| !s.is_empty()) {
                        acc.name = name;
                    }
                    if let Some(args) = f.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
        }

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            on_delta(&content);
            text.push_str(&content);
        }
    }

    let tool_calls = tool_calls
        .into_iter()
        .filter(|tc| !tc.name.is_empty() || !tc.arguments.is_empty())
        .map(|tc| {
            ToolCallRequest::new(
                if tc.id.is_empty() { fallback_call_id() } else { tc.id },
                if tc.name.is_empty() { "unknown".to_string() } else { tc.name },
                if tc.arguments.is_empty() { "{}".to_string() } else { tc.arguments },
            )
        })
        .collect();

    Ok(AssistantTurn {
        text,
        tool_calls,
        envelope: None,
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        self.endpoint.id()
    }

    fn api(&self) -> ModelApi {
        ModelApi::OpenAiCompletions
    }

    fn build_request(&self, request: &TurnRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": chat_messages(&request.messages),
            "stream": request.stream,
        });
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(chat_tools(tools));
            body["tool_choice"] = json!("auto");
        }
        if self.endpoint.style == ApiStyle::OpenRouter
            && request.model == OPENROUTER_AUTO_MODEL
            && !self.fallback_models.is_empty()
        {
            body["models"] = json!(self.fallback_models);
        }
        body
    }

    fn parse_response(&self, body: &Value) -> AssistantTurn {
        let message = &body["choices"][0]["message"];
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .map(|tc| {
                        let id = tc
                            .get("id")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .unwrap_or_else(fallback_call_id);
                        let name = tc["function"]
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        ToolCallRequest::new(id, name, arguments_string(tc["function"].get("arguments")))
                    })
                    .collect()
            })
            .unwrap_or_default();

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
        let url = self.endpoint.chat_url(&request.model);
        debug!(
            provider = self.id(),
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .endpoint
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        if request.stream {
            collect_chat_stream(parse_sse_stream(response), on_delta).await
        } else {
            let value: Value = response
                .json()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            Ok(self.parse_response(&value))
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tooldrive_core::message::ToolCallResult;

    use super::*;
    use crate::sse::parse_sse_bytes;

    fn adapter(style: ApiStyle) -> OpenAiAdapter {
        OpenAiAdapter::new(Endpoint::new(style, "https://api.example.com/v1/", "sk"), vec![])
    }

    fn spec() -> ToolSpec {
        ToolSpec {
            name: "calculator".into(),
            description: "Evaluate".into(),
            parameters: json!({"type": "object", "properties": {"expression": {"type": "string"}}}),
        }
    }

    #[test]
    fn test_urls_per_style() {
        let plain = Endpoint::new(ApiStyle::OpenAi, "https://api.openai.com/v1/", "k");
        assert_eq!(plain.chat_url("gpt"), "https://api.openai.com/v1/chat/completions");
        assert_eq!(plain.responses_url(), "https://api.openai.com/v1/responses");

        let azure = Endpoint::azure("https://res.openai.azure.com", "k", "2025-04-01-preview");
        assert_eq!(
            azure.chat_url("dep"),
            "https://res.openai.azure.com/openai/deployments/dep/chat/completions?api-version=2025-04-01-preview"
        );
        assert_eq!(
            azure.responses_url(),
            "https://res.openai.azure.com/openai/responses?api-version=2025-04-01-preview"
        );
    }

    #[test]
    fn test_azure_endpoint_needs_version() {
        assert!(
            Endpoint::for_kind(ProviderKind::Azure, "https://x".into(), "k".into(), None).is_err()
        );
        assert!(
            Endpoint::for_kind(ProviderKind::Gemini, "https://x".into(), "k".into(), None).is_err()
        );
    }

    #[test]
    fn test_build_request_wraps_tools() {
        let req = TurnRequest::new("gpt-5.2", vec![Message::user("hi")]).with_tools(Some(vec![spec()]));
        let body = adapter(ApiStyle::OpenAi).build_request(&req);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "calculator");
        assert!(body["tools"][0].get("input_schema").is_none());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_null_tool_schema_becomes_empty_object() {
        let mut tool = spec();
        tool.parameters = Value::Null;
        let req = TurnRequest::new("gpt-5.2", vec![Message::user("hi")]).with_tools(Some(vec![tool]));
        let body = adapter(ApiStyle::OpenAi).build_request(&req);
        assert_eq!(
            body["tools"][0]["function"]["parameters"],
            json!({"type": "object", "properties": {}})
        );
    }

    #[test]
    fn test_build_request_without_tools() {
        let req = TurnRequest::new("gpt-5.2", vec![Message::user("hi")]).with_tools(None);
        let body = adapter(ApiStyle::OpenAi).build_request(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_openrouter_auto_adds_fallback_models() {
        let adapter = OpenAiAdapter::new(
            Endpoint::new(ApiStyle::OpenRouter, "https://openrouter.ai/api/v1", "k"),
            vec!["a/b".into(), "c/d".into()],
        );
        let auto = adapter.build_request(&TurnRequest::new("openrouter/auto", vec![]));
        assert_eq!(auto["models"], json!(["a/b", "c/d"]));
        let fixed = adapter.build_request(&TurnRequest::new("a/b", vec![]));
        assert!(fixed.get("models").is_none());
    }

    #[test]
    fn test_history_conversion() {
        let history = vec![
            Message::system("be brief"),
            Message::user_parts(vec![
                ContentPart::text("What is this?"),
                ContentPart::image_from_bytes("image/png", b"png"),
            ]),
            Message::assistant("", vec![ToolCallRequest::new("call_1", "calculator", r#"{"expression":"1+1"}"#)]),
            Message::tool(
                ToolCallResult {
                    call_id: "call_1".into(),
                    text: "2".into(),
                },
                "calculator",
            ),
        ];
        let msgs = chat_messages(&history);
        assert_eq!(msgs[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(msgs[1]["content"][1]["type"], "image_url");
        assert!(
            msgs[1]["content"][1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
        assert!(msgs[2]["content"].is_null());
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["arguments"], r#"{"expression":"1+1"}"#);
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["tool_call_id"], "call_1");
        assert_eq!(msgs[3]["name"], "calculator");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_a", "type": "function", "function": {"name": "f", "arguments": "{\"x\":1}"}},
                        {"type": "function", "function": {"name": "g", "arguments": {"y": 2}}}
                    ]
                }
            }]
        });
        let turn = adapter(ApiStyle::Grok).parse_response(&body);
        assert_eq!(turn.text, "");
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(turn.tool_calls[1].arguments, r#"{"y":2}"#);
        assert!(turn.tool_calls[1].id.starts_with("call_"));
    }

    #[test]
    fn test_parse_response_text_only() {
        let body = json!({"choices": [{"message": {"content": "4"}}]});
        let turn = adapter(ApiStyle::Nvidia).parse_response(&body);
        assert_eq!(turn.text, "4");
        assert!(turn.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_stream_accumulates_by_index() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Let me \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"check.\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"calculator\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_2\",\"function\":{\"name\":\"read_file\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"expression\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"2+2\\\"}\"}}]}}]}\n\n",
            "data: not json\n\n",
            "data: [DONE]\n\n",
        );
        let stream = parse_sse_bytes(futures::stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from_static(raw.as_bytes()),
        )]));

        let mut deltas = Vec::new();
        let mut on_delta = |d: &str| deltas.push(d.to_string());
        let turn = collect_chat_stream(stream, &mut on_delta).await.unwrap();

        assert_eq!(deltas, vec!["Let me ", "check."]);
        assert_eq!(turn.text, "Let me check.");
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "call_1");
        assert_eq!(turn.tool_calls[0].arguments, r#"{"expression":"2+2"}"#);
        assert_eq!(turn.tool_calls[1].name, "read_file");
    }

    #[tokio::test]
    async fn test_stream_rejects_huge_tool_call_index() {
        let raw = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":4000000000,\"function\":{\"name\":\"f\"}}]}}]}\n\n";
        let stream = parse_sse_bytes(futures::stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from_static(raw.as_bytes()),
        )]));

        let mut on_delta = |_: &str| {};
        let err = collect_chat_stream(stream, &mut on_delta).await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }
}
