//! LLM provider abstraction.
//!
//! Each backend implements [`ProviderAdapter`], translating the canonical
//! history into its wire format and the reply back into an [`AssistantTurn`].
//! [`AdapterFactory`] builds adapters from configuration; a fresh adapter is
//! requested after every quota error.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tooldrive_core::config::{Config, ProviderKind};
use tooldrive_core::message::{Message, ToolCallRequest, ToolSpec};

pub mod accumulator;
pub mod anthropic;
pub mod cache;
pub mod debug_dump;
pub mod gemini;
pub mod openai;
pub mod responses;
pub mod retry;
pub mod schema;
pub mod sse;

/// Wire protocols spoken by the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelApi {
    OpenAiCompletions,
    OpenAiResponses,
    GoogleGenerativeAi,
    AnthropicMessages,
}

/// One backend call.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// `None` disables tools for this round.
    pub tools: Option<Vec<ToolSpec>>,
    pub stream: bool,
    /// Server-side context cache handle (Gemini only).
    pub cached_content: Option<String>,
}

impl TurnRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            stream: false,
            cached_content: None,
        }
    }

    pub fn with_tools(mut self, tools: Option<Vec<ToolSpec>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_cached_content(mut self, handle: Option<String>) -> Self {
        self.cached_content = handle;
        self
    }
}

/// The normalised model reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Raw provider content to replay on the next request.
    pub envelope: Option<Value>,
}

impl AssistantTurn {
    pub fn into_message(self) -> Message {
        let mut msg = Message::assistant(self.text, self.tool_calls);
        msg.envelope = self.envelope;
        msg
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        headers: HeaderMap,
        body: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // Keep the status when reqwest wraps a response error.
        match e.status() {
            Some(status) => ProviderError::Http {
                status: status.as_u16(),
                headers: HeaderMap::new(),
                body: e.to_string(),
            },
            None if e.is_decode() => ProviderError::Decode(e.to_string()),
            None => ProviderError::Connection(e.to_string()),
        }
    }
}

/// Turn a non-success response into [`ProviderError::Http`], keeping headers for retry hints.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        status,
        headers,
        body,
    })
}

/// Server-side context cache operations (implemented by the Gemini adapter).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create a cached content entry and return its handle.
    async fn create_cache(
        &self,
        model: &str,
        system_instruction: &str,
        tools: &[ToolSpec],
        documents: &[String],
        ttl_secs: u64,
    ) -> Result<String, ProviderError>;

    async fn delete_cache(&self, handle: &str) -> Result<(), ProviderError>;
}

/// Receives text deltas while a reply is being collected.
pub type DeltaSink<'s> = dyn for<'a> FnMut(&'a str) + Send + 's;

/// The core provider adapter trait.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier (e.g., "openai", "gemini").
    fn id(&self) -> &str;

    fn api(&self) -> ModelApi;

    /// Build the wire request body. Pure.
    fn build_request(&self, request: &TurnRequest) -> Value;

    /// Parse a non-streaming response body. Pure.
    fn parse_response(&self, body: &Value) -> AssistantTurn;

    /// Send the request and collect the reply, reporting text deltas as they arrive.
    async fn complete(
        &self,
        request: &TurnRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<AssistantTurn, ProviderError>;

    /// Context cache support, if the backend has one.
    fn cache_backend(&self) -> Option<&dyn CacheBackend> {
        None
    }
}

/// Produces adapters; called again for every quota retry.
pub trait AdapterFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Arc<dyn ProviderAdapter>>;

    fn model(&self) -> String;
}

/// Builds adapters from the resolved [`Config`].
pub struct ConfigAdapterFactory {
    config: Arc<Config>,
}

impl ConfigAdapterFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl AdapterFactory for ConfigAdapterFactory {
    fn create(&self) -> anyhow::Result<Arc<dyn ProviderAdapter>> {
        let config = &self.config;
        let kind = config
            .provider_kind()
            .ok_or_else(|| anyhow::anyhow!("No provider selected (set UAGENT_PROVIDER)"))?;
        let api_key = config
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("No API key configured for provider '{kind}'"))?;
        let base_url = config
            .base_url()
            .ok_or_else(|| anyhow::anyhow!("No base URL configured for provider '{kind}'"))?;
        let dump = debug_dump::StreamDump::from_flag(config.streaming_debug());

        let adapter: Arc<dyn ProviderAdapter> = match kind {
            ProviderKind::Gemini => Arc::new(gemini::GeminiAdapter::new(base_url, api_key)),
            ProviderKind::Claude => Arc::new(anthropic::AnthropicAdapter::new(base_url, api_key)),
            _ => {
                let endpoint = openai::Endpoint::for_kind(kind, base_url, api_key, config.api_version())?;
                if config.use_responses() {
                    Arc::new(responses::ResponsesAdapter::new(endpoint, dump))
                } else {
                    Arc::new(openai::OpenAiAdapter::new(endpoint, config.fallback_models()))
                }
            }
        };

        tracing::debug!(provider = adapter.id(), api = ?adapter.api(), "Created provider adapter");
        Ok(adapter)
    }

    fn model(&self) -> String {
        self.config.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(pairs: &[(&str, &str)]) -> Arc<Config> {
        let mut config = Config::default();
        config
            .apply_env_with(|name| {
                pairs
                    .iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.to_string())
            })
            .unwrap();
        Arc::new(config)
    }

    #[test]
    fn test_factory_selects_adapter_by_kind() {
        let factory = ConfigAdapterFactory::new(config_with(&[
            ("UAGENT_PROVIDER", "grok"),
            ("UAGENT_GROK_API_KEY", "k"),
        ]));
        let adapter = factory.create().unwrap();
        assert_eq!(adapter.id(), "grok");
        assert_eq!(adapter.api(), ModelApi::OpenAiCompletions);
        assert_eq!(factory.model(), "grok-4-1-fast-reasoning");

        let factory = ConfigAdapterFactory::new(config_with(&[
            ("UAGENT_PROVIDER", "openai"),
            ("UAGENT_OPENAI_API_KEY", "k"),
            ("UAGENT_RESPONSES", "1"),
        ]));
        assert_eq!(factory.create().unwrap().api(), ModelApi::OpenAiResponses);

        let factory = ConfigAdapterFactory::new(config_with(&[
            ("UAGENT_PROVIDER", "gemini"),
            ("UAGENT_GEMINI_API_KEY", "k"),
        ]));
        let adapter = factory.create().unwrap();
        assert_eq!(adapter.api(), ModelApi::GoogleGenerativeAi);
        assert!(adapter.cache_backend().is_some());

        let factory = ConfigAdapterFactory::new(config_with(&[
            ("UAGENT_PROVIDER", "claude"),
            ("UAGENT_CLAUDE_API_KEY", "k"),
        ]));
        assert_eq!(factory.create().unwrap().api(), ModelApi::AnthropicMessages);
    }

    #[test]
    fn test_factory_requires_key() {
        let factory = ConfigAdapterFactory::new(config_with(&[("UAGENT_PROVIDER", "nvidia")]));
        let err = factory.create().err().unwrap();
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn test_azure_requires_base_url() {
        let factory = ConfigAdapterFactory::new(config_with(&[
            ("UAGENT_PROVIDER", "azure"),
            ("UAGENT_AZURE_API_KEY", "k"),
        ]));
        assert!(factory.create().is_err());
    }

    fn emit_all(sink: &mut DeltaSink<'_>, parts: &[String]) {
        for part in parts {
            sink(part);
        }
    }

    #[test]
    fn test_delta_sink_accepts_borrowing_closure() {
        let mut seen = String::new();
        let mut sink = |d: &str| seen.push_str(d);
        let parts = vec!["a".to_string(), "b".to_string()];
        emit_all(&mut sink, &parts);
        assert_eq!(seen, "ab");
    }

    #[test]
    fn test_turn_into_message_keeps_envelope() {
        let turn = AssistantTurn {
            text: "hi".into(),
            tool_calls: vec![ToolCallRequest::new("c1", "f", "{}")],
            envelope: Some(serde_json::json!({"role": "model"})),
        };
        let msg = turn.into_message();
        assert_eq!(msg.text(), "hi");
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(msg.envelope.is_some());
    }
}
