//! The round loop: send, accumulate, execute tools, repeat.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tooldrive_core::context::RuntimeContext;
use tooldrive_core::message::{Message, Role, ToolSpec, sanitize_for_tools};
use tooldrive_core::transcript::TranscriptLog;
use tooldrive_providers::cache::GeminiCacheManager;
use tooldrive_providers::retry::{RetryContext, RetryPolicy, classify};
use tooldrive_providers::{AdapterFactory, AssistantTurn, ProviderAdapter, ProviderError, TurnRequest};
use tooldrive_tools::gateway::ToolGateway;

use crate::round::{MAX_REUSE_ONLY_ROUNDS, RoundState};
use crate::{AgentEvent, RunOutcome, StopReason};

/// How a send ended without a reply.
enum SendFailure {
    Exhausted(ProviderError),
    Failed(ProviderError),
    Factory(anyhow::Error),
}

pub struct Orchestrator {
    runtime: RuntimeContext,
    factory: Arc<dyn AdapterFactory>,
    gateway: ToolGateway,
    policy: RetryPolicy,
    context_cache: Option<Arc<GeminiCacheManager>>,
    transcript: Option<TranscriptLog>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Orchestrator {
    pub fn new(runtime: RuntimeContext, factory: Arc<dyn AdapterFactory>, gateway: ToolGateway) -> Self {
        let policy = RetryPolicy::from_config(&runtime.config);
        Self {
            runtime,
            factory,
            gateway,
            policy,
            context_cache: None,
            transcript: None,
            events: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use a server-side context cache when the backend supports one.
    pub fn with_context_cache(mut self, cache: Arc<GeminiCacheManager>) -> Self {
        self.context_cache = Some(cache);
        self
    }

    pub fn with_transcript(mut self, transcript: TranscriptLog) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn record(&self, history: &mut Vec<Message>, message: Message) {
        if let Some(log) = &self.transcript {
            if let Err(e) = log.append(&message).await {
                warn!(error = %e, path = %log.path().display(), "Failed to write transcript");
            }
        }
        history.push(message);
    }

    /// Run one user turn over `history`, appending assistant and tool messages.
    pub async fn run(&self, history: &mut Vec<Message>) -> anyhow::Result<RunOutcome> {
        self.runtime.status.busy("LLM");
        let result = self.run_rounds(history).await;
        self.runtime.status.idle();
        result
    }

    async fn run_rounds(&self, history: &mut Vec<Message>) -> anyhow::Result<RunOutcome> {
        let config = &self.runtime.config;
        let max_rounds = config.max_rounds();
        let model = self.factory.model();
        let tools: Option<Vec<ToolSpec>> = if config.send_tools() && !self.gateway.registry().is_empty() {
            Some(self.gateway.registry().specs())
        } else {
            None
        };

        let mut adapter = self.factory.create()?;
        let mut state = RoundState::new();
        let cached_content = self
            .prepare_context_cache(adapter.as_ref(), history, tools.as_deref())
            .await;

        let mut outcome = RunOutcome {
            final_text: None,
            rounds: 0,
            tool_executions: 0,
            stop: StopReason::Completed,
            error: None,
        };

        loop {
            let round = state.begin();
            if round > max_rounds {
                let message = format!("Reached the round limit ({max_rounds}); stopping");
                warn!(max_rounds, "Round limit reached");
                self.emit(AgentEvent::Warning { message });
                outcome.stop = StopReason::RoundLimit;
                break;
            }
            outcome.rounds = round;
            debug!(round, provider = adapter.id(), "Starting round");

            let messages = if cached_content.is_some() {
                history.iter().filter(|m| m.role != Role::System).cloned().collect()
            } else {
                sanitize_for_tools(history)
            };
            let request = TurnRequest::new(model.clone(), messages)
                .with_tools(tools.clone())
                .streaming(config.streaming())
                .with_cached_content(cached_content.clone());

            let turn = match self.send_with_retry(&mut adapter, &request).await {
                Ok(turn) => turn,
                Err(SendFailure::Factory(e)) => return Err(e),
                Err(SendFailure::Exhausted(e)) => {
                    error!(error = %e, max_retries = self.policy.max_retries, "Quota retries exhausted");
                    self.emit(AgentEvent::Error {
                        kind: "retry_exhausted".into(),
                        message: e.to_string(),
                    });
                    outcome.stop = StopReason::RetryExhausted;
                    outcome.error = Some(e.to_string());
                    break;
                }
                Err(SendFailure::Failed(e)) => {
                    error!(error = %e, provider = adapter.id(), "Provider call failed");
                    self.emit(AgentEvent::Error {
                        kind: "provider_error".into(),
                        message: e.to_string(),
                    });
                    outcome.stop = StopReason::ProviderFailed;
                    outcome.error = Some(e.to_string());
                    break;
                }
            };

            let calls = turn.tool_calls.clone();
            let text = turn.text.clone();
            self.emit(AgentEvent::AssistantMessage {
                text: text.clone(),
                tool_calls: calls.len(),
            });
            self.record(history, turn.into_message()).await;

            if calls.is_empty() {
                info!(rounds = round, tool_executions = outcome.tool_executions, "Run completed");
                outcome.final_text = Some(text);
                outcome.stop = StopReason::Completed;
                break;
            }

            let mut executed_fresh = false;
            for call in &calls {
                self.emit(AgentEvent::ToolCall {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let result = self.gateway.invoke(&mut state.cache, call).await;
                if result.fresh {
                    executed_fresh = true;
                    outcome.tool_executions += 1;
                }
                self.emit(AgentEvent::ToolResult {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    content: result.result.text.clone(),
                    fresh: result.fresh,
                });
                self.record(history, Message::tool(result.result, call.name.clone())).await;
            }

            self.runtime.status.busy("LLM");
            if state.finish(executed_fresh) {
                let message = format!(
                    "{MAX_REUSE_ONLY_ROUNDS} consecutive rounds only reused earlier tool results; stopping to avoid a loop"
                );
                warn!(round, "Reuse-only loop detected");
                self.emit(AgentEvent::Warning { message });
                outcome.stop = StopReason::ReuseLoop;
                break;
            }
        }

        Ok(outcome)
    }

    /// Send `request`, waiting out quota errors on a fresh adapter each time.
    async fn send_with_retry(
        &self,
        adapter: &mut Arc<dyn ProviderAdapter>,
        request: &TurnRequest,
    ) -> Result<AssistantTurn, SendFailure> {
        let mut retry = RetryContext::default();
        loop {
            let events = self.events.clone();
            let mut on_delta = move |delta: &str| {
                if let Some(tx) = &events {
                    let _ = tx.send(AgentEvent::TextDelta {
                        delta: delta.to_string(),
                    });
                }
            };

            let error = match adapter.complete(request, &mut on_delta).await {
                Ok(turn) => return Ok(turn),
                Err(e) => e,
            };

            let classification = classify(&error);
            if !classification.is_quota {
                return Err(SendFailure::Failed(error));
            }
            let Some(wait) = retry.next_wait(&self.policy, &classification) else {
                return Err(SendFailure::Exhausted(error));
            };

            *adapter = self.factory.create().map_err(SendFailure::Factory)?;
            warn!(
                provider = adapter.id(),
                model = %request.model,
                attempt = retry.attempt,
                max_retries = self.policy.max_retries,
                wait_secs = wait.as_secs_f64(),
                status = ?classification.status,
                "Quota error, backing off"
            );
            self.emit(AgentEvent::RateLimited {
                attempt: retry.attempt,
                max_retries: self.policy.max_retries,
                wait_secs: wait.as_secs_f64(),
                status: classification.status,
            });
            tokio::time::sleep(wait).await;
        }
    }

    /// Cache handle for this turn, when the backend and configuration allow one.
    async fn prepare_context_cache(
        &self,
        adapter: &dyn ProviderAdapter,
        history: &[Message],
        tools: Option<&[ToolSpec]>,
    ) -> Option<String> {
        let cache = self.context_cache.as_ref()?;
        if !self.runtime.config.gemini_cache_enabled() {
            return None;
        }
        let backend = adapter.cache_backend()?;

        let system = history
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        cache.prepare(backend, &system, tools.unwrap_or_default()).await
    }
}
