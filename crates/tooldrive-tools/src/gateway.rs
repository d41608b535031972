//! Tool execution gateway.
//!
//! Resolves the model's tool calls against the registry. Identical calls
//! within one turn (same name, same arguments in any key order) run once;
//! later copies get the cached text behind a reuse note. Every failure is
//! folded into the result text, so a round always gets one result per call.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tooldrive_core::context::FileAccessObserver;
use tooldrive_core::message::{ToolCallRequest, ToolCallResult, canonical_json};
use tracing::{debug, info, warn};

use crate::{ToolContext, ToolRegistry};

pub const REUSE_NOTE: &str = "[INFO] Reusing previous result for identical tool call.\n";

/// Results already produced during the current turn, keyed by canonical call.
#[derive(Debug, Default)]
pub struct ToolResultCache {
    entries: HashMap<String, String>,
}

impl ToolResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: String, text: String) {
        self.entries.insert(key, text);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache key for a well-formed call.
pub fn call_key(name: &str, args: &serde_json::Map<String, Value>) -> String {
    let args = canonical_json(&Value::Object(args.clone()));
    canonical_json(&json!({"name": name, "args": args}))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOutcome {
    pub result: ToolCallResult,
    /// True when a tool actually ran (not a reuse or argument error).
    pub fresh: bool,
}

pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
    observer: Option<Arc<dyn FileAccessObserver>>,
}

impl ToolGateway {
    pub fn new(registry: Arc<ToolRegistry>, context: ToolContext) -> Self {
        Self {
            registry,
            context,
            observer: None,
        }
    }

    /// Report files read by tools to `observer` (the context cache manager).
    pub fn with_observer(mut self, observer: Arc<dyn FileAccessObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub async fn invoke(&self, cache: &mut ToolResultCache, call: &ToolCallRequest) -> GatewayOutcome {
        let name = call.name.as_str();
        let outcome = |text: String, fresh: bool| GatewayOutcome {
            result: ToolCallResult {
                call_id: call.id.clone(),
                text,
            },
            fresh,
        };

        let args = match call.parse_arguments() {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = name, error = %e, "Malformed tool arguments");
                let text = format!("[tool args error] name={name:?} raw={:?} err={e}", call.arguments);
                cache.insert(format!("error:{name}:{}", call.arguments), text.clone());
                return outcome(text, false);
            }
        };

        let key = call_key(name, &args);
        if let Some(previous) = cache.get(&key) {
            debug!(tool = name, call_id = %call.id, "Reusing cached tool result");
            return outcome(format!("{REUSE_NOTE}{previous}"), false);
        }

        let text = self.execute(name, args).await;
        cache.insert(key, text.clone());
        outcome(text, true)
    }

    async fn execute(&self, name: &str, args: serde_json::Map<String, Value>) -> String {
        let Some(tool) = self.registry.get(name) else {
            warn!(tool = name, "Unknown tool requested");
            return format!("[tool error] unknown tool: {name}");
        };

        let status = &self.context.runtime.status;
        status.busy(format!("tool:{name}"));

        if let (Some(observer), Some(path)) = (&self.observer, tool.accessed_path(&args, &self.context)) {
            observer.record_file_access(&path).await;
        }

        info!(tool = name, "Executing tool");
        let text = match tool.execute(args, &self.context).await {
            Ok(text) => text,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool failed");
                format!("[tool runtime error] name={name:?} err={e}")
            }
        };

        status.busy("LLM");
        text
    }
}
