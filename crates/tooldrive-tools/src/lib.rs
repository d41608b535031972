//! Tools the model can call, and the gateway that runs them.
//!
//! Tools implement [`Tool`] and are registered explicitly into a
//! [`ToolRegistry`]; rebuilding the catalog means building a new registry.
//! [`gateway::ToolGateway`] resolves model tool calls against the registry.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tooldrive_core::context::RuntimeContext;
use tooldrive_core::message::ToolSpec;

pub mod calculator;
pub mod gateway;
pub mod human_ask;
pub mod read_file;

/// Services available to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub runtime: RuntimeContext,
    /// Base for relative paths.
    pub workspace: PathBuf,
}

impl ToolContext {
    pub fn new(runtime: RuntimeContext, workspace: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            workspace: workspace.into(),
        }
    }

    /// Resolve `raw` against the workspace, expanding `~`.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(raw).as_ref());
        if expanded.is_absolute() {
            expanded
        } else {
            self.workspace.join(expanded)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("cancelled by user")]
    Cancelled,
}

/// A capability exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model (e.g., "calculator").
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the named parameters.
    fn parameters_schema(&self) -> Value;

    /// File this call is about to read, reported to the context cache.
    fn accessed_path(&self, _params: &Map<String, Value>, _context: &ToolContext) -> Option<PathBuf> {
        None
    }

    async fn execute(&self, params: Map<String, Value>, context: &ToolContext) -> Result<String, ToolError>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Registry of available tools, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a later tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        if let Some(pos) = self.tools.iter().position(|t| t.name() == tool.name()) {
            tracing::debug!(tool = tool.name(), "Replacing registered tool");
            self.tools[pos] = tool;
        } else {
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool advertisements for the backend request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Register the built-in tools.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(Box::new(calculator::CalculatorTool));
    registry.register(Box::new(human_ask::HumanAskTool));
    registry.register(Box::new(read_file::ReadFileTool));
}

/// A registry holding only the built-in tools.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert_eq!(registry.names(), vec!["calculator", "human_ask", "read_file"]);
        assert!(registry.get("calculator").is_some());
        assert!(registry.get("nope").is_none());

        let specs = registry.specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].parameters["required"][0], "expression");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = builtin_registry();
        registry.register(Box::new(calculator::CalculatorTool));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_resolve_path() {
        let ctx = ToolContext::new(RuntimeContext::default(), "/work");
        assert_eq!(ctx.resolve_path("a/b.txt"), PathBuf::from("/work/a/b.txt"));
        assert_eq!(ctx.resolve_path("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }
}
