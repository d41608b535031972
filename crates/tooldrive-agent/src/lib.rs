//! Round orchestrator: drives a conversation turn with the model until it
//! answers without requesting tools.
//!
//! [`Orchestrator::run`] sends the history, executes requested tool calls
//! through the gateway, appends the results and repeats. Progress is
//! reported as a stream of [`AgentEvent`]s for front-ends to render.

use serde::{Deserialize, Serialize};

pub mod round;
pub mod runtime;

pub use runtime::Orchestrator;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Streaming text delta for live output.
    TextDelta { delta: String },

    /// The assistant message of a round has been appended.
    AssistantMessage { text: String, tool_calls: usize },

    /// A tool call is about to be resolved.
    ToolCall {
        call_id: String,
        tool: String,
        arguments: String,
    },

    /// A tool call has been resolved.
    ToolResult {
        call_id: String,
        tool: String,
        content: String,
        /// False when the result came from the per-turn cache or an argument error.
        fresh: bool,
    },

    /// A quota error is being waited out.
    RateLimited {
        attempt: u32,
        max_retries: u32,
        wait_secs: f64,
        status: Option<u16>,
    },

    Warning { message: String },

    Error { kind: String, message: String },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without tool calls.
    Completed,
    /// The round cap was reached.
    RoundLimit,
    /// Three consecutive rounds only reused cached tool results.
    ReuseLoop,
    /// Quota errors persisted past the retry budget.
    RetryExhausted,
    /// The backend returned a non-quota error.
    ProviderFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Text of the final assistant message, when the run completed.
    pub final_text: Option<String>,
    pub rounds: u32,
    /// Tool calls that actually ran (cache reuses excluded).
    pub tool_executions: u32,
    pub stop: StopReason,
    /// Backend diagnostic for failed runs.
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.stop == StopReason::Completed
    }
}
