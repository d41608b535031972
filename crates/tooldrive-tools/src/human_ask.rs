//! Ask the human user a question and wait for the answer.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tooldrive_core::error::ConfirmationError;
use tracing::info;

use crate::{Tool, ToolContext, ToolError};

const EMPTY_MESSAGE: &str = "(The request text was empty. Describe the action or decision you need here.)";

pub struct HumanAskTool;

/// Tool result returned to the model.
#[derive(Debug, Serialize)]
struct HumanAskPayload<'a> {
    tool: &'static str,
    message: &'a str,
    user_reply: &'a str,
    display_reply: &'a str,
    cancelled: bool,
}

#[async_trait]
impl Tool for HumanAskTool {
    fn name(&self) -> &str {
        "human_ask"
    }

    fn description(&self) -> &str {
        "Ask the human user for an action or decision the model cannot complete on its own and return their reply. \
         For secrets (passwords, tokens) set is_password=true and ask for exactly one item per call. \
         Never repeat a secret reply back to the user."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "What to ask the user, written so it can be shown as-is"
                },
                "is_password": {
                    "type": "boolean",
                    "description": "Mask the input; use for passwords and tokens",
                    "default": false
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, params: Map<String, Value>, context: &ToolContext) -> Result<String, ToolError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(EMPTY_MESSAGE);
        let secret = params
            .get("is_password")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let runtime = &context.runtime;
        // Waiting on the user is not busy time.
        runtime.status.idle();
        info!(secret, "Waiting for human reply");

        let reply = runtime
            .confirmations
            .request(message, secret)
            .await
            .map_err(|e| match e {
                ConfirmationError::Busy => ToolError::Failed("another human_ask is already waiting for a reply".into()),
                ConfirmationError::Closed => ToolError::Cancelled,
                other => ToolError::Failed(other.to_string()),
            })?;

        let payload = HumanAskPayload {
            tool: "human_ask",
            message,
            user_reply: &reply.reply,
            display_reply: &reply.display_reply,
            cancelled: reply.cancelled,
        };
        serde_json::to_string(&payload).map_err(|e| ToolError::Failed(e.to_string()))
    }
}
