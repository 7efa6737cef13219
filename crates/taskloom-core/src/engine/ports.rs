//! External call ports used by `prompt` and `tool_call` steps.
//!
//! Both traits return boxed futures so they can sit behind `Arc<dyn _>` and
//! be captured by `'static` activity bodies.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use taskloom_types::task::ToolDef;

use super::activity::ActivityError;

/// Chat completion request built by a `prompt` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Rendered chat messages (`{"role", "content", ...}` objects).
    pub messages: Vec<Value>,
    /// Model settings passed through untouched.
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

/// Chat model backend.
///
/// Responses use the chat-completion shape:
/// `{"choices": [{"finish_reason", "message": {"content", "tool_calls"}}]}`.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: &'a ModelRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + 'a>>;
}

/// One execution of a non-function tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: ToolDef,
    pub arguments: Value,
    pub execution_id: Uuid,
}

/// Runs `integration`, `api_call` and `system` tools.
pub trait ToolExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        invocation: &'a ToolInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + 'a>>;
}

/// First choice of a chat-completion response.
pub fn first_choice(response: &Value) -> Option<&Value> {
    response.get("choices").and_then(|choices| choices.get(0))
}

/// Text content of the first choice's message.
pub fn first_message_content(response: &Value) -> Option<&Value> {
    first_choice(response).and_then(|choice| choice.pointer("/message/content"))
}

/// Tool calls requested by the first choice, when the model stopped to call tools.
pub fn requested_tool_calls(response: &Value) -> Option<&Vec<Value>> {
    let choice = first_choice(response)?;
    if choice.get("finish_reason").and_then(Value::as_str) != Some("tool_calls") {
        return None;
    }
    choice
        .pointer("/message/tool_calls")
        .and_then(Value::as_array)
        .filter(|calls| !calls.is_empty())
}
