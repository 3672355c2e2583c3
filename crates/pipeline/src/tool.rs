//! The uniform call contract every pipeline node implements.
//!
//! Node algorithms (shot detection, captioning, TTS, rendering) live
//! behind this trait; the gateway only ever sees the envelope.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use cf_domain::message::ContextMessage;
use cf_domain::template::NodeMode;
use cf_domain::Result;

use crate::runtime::RuntimeContext;

/// What a node returns: the payload to persist plus a human-readable
/// summary. Tool failures are data (`is_error`), never a transport
/// error.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub artifact_id: String,
    /// Structured result; media lists inside may carry inlined blobs.
    pub payload: Value,
    pub summary: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(artifact_id: impl Into<String>, payload: Value, summary: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            payload,
            summary: summary.into(),
            is_error: false,
        }
    }

    pub fn error(artifact_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            payload: Value::Null,
            summary: summary.into(),
            is_error: true,
        }
    }

    /// The tool-result message committed to the model-facing context.
    /// Full payloads stay in the artifact store; only
    /// `read_node_history` echoes its payload back to the model.
    pub fn to_context_message(&self, tool_call_id: &str, node_id: &str) -> ContextMessage {
        let echoed = if node_id == "read_node_history" {
            self.payload.clone()
        } else {
            json!({})
        };
        ContextMessage::tool_result(
            tool_call_id,
            json!({
                "summary": {
                    "node_summary": self.summary,
                    "tool_execute_result": echoed,
                },
                "isError": self.is_error,
            }),
        )
    }
}

/// One tool invocation travelling through the interceptor chain.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub node_id: String,
    pub tool_call_id: String,
    pub mode: NodeMode,
    pub args: Map<String, Value>,
    /// Dependency-resolution recursion depth (capped at
    /// [`crate::interceptors::MAX_RESOLVE_DEPTH`]).
    pub depth: u32,
}

impl ToolRequest {
    pub fn new(node_id: &str, tool_call_id: &str, mode: NodeMode, args: Map<String, Value>) -> Self {
        Self {
            node_id: node_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            mode,
            args,
            depth: 0,
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// An opaque pipeline node.
#[async_trait]
pub trait PipelineTool: Send + Sync {
    async fn call(&self, args: Map<String, Value>, ctx: &RuntimeContext) -> Result<ToolOutcome>;
}
