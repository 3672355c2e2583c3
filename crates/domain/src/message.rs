//! Model-facing conversation messages.
//!
//! The agent consumes and produces `ContextMessage` values; the turn
//! controller rewrites them on cancellation so the model-facing context
//! only ever reflects what the user actually saw.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation issued by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// One message in the model-facing context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ContextMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRef>,
    },
    Tool {
        tool_call_id: String,
        content: Value,
    },
}

impl ContextMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ContextMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ContextMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ContextMessage::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRef>) -> Self {
        ContextMessage::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: Value) -> Self {
        ContextMessage::Tool {
            tool_call_id: tool_call_id.into(),
            content,
        }
    }

    /// Tool-call ids this message issues (empty unless it is an
    /// assistant message with tool calls).
    pub fn tool_call_ids(&self) -> Vec<String> {
        match self {
            ContextMessage::Assistant { tool_calls, .. } => {
                tool_calls.iter().map(|c| c.id.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// An assistant message that issues at least one tool call.
    pub fn is_tool_call_assistant(&self) -> bool {
        matches!(self, ContextMessage::Assistant { tool_calls, .. } if !tool_calls.is_empty())
    }

    /// An assistant message carrying plain text and no tool calls.
    pub fn is_text_assistant(&self) -> bool {
        matches!(
            self,
            ContextMessage::Assistant { content, tool_calls }
                if tool_calls.is_empty() && !content.trim().is_empty()
        )
    }
}

/// All tool-call ids issued by assistant messages in `msgs`.
pub fn tool_call_ids_in(msgs: &[ContextMessage]) -> HashSet<String> {
    msgs.iter().flat_map(|m| m.tool_call_ids()).collect()
}

/// All tool-call ids that already have a tool-result message in `msgs`.
pub fn tool_result_ids_in(msgs: &[ContextMessage]) -> HashSet<String> {
    msgs.iter()
        .filter_map(|m| match m {
            ContextMessage::Tool { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect()
}
