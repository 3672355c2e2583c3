//! Wire protocol for the session chat WebSocket.
//!
//! Frames are single JSON objects `{type, data}`. `ClientFrame` covers
//! everything the browser may send; `ServerFrame` everything we emit.
//! `ToolEvent` is the sink contract tools/interceptors use to report
//! execution progress into a running turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "session.set_lang")]
    SetLang { lang: Option<String> },
    #[serde(rename = "chat.clear")]
    ChatClear,
    #[serde(rename = "chat.send")]
    ChatSend(ChatSendData),
    #[serde(rename = "pipeline.start")]
    PipelineStart { template_id: String },
    #[serde(rename = "pipeline.cancel")]
    PipelineCancel,
    #[serde(rename = "pipeline.confirm_response")]
    PipelineConfirmResponse {
        #[serde(default)]
        params: Value,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatSendData {
    #[serde(default)]
    pub text: String,
    /// Pending-media ids to attach; `None` attaches everything pending.
    #[serde(default)]
    pub attachment_ids: Option<Vec<String>>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub vlm_model: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    /// Custom model / TTS / asset-search configuration for this session.
    #[serde(default)]
    pub service_config: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "session.snapshot")]
    SessionSnapshot(Value),
    #[serde(rename = "session.lang")]
    SessionLang { lang: String },
    #[serde(rename = "chat.cleared")]
    ChatCleared { ok: bool },
    #[serde(rename = "chat.user")]
    ChatUser(Value),

    #[serde(rename = "assistant.start")]
    AssistantStart {},
    #[serde(rename = "assistant.delta")]
    AssistantDelta { delta: String },
    /// Seal the current text bubble; the next text starts a fresh one.
    #[serde(rename = "assistant.flush")]
    AssistantFlush {},
    #[serde(rename = "assistant.end")]
    AssistantEnd {
        text: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        interrupted: bool,
    },

    #[serde(rename = "tool.start")]
    ToolStart {
        tool_call_id: String,
        server: String,
        name: String,
        args: Value,
    },
    #[serde(rename = "tool.progress")]
    ToolProgress {
        tool_call_id: String,
        server: String,
        name: String,
        progress: f64,
        message: String,
    },
    #[serde(rename = "tool.end")]
    ToolEnd {
        tool_call_id: String,
        server: String,
        name: String,
        is_error: bool,
        summary: Option<Value>,
    },

    #[serde(rename = "pipeline.started")]
    PipelineStarted {
        template_id: String,
        template_name: String,
    },
    #[serde(rename = "pipeline.progress")]
    PipelineProgress {
        node_id: String,
        status: String,
        progress: f64,
        message: String,
    },
    #[serde(rename = "pipeline.confirm")]
    PipelineConfirm {
        node_id: String,
        params: Value,
        timeout_sec: u64,
    },
    #[serde(rename = "pipeline.confirm_ack")]
    PipelineConfirmAck { ok: bool },
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled { ok: bool },
    #[serde(rename = "pipeline.done")]
    PipelineDone(Value),
    #[serde(rename = "pipeline.error")]
    PipelineError { message: String },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_text: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong { ts: f64 },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            retry_after: None,
            partial_text: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: u64) -> Self {
        ServerFrame::Error {
            message: message.into(),
            retry_after: Some(retry_after),
            partial_text: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw progress events emitted while a tool call runs. `tool_call_id`
/// keys in-place updates of the matching history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    ToolStart {
        tool_call_id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        args: Value,
    },
    ToolProgress {
        tool_call_id: String,
        #[serde(default)]
        progress: f64,
        #[serde(default)]
        total: Option<f64>,
        #[serde(default)]
        message: String,
    },
    ToolEnd {
        tool_call_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        summary: Option<Value>,
        #[serde(default)]
        message: String,
    },
}

impl ToolEvent {
    pub fn tool_call_id(&self) -> &str {
        match self {
            ToolEvent::ToolStart { tool_call_id, .. }
            | ToolEvent::ToolProgress { tool_call_id, .. }
            | ToolEvent::ToolEnd { tool_call_id, .. } => tool_call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frame_parses_dotted_types() {
        let raw = r#"{"type":"session.set_lang","data":{"lang":"en"}}"#;
        match serde_json::from_str::<ClientFrame>(raw).unwrap() {
            ClientFrame::SetLang { lang } => assert_eq!(lang.as_deref(), Some("en")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ping_needs_no_data() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn chat_send_defaults() {
        let raw = r#"{"type":"chat.send","data":{"text":"cut a vlog"}}"#;
        match serde_json::from_str::<ClientFrame>(raw).unwrap() {
            ClientFrame::ChatSend(data) => {
                assert_eq!(data.text, "cut a vlog");
                assert!(data.attachment_ids.is_none());
                assert!(data.service_config.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_frame_envelope_shape() {
        let frame = ServerFrame::AssistantDelta {
            delta: "hel".into(),
        };
        let v: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "assistant.delta");
        assert_eq!(v["data"]["delta"], "hel");
    }

    #[test]
    fn assistant_end_hides_false_interrupted() {
        let v = serde_json::to_value(ServerFrame::AssistantEnd {
            text: "done".into(),
            interrupted: false,
        })
        .unwrap();
        assert!(v["data"].get("interrupted").is_none());

        let v = serde_json::to_value(ServerFrame::AssistantEnd {
            text: "part".into(),
            interrupted: true,
        })
        .unwrap();
        assert_eq!(v["data"]["interrupted"], true);
    }

    #[test]
    fn tool_event_roundtrip() {
        let ev = ToolEvent::ToolEnd {
            tool_call_id: "tc_1".into(),
            is_error: true,
            summary: Some(json!({"cancelled": true})),
            message: String::new(),
        };
        let raw = serde_json::to_string(&ev).unwrap();
        assert!(raw.contains("\"type\":\"tool_end\""));
        let back: ToolEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, ev);
    }
}
