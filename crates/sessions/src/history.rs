//! Conversation history as replayed to the front end, including tool
//! cards that update in place as `tool_*` events arrive.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use cf_domain::wire::ToolEvent;
use cf_domain::{short_hex_id, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Running,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
    User {
        id: String,
        content: String,
        attachments: Vec<Value>,
        ts: f64,
    },
    Assistant {
        id: String,
        content: String,
        ts: f64,
    },
    Tool {
        id: String,
        tool_call_id: String,
        server: String,
        name: String,
        args: Value,
        state: ToolState,
        progress: f64,
        message: String,
        summary: Option<Value>,
        ts: f64,
    },
}

/// A tool card snapshot handed back to the caller after an event is
/// applied (for forwarding to the client).
#[derive(Debug, Clone)]
pub struct ToolCard {
    pub tool_call_id: String,
    pub server: String,
    pub name: String,
    pub args: Value,
    pub state: ToolState,
    pub progress: f64,
    pub message: String,
    pub summary: Option<Value>,
}

#[derive(Default)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
    /// tool_call_id → index into `entries`.
    tool_index: HashMap<String, usize>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.entries).unwrap_or_else(|_| json!([]))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.tool_index.clear();
    }

    pub fn push_user(&mut self, content: &str, attachments: Vec<Value>) {
        self.entries.push(HistoryEntry::User {
            id: short_hex_id(12),
            content: content.to_string(),
            attachments,
            ts: unix_now(),
        });
    }

    pub fn push_assistant(&mut self, content: &str, ts: Option<f64>) {
        self.entries.push(HistoryEntry::Assistant {
            id: short_hex_id(12),
            content: content.to_string(),
            ts: ts.unwrap_or_else(unix_now),
        });
    }

    /// Apply a raw tool event, creating or updating the matching card.
    pub fn apply_tool_event(&mut self, event: &ToolEvent) -> Option<ToolCard> {
        match event {
            ToolEvent::ToolStart {
                tool_call_id,
                server,
                name,
                args,
            } => {
                let idx = self.ensure_tool_record(tool_call_id, server, name, args.clone());
                if let HistoryEntry::Tool {
                    server: s,
                    name: n,
                    args: a,
                    state,
                    progress,
                    message,
                    summary,
                    ..
                } = &mut self.entries[idx]
                {
                    *s = server.clone();
                    *n = name.clone();
                    *a = args.clone();
                    *state = ToolState::Running;
                    *progress = 0.0;
                    *message = "Starting...".to_string();
                    *summary = None;
                }
                self.tool_card(tool_call_id)
            }
            ToolEvent::ToolProgress {
                tool_call_id,
                progress,
                total,
                message,
            } => {
                let idx = self.ensure_tool_record(tool_call_id, "", "", Value::Null);
                let normalized = normalize_progress(*progress, *total);
                if let HistoryEntry::Tool {
                    state,
                    progress: p,
                    message: m,
                    ..
                } = &mut self.entries[idx]
                {
                    *state = ToolState::Running;
                    *p = normalized;
                    *m = message.clone();
                }
                self.tool_card(tool_call_id)
            }
            ToolEvent::ToolEnd {
                tool_call_id,
                is_error,
                summary,
                message,
            } => {
                let idx = self.ensure_tool_record(tool_call_id, "", "", Value::Null);
                if let HistoryEntry::Tool {
                    state,
                    progress,
                    summary: s,
                    message: m,
                    ..
                } = &mut self.entries[idx]
                {
                    *state = if *is_error {
                        ToolState::Error
                    } else {
                        ToolState::Complete
                    };
                    *progress = 1.0;
                    *s = summary.clone();
                    if !message.is_empty() {
                        *m = message.clone();
                    }
                }
                self.tool_card(tool_call_id)
            }
        }
    }

    /// Mark every still-running tool card as cancelled. Returns the
    /// affected cards so synthetic `tool.end` events can be emitted.
    pub fn cancel_running_tools(&mut self) -> Vec<ToolCard> {
        let mut cancelled = Vec::new();
        let ids: Vec<(String, usize)> = self
            .tool_index
            .iter()
            .map(|(id, idx)| (id.clone(), *idx))
            .collect();
        for (tool_call_id, idx) in ids {
            let mut was_running = false;
            if let HistoryEntry::Tool {
                state,
                progress,
                message,
                summary,
                ..
            } = &mut self.entries[idx]
            {
                if *state == ToolState::Running {
                    *state = ToolState::Error;
                    *progress = 1.0;
                    *message = "Cancelled by user".to_string();
                    *summary = Some(json!({"cancelled": true}));
                    was_running = true;
                }
            }
            if was_running {
                if let Some(card) = self.tool_card(&tool_call_id) {
                    cancelled.push(card);
                }
            }
        }
        cancelled
    }

    // ── Private ──────────────────────────────────────────────────────

    fn ensure_tool_record(&mut self, tool_call_id: &str, server: &str, name: &str, args: Value) -> usize {
        if let Some(idx) = self.tool_index.get(tool_call_id) {
            return *idx;
        }
        self.entries.push(HistoryEntry::Tool {
            id: format!("tool_{tool_call_id}"),
            tool_call_id: tool_call_id.to_string(),
            server: server.to_string(),
            name: name.to_string(),
            args,
            state: ToolState::Running,
            progress: 0.0,
            message: String::new(),
            summary: None,
            ts: unix_now(),
        });
        let idx = self.entries.len() - 1;
        self.tool_index.insert(tool_call_id.to_string(), idx);
        idx
    }

    fn tool_card(&self, tool_call_id: &str) -> Option<ToolCard> {
        let idx = *self.tool_index.get(tool_call_id)?;
        match &self.entries[idx] {
            HistoryEntry::Tool {
                tool_call_id,
                server,
                name,
                args,
                state,
                progress,
                message,
                summary,
                ..
            } => Some(ToolCard {
                tool_call_id: tool_call_id.clone(),
                server: server.clone(),
                name: name.clone(),
                args: args.clone(),
                state: *state,
                progress: *progress,
                message: message.clone(),
                summary: summary.clone(),
            }),
            _ => None,
        }
    }
}

/// `total > 0` → fraction of total; bare values above 1 are percents;
/// everything clamps into `[0, 1]`.
fn normalize_progress(progress: f64, total: Option<f64>) -> f64 {
    let p = match total {
        Some(t) if t > 0.0 => progress / t,
        _ => {
            if progress > 1.0 {
                progress / 100.0
            } else {
                progress
            }
        }
    };
    p.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(id: &str) -> ToolEvent {
        ToolEvent::ToolStart {
            tool_call_id: id.into(),
            server: "pipeline".into(),
            name: "split_shots".into(),
            args: json!({"mode": "auto"}),
        }
    }

    #[test]
    fn tool_events_update_in_place() {
        let mut log = HistoryLog::new();
        log.apply_tool_event(&start("tc_1"));
        assert_eq!(log.entries().len(), 1);

        let card = log
            .apply_tool_event(&ToolEvent::ToolProgress {
                tool_call_id: "tc_1".into(),
                progress: 40.0,
                total: Some(80.0),
                message: "halfway".into(),
            })
            .unwrap();
        assert_eq!(card.progress, 0.5);
        assert_eq!(log.entries().len(), 1, "no new entry for progress");

        let card = log
            .apply_tool_event(&ToolEvent::ToolEnd {
                tool_call_id: "tc_1".into(),
                is_error: false,
                summary: Some(json!({"node_summary": "4 shots"})),
                message: String::new(),
            })
            .unwrap();
        assert_eq!(card.state, ToolState::Complete);
        assert_eq!(card.progress, 1.0);
    }

    #[test]
    fn progress_normalization_rules() {
        assert_eq!(normalize_progress(30.0, Some(60.0)), 0.5);
        assert_eq!(normalize_progress(75.0, None), 0.75);
        assert_eq!(normalize_progress(0.4, None), 0.4);
        assert_eq!(normalize_progress(500.0, None), 1.0);
        assert_eq!(normalize_progress(-3.0, None), 0.0);
    }

    #[test]
    fn cancel_marks_only_running_tools() {
        let mut log = HistoryLog::new();
        log.apply_tool_event(&start("tc_done"));
        log.apply_tool_event(&ToolEvent::ToolEnd {
            tool_call_id: "tc_done".into(),
            is_error: false,
            summary: None,
            message: String::new(),
        });
        log.apply_tool_event(&start("tc_running"));

        let cancelled = log.cancel_running_tools();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].tool_call_id, "tc_running");
        assert_eq!(cancelled[0].summary, Some(json!({"cancelled": true})));

        // Idempotent: a second cancel finds nothing running.
        assert!(log.cancel_running_tools().is_empty());
    }

    #[test]
    fn clear_resets_index() {
        let mut log = HistoryLog::new();
        log.push_user("hello", vec![]);
        log.apply_tool_event(&start("tc_1"));
        log.clear();
        assert!(log.entries().is_empty());

        // Same id after clear creates a fresh card.
        log.apply_tool_event(&start("tc_1"));
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn serialized_entries_carry_role_tags() {
        let mut log = HistoryLog::new();
        log.push_user("hi", vec![]);
        log.push_assistant("hello", None);
        log.apply_tool_event(&start("tc_1"));

        let v = log.to_value();
        assert_eq!(v[0]["role"], "user");
        assert_eq!(v[1]["role"], "assistant");
        assert_eq!(v[2]["role"], "tool");
        assert_eq!(v[2]["state"], "running");
    }
}
