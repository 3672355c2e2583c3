//! The streaming turn controller.
//!
//! One chat turn multiplexes the agent's event stream and tool
//! execution events onto the single outbound WebSocket channel, in
//! strict order:
//!
//! ```text
//! assistant.start
//!   (assistant.delta | tool.start | tool.progress | tool.end | assistant.flush)*
//! assistant.end | error
//! ```
//!
//! `assistant.flush` is emitted right before a `tool.start` so tool
//! cards land between text bubbles. Cancellation rewrites the
//! model-facing message list so it only reflects what the user saw.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use cf_domain::message::{tool_call_ids_in, tool_result_ids_in, ContextMessage};
use cf_domain::wire::{ServerFrame, ToolEvent};
use cf_domain::unix_now;
use cf_pipeline::agent::{Agent, AgentItem};
use cf_pipeline::runtime::ToolRuntime;
use cf_sessions::ChatSession;

/// Grace period for the agent pump after an abort.
const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything the turn loop can wake up on.
enum TurnItem {
    Delta(String),
    Update(Vec<ContextMessage>),
    Tool(ToolEvent),
    Done,
    Error(String),
    Cancelled,
}

async fn send(out: &mpsc::Sender<ServerFrame>, frame: ServerFrame) -> bool {
    out.send(frame).await.is_ok()
}

/// Run one chat turn to completion. The caller holds the session's
/// chat lock, has already appended the user message to history and
/// context, and has cleared the cancel flag.
pub async fn run_turn(
    session: &Arc<ChatSession>,
    agent: Arc<dyn Agent>,
    runtime: &Arc<ToolRuntime>,
    out: &mpsc::Sender<ServerFrame>,
) {
    if !send(out, ServerFrame::AssistantStart {}).await {
        return;
    }

    // Single event queue: agent items and tool events interleave in
    // arrival order.
    let (event_tx, mut event_rx) = mpsc::channel::<TurnItem>(256);

    // Tool events flow through the runtime sink for the turn's
    // duration.
    let (tool_tx, mut tool_rx) = mpsc::unbounded_channel::<ToolEvent>();
    runtime.set_event_sink(Some(tool_tx));
    let tool_forward = {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = tool_rx.recv().await {
                if event_tx.send(TurnItem::Tool(ev)).await.is_err() {
                    break;
                }
            }
        })
    };

    // Background pump driving the agent stream into the queue.
    let messages = session.context.lock().clone();
    let pump = {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut stream = agent.stream_turn(messages);
            while let Some(item) = stream.next().await {
                let item = match item {
                    AgentItem::Delta(text) => TurnItem::Delta(text),
                    AgentItem::Update(msgs) => TurnItem::Update(msgs),
                    AgentItem::Done => TurnItem::Done,
                    AgentItem::Error(message) => TurnItem::Error(message),
                };
                let terminal = matches!(item, TurnItem::Done | TurnItem::Error(_));
                if event_tx.send(item).await.is_err() || terminal {
                    break;
                }
            }
        })
    };
    drop(event_tx);

    let mut seg_text = String::new();
    let mut seg_ts: Option<f64> = None;
    let mut new_messages: Vec<ContextMessage> = Vec::new();
    let mut was_interrupted = false;

    loop {
        // Queued events win over a simultaneous cancel so a done/flush
        // already in the queue is not clobbered.
        let item = tokio::select! {
            biased;
            item = event_rx.recv() => {
                item.unwrap_or_else(|| TurnItem::Error("agent stream closed unexpectedly".into()))
            }
            _ = session.cancel.wait() => TurnItem::Cancelled,
        };

        match item {
            TurnItem::Delta(delta) => {
                if delta.is_empty() {
                    continue;
                }
                if seg_ts.is_none() {
                    seg_ts = Some(unix_now());
                }
                seg_text.push_str(&delta);
                if !send(out, ServerFrame::AssistantDelta { delta }).await {
                    break;
                }
            }

            TurnItem::Tool(event) => {
                if matches!(event, ToolEvent::ToolStart { .. })
                    && !flush_segment(session, out, &mut seg_text, &mut seg_ts).await
                {
                    break;
                }
                let card = session.history.lock().apply_tool_event(&event);
                let Some(card) = card else { continue };
                let frame = match &event {
                    ToolEvent::ToolStart { .. } => ServerFrame::ToolStart {
                        tool_call_id: card.tool_call_id,
                        server: card.server,
                        name: card.name,
                        args: card.args,
                    },
                    ToolEvent::ToolProgress { .. } => ServerFrame::ToolProgress {
                        tool_call_id: card.tool_call_id,
                        server: card.server,
                        name: card.name,
                        progress: card.progress,
                        message: card.message,
                    },
                    ToolEvent::ToolEnd { .. } => ServerFrame::ToolEnd {
                        tool_call_id: card.tool_call_id,
                        server: card.server,
                        name: card.name,
                        is_error: card.state == cf_sessions::ToolState::Error,
                        summary: card.summary,
                    },
                };
                if !send(out, frame).await {
                    break;
                }
            }

            TurnItem::Update(msgs) => {
                new_messages.extend(msgs);
            }

            TurnItem::Done => {
                let final_text = seg_text.trim().to_string();
                if !final_text.is_empty() {
                    session.history.lock().push_assistant(&final_text, seg_ts);
                }
                if !new_messages.is_empty() {
                    session.context.lock().extend(new_messages.drain(..));
                }
                let _ = send(
                    out,
                    ServerFrame::AssistantEnd {
                        text: final_text,
                        interrupted: false,
                    },
                )
                .await;
                break;
            }

            TurnItem::Error(message) => {
                let partial = seg_text.trim().to_string();
                if !partial.is_empty() {
                    session.history.lock().push_assistant(&partial, seg_ts);
                    session
                        .context
                        .lock()
                        .push(ContextMessage::assistant(partial.clone()));
                }
                if !new_messages.is_empty() {
                    session.context.lock().extend(new_messages.drain(..));
                }
                let _ = send(
                    out,
                    ServerFrame::Error {
                        message,
                        retry_after: None,
                        partial_text: Some(partial),
                    },
                )
                .await;
                break;
            }

            TurnItem::Cancelled => {
                if was_interrupted {
                    break;
                }
                was_interrupted = true;

                pump.abort();

                // Stop the spinners: every running tool card becomes a
                // cancelled error, with a synthetic tool.end each.
                let cancelled_cards = session.history.lock().cancel_running_tools();
                for card in &cancelled_cards {
                    let _ = send(
                        out,
                        ServerFrame::ToolEnd {
                            tool_call_id: card.tool_call_id.clone(),
                            server: card.server.clone(),
                            name: card.name.clone(),
                            is_error: true,
                            summary: card.summary.clone(),
                        },
                    )
                    .await;
                }

                let interrupted_text = seg_text.trim().to_string();
                if !interrupted_text.is_empty() {
                    session.history.lock().push_assistant(&interrupted_text, seg_ts);
                }

                let cancelled_ids: Vec<String> = cancelled_cards
                    .iter()
                    .map(|c| c.tool_call_id.clone())
                    .collect();
                let commit = sanitize_on_cancel(&new_messages, &interrupted_text, &cancelled_ids);

                {
                    let mut context = session.context.lock();
                    if !commit.is_empty() {
                        context.extend(commit);
                    } else if !interrupted_text.is_empty() {
                        // No update arrived, but the user saw tokens.
                        context.push(ContextMessage::assistant(interrupted_text.clone()));
                    }
                }

                let _ = send(
                    out,
                    ServerFrame::AssistantEnd {
                        text: interrupted_text,
                        interrupted: true,
                    },
                )
                .await;

                session.cancel.clear();
                break;
            }
        }
    }

    // Teardown in all paths: detach the sink, stop the pump with a
    // bounded grace, drop the forwarder.
    runtime.set_event_sink(None);
    pump.abort();
    let _ = tokio::time::timeout(PUMP_SHUTDOWN_GRACE, pump).await;
    tool_forward.abort();
}

/// Seal the current text bubble: emit `assistant.flush` and commit the
/// accumulated segment to history. Returns `false` on transport loss.
async fn flush_segment(
    session: &Arc<ChatSession>,
    out: &mpsc::Sender<ServerFrame>,
    seg_text: &mut String,
    seg_ts: &mut Option<f64>,
) -> bool {
    if !send(out, ServerFrame::AssistantFlush {}).await {
        return false;
    }
    let text = seg_text.trim().to_string();
    if !text.is_empty() {
        session.history.lock().push_assistant(&text, *seg_ts);
    }
    seg_text.clear();
    *seg_ts = None;
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancel-time sanitization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rewrite the turn's new messages so the model-facing context matches
/// what the user saw at the moment of cancellation:
///
/// 1. every issued tool call without a result gets a synthetic
///    `{cancelled:true}` result, inserted right after its assistant;
/// 2. results for UI-cancelled calls are *replaced* with
///    `{cancelled:true}` even if the tool actually finished;
/// 3. the trailing assistant text is replaced by `interrupted_text`
///    (dropping everything after it), or removed entirely when no
///    token was seen — unless a later tool call proves it was
///    pre-tool text.
pub fn sanitize_on_cancel(
    new_messages: &[ContextMessage],
    interrupted_text: &str,
    ui_cancelled_ids: &[String],
) -> Vec<ContextMessage> {
    let mut msgs: Vec<ContextMessage> = new_messages.to_vec();
    let interrupted = interrupted_text.trim();

    let issued = tool_call_ids_in(&msgs);
    let resulted = tool_result_ids_in(&msgs);
    let pending: HashSet<String> = issued.difference(&resulted).cloned().collect();

    let mut cancel_ids: HashSet<String> = ui_cancelled_ids.iter().cloned().collect();
    cancel_ids.extend(pending);

    // 1) Force-replace results the user never saw complete.
    for msg in msgs.iter_mut() {
        if let ContextMessage::Tool {
            tool_call_id,
            content,
        } = msg
        {
            if cancel_ids.contains(tool_call_id) {
                *content = json!({"cancelled": true});
            }
        }
    }

    // 2) Inject missing results directly after the issuing assistant.
    let mut existing = tool_result_ids_in(&msgs);
    let mut ordered_ids: Vec<String> = cancel_ids.into_iter().collect();
    ordered_ids.sort();
    for tool_call_id in ordered_ids {
        if existing.contains(&tool_call_id) {
            continue;
        }
        let insert_at = msgs
            .iter()
            .rposition(|m| m.tool_call_ids().contains(&tool_call_id))
            .map(|idx| idx + 1);
        let Some(insert_at) = insert_at else { continue };
        msgs.insert(
            insert_at,
            ContextMessage::tool_result(&tool_call_id, json!({"cancelled": true})),
        );
        existing.insert(tool_call_id);
    }

    // 3) Reconcile the trailing assistant text with what was seen.
    let last_text_idx = msgs.iter().rposition(|m| m.is_text_assistant());

    if !interrupted.is_empty() {
        match last_text_idx {
            None => msgs.push(ContextMessage::assistant(interrupted)),
            Some(idx) => {
                // Replace with the seen prefix and drop anything after
                // it so unseen completion tokens never reach context.
                msgs.truncate(idx);
                msgs.push(ContextMessage::assistant(interrupted));
            }
        }
        return msgs;
    }

    if let Some(idx) = last_text_idx {
        let has_tool_call_after = msgs[idx + 1..].iter().any(|m| m.is_tool_call_assistant());
        if !has_tool_call_after {
            msgs.truncate(idx);
        }
    }
    msgs
}
