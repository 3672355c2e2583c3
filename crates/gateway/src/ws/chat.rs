//! Per-session chat WebSocket.
//!
//! One socket per session: the client drives chat turns, pipeline runs
//! and housekeeping through `{type, data}` frames; a single writer
//! task drains the outbound channel so frames never interleave.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};

use cf_domain::template::AutoMode;
use cf_domain::unix_now;
use cf_domain::wire::{ChatSendData, ClientFrame, ServerFrame};
use cf_pipeline::executor::{ConfirmGate, PipelineExecutor, ProgressSink, StepStatus};
use cf_sessions::ChatSession;

use crate::limits::rules::{admit_chat_send, admit_ws_connect, client_ip};
use crate::runtime::run_turn;
use crate::state::AppState;

/// "Try again later" close code (RFC 6455).
const CLOSE_TRY_AGAIN: u16 = 1013;
/// Application close code for an unknown session.
const CLOSE_SESSION_NOT_FOUND: u16 = 4404;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upgrade handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(
        &headers,
        Some(peer),
        state.config.limits.trust_proxy_headers,
    );

    if let Err(retry_after) = admit_ws_connect(&state, &ip) {
        return ws
            .on_upgrade(move |socket| {
                close_with(socket, CLOSE_TRY_AGAIN, format!("rate_limited, retry after {retry_after}s"))
            })
            .into_response();
    }

    // Connection ceiling: refuse instead of queueing.
    let permit = match state.ws_connections.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return ws
                .on_upgrade(move |socket| {
                    close_with(
                        socket,
                        CLOSE_TRY_AGAIN,
                        "server busy (websocket connections limit)".to_string(),
                    )
                })
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let _permit = permit;
        handle_socket(socket, state, session_id, ip).await;
    })
    .into_response()
}

async fn close_with(mut socket: WebSocket, code: u16, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, ip: String) {
    let Some(session) = state.sessions.get(&session_id) else {
        close_with(socket, CLOSE_SESSION_NOT_FOUND, "session not found".into()).await;
        return;
    };

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Single-writer: everything outbound goes through this channel.
    let (out, mut out_rx) = mpsc::channel::<ServerFrame>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let snapshot = session.snapshot().await;
    let _ = out.send(ServerFrame::SessionSnapshot(snapshot)).await;

    tracing::info!(session_id = %session.session_id, ip, "chat socket connected");

    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = out.send(ServerFrame::error("unknown or malformed frame")).await;
                continue;
            }
        };

        match frame {
            ClientFrame::Ping => {
                let _ = out.send(ServerFrame::Pong { ts: unix_now() }).await;
            }

            ClientFrame::SetLang { lang } => {
                let lang = session.set_lang(lang.as_deref().unwrap_or(""));
                let _ = out.send(ServerFrame::SessionLang { lang }).await;
            }

            ClientFrame::ChatClear => {
                let _turn = session.chat_lock.clone().lock_owned().await;
                session.reset_conversation();
                let _ = out.send(ServerFrame::ChatCleared { ok: true }).await;
            }

            ClientFrame::ChatSend(data) => {
                handle_chat_send(&state, &session, &ip, &out, data).await;
            }

            ClientFrame::PipelineStart { template_id } => {
                handle_pipeline_start(&state, &session, &out, template_id).await;
            }

            ClientFrame::PipelineCancel => {
                if session.pipeline_running() {
                    session.pipeline_cancel.raise();
                    let _ = out.send(ServerFrame::PipelineCancelled { ok: true }).await;
                } else {
                    let _ = out.send(ServerFrame::error("no pipeline is running")).await;
                }
            }

            ClientFrame::PipelineConfirmResponse { params } => {
                let params = params
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                let ok = session.resolve_confirm(params);
                let _ = out.send(ServerFrame::PipelineConfirmAck { ok }).await;
            }
        }
    }

    writer.abort();
    tracing::info!(session_id = %session.session_id, "chat socket disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat.send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_chat_send(
    state: &AppState,
    session: &Arc<ChatSession>,
    ip: &str,
    out: &mpsc::Sender<ServerFrame>,
    data: ChatSendData,
) {
    // One turn per session, strictly.
    let Ok(_turn) = session.chat_lock.clone().try_lock_owned() else {
        let _ = out
            .send(ServerFrame::error(
                "previous message is still streaming, wait for it to finish",
            ))
            .await;
        return;
    };

    // Only chat.send is rate limited: it is the one that costs LLM.
    if let Err(retry_after) = admit_chat_send(state, ip) {
        let _ = out
            .send(ServerFrame::rate_limited(
                format!("rate limited, retry in {retry_after}s"),
                retry_after,
            ))
            .await;
        return;
    }

    let Ok(_llm_slot) = state.chat_turns.clone().try_acquire_owned() else {
        let _ = out
            .send(ServerFrame::error("server busy (model concurrency full), retry shortly"))
            .await;
        return;
    };

    let prompt = data.text.trim().to_string();
    if prompt.is_empty() {
        return;
    }

    // Fresh turn: drop any stale cancel signal.
    session.cancel.clear();

    if let Err(e) = session.apply_service_config(data.service_config.as_ref()) {
        let _ = out.send(ServerFrame::error(e.to_string())).await;
        return;
    }
    if let Some(llm) = data.llm_model.as_deref() {
        session.set_chat_model(llm);
    }
    if let Some(vlm) = data.vlm_model.as_deref() {
        session.set_vlm_model(vlm);
    }
    if let Some(lang) = data.lang.as_deref() {
        if matches!(lang.trim().to_lowercase().as_str(), "zh" | "en") {
            session.set_lang(lang);
        }
    }

    let agent = match session.ensure_agent(state.agent_factory.as_ref()) {
        Ok(agent) => agent,
        Err(e) => {
            let _ = out.send(ServerFrame::error(e.to_string())).await;
            return;
        }
    };
    let runtime = match session.ensure_tool_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = out.send(ServerFrame::error(e.to_string())).await;
            return;
        }
    };

    // Stage this turn's attachments out of pending.
    let attachments = session
        .take_pending_for_message(data.attachment_ids.as_deref())
        .await;
    let attachments_public: Vec<Value> =
        attachments.iter().map(|m| session.public_media(m)).collect();
    session.note_attachments_sent(attachments.len());

    session
        .history
        .lock()
        .push_user(&prompt, attachments_public.clone());
    session
        .context
        .lock()
        .push(cf_domain::message::ContextMessage::user(prompt.clone()));

    let ack = json!({
        "text": prompt,
        "attachments": attachments_public,
        "pending_media": session.pending_media_public().await,
        "llm_model_key": session.chat_model_key(),
        "vlm_model_key": session.vlm_model_key(),
    });
    if out.send(ServerFrame::ChatUser(ack)).await.is_err() {
        return;
    }

    run_turn(session, agent, &runtime, out).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline over WS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct WsProgress {
    out: mpsc::Sender<ServerFrame>,
}

#[async_trait]
impl ProgressSink for WsProgress {
    async fn progress(&self, node_id: &str, status: StepStatus, progress: f64, message: &str) {
        let _ = self
            .out
            .send(ServerFrame::PipelineProgress {
                node_id: node_id.to_string(),
                status: status.as_str().to_string(),
                progress,
                message: message.to_string(),
            })
            .await;
    }
}

struct WsConfirm {
    out: mpsc::Sender<ServerFrame>,
    session: Arc<ChatSession>,
}

#[async_trait]
impl ConfirmGate for WsConfirm {
    async fn confirm(
        &self,
        node_id: &str,
        params: &Map<String, Value>,
        timeout_sec: u64,
    ) -> Option<Map<String, Value>> {
        let _ = self
            .out
            .send(ServerFrame::PipelineConfirm {
                node_id: node_id.to_string(),
                params: Value::Object(params.clone()),
                timeout_sec,
            })
            .await;

        let (tx, rx) = oneshot::channel();
        self.session.set_confirm_sender(tx);
        let confirmed = rx.await.ok();
        self.session.clear_confirm_sender();
        confirmed
    }
}

async fn handle_pipeline_start(
    state: &AppState,
    session: &Arc<ChatSession>,
    out: &mpsc::Sender<ServerFrame>,
    template_id: String,
) {
    if session.pipeline_running() {
        let _ = out.send(ServerFrame::error("a pipeline is already running")).await;
        return;
    }

    let Some(template) = state.templates.get(&template_id) else {
        let _ = out
            .send(ServerFrame::error(format!("template not found: {template_id}")))
            .await;
        return;
    };

    let runtime = match session.prepare_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = out
                .send(ServerFrame::error(format!("pipeline initialization failed: {e}")))
                .await;
            return;
        }
    };

    session.pipeline_cancel.clear();

    let template_name = template.name.clone();
    let task = {
        let out = out.clone();
        let session = session.clone();
        let cancel = session.pipeline_cancel.clone();
        tokio::spawn(async move {
            let executor = PipelineExecutor::new(runtime);
            let progress = WsProgress { out: out.clone() };
            let gate = WsConfirm {
                out: out.clone(),
                session: session.clone(),
            };
            let confirm: Option<&dyn ConfirmGate> = if template.auto_mode == AutoMode::SemiAuto {
                Some(&gate)
            } else {
                None
            };

            let result = executor
                .run(&template, Some(&progress), confirm, &cancel)
                .await;

            let frame = if result.status == "error" {
                ServerFrame::PipelineError {
                    message: match &result.failed_node {
                        Some(node) => format!("pipeline failed at `{node}`"),
                        None => "pipeline failed".to_string(),
                    },
                }
            } else {
                ServerFrame::PipelineDone(
                    serde_json::to_value(&result).unwrap_or_else(|_| json!({"status": "done"})),
                )
            };
            let _ = out.send(frame).await;
        })
    };
    session.set_pipeline_task(task);

    let _ = out
        .send(ServerFrame::PipelineStarted {
            template_id,
            template_name,
        })
        .await;
}
