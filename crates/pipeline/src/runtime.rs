//! Tool runtime: the shared context, the interceptor chain entry
//! point, and tool-event emission.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use cf_artifacts::ArtifactStore;
use cf_domain::wire::ToolEvent;
use cf_domain::{short_hex_id, Result};

use crate::interceptors::ToolInterceptor;
use crate::registry::NodeRegistry;
use crate::tool::{ToolOutcome, ToolRequest};

/// Server label tool events carry on the wire.
pub const TOOL_SERVER: &str = "pipeline";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session runtime state threaded into every tool call.
#[derive(Clone)]
pub struct RuntimeContext {
    pub session_id: String,
    pub media_dir: PathBuf,
    pub bgm_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub lang: String,
    pub chat_model_key: String,
    pub vlm_model_key: String,
    /// TTS selection `{provider, voice_index, <provider>: {base_url}}`.
    pub tts: Option<Value>,
    pub asset_api_key: Option<String>,
    /// Sink for tool progress events while a chat turn is live.
    pub events: Option<UnboundedSender<ToolEvent>>,
}

impl RuntimeContext {
    pub fn emit(&self, event: ToolEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolRuntime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a tool call needs: registry, per-session artifact store,
/// mutable context, and the interceptor chain.
pub struct ToolRuntime {
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<ArtifactStore>,
    context: RwLock<RuntimeContext>,
    interceptors: Vec<Arc<dyn ToolInterceptor>>,
}

impl ToolRuntime {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<ArtifactStore>,
        context: RuntimeContext,
        interceptors: Vec<Arc<dyn ToolInterceptor>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            context: RwLock::new(context),
            interceptors,
        })
    }

    /// Snapshot of the current context.
    pub fn context(&self) -> RuntimeContext {
        self.context.read().clone()
    }

    pub fn update_context(&self, f: impl FnOnce(&mut RuntimeContext)) {
        f(&mut self.context.write());
    }

    /// Install the tool-event sink for the duration of a turn.
    pub fn set_event_sink(&self, tx: Option<UnboundedSender<ToolEvent>>) {
        self.context.write().events = tx;
    }

    pub fn emit(&self, event: ToolEvent) {
        self.context.read().emit(event);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Walks the remaining interceptors; the innermost position dispatches
/// to the actual tool implementation.
pub struct Next<'a> {
    runtime: &'a Arc<ToolRuntime>,
    rest: &'a [Arc<dyn ToolInterceptor>],
}

impl<'a> Next<'a> {
    pub fn runtime(&self) -> &Arc<ToolRuntime> {
        self.runtime
    }

    pub async fn run(self, req: ToolRequest) -> Result<ToolOutcome> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                head.handle(
                    req,
                    Next {
                        runtime: self.runtime,
                        rest: tail,
                    },
                )
                .await
            }
            None => {
                let tool = self
                    .runtime
                    .registry
                    .get_tool(&req.node_id)
                    .ok_or_else(|| {
                        cf_domain::Error::tool(&req.node_id, "no tool registered for node")
                    })?;
                let ctx = self.runtime.context();
                tool.call(req.args, &ctx).await
            }
        }
    }
}

/// Generate a tool-call id for internally-issued invocations
/// (dependency resolution, pipeline steps).
pub fn internal_tool_call_id() -> String {
    format!("tc_{}", short_hex_id(12))
}

/// Run one node through the full interceptor chain, emitting
/// `tool_start`/`tool_end` around it.
pub async fn invoke_node(runtime: &Arc<ToolRuntime>, req: ToolRequest) -> Result<ToolOutcome> {
    let tool_call_id = req.tool_call_id.clone();
    let node_id = req.node_id.clone();

    runtime.emit(ToolEvent::ToolStart {
        tool_call_id: tool_call_id.clone(),
        server: TOOL_SERVER.to_string(),
        name: node_id.clone(),
        args: Value::Object(public_args(&req.args)),
    });

    let result = Next {
        runtime,
        rest: &runtime.interceptors,
    }
    .run(req)
    .await;

    match &result {
        Ok(outcome) => {
            runtime.emit(ToolEvent::ToolEnd {
                tool_call_id,
                is_error: outcome.is_error,
                summary: Some(json!({"node_summary": outcome.summary})),
                message: String::new(),
            });
        }
        Err(e) => {
            runtime.emit(ToolEvent::ToolEnd {
                tool_call_id,
                is_error: true,
                summary: Some(json!({"node_summary": e.to_string()})),
                message: String::new(),
            });
        }
    }
    result
}

/// Args as shown on tool cards: blob fields would flood the UI, so any
/// inlined payload keys are elided.
fn public_args(args: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in args {
        match v {
            Value::Object(_) | Value::Array(_) => {
                out.insert(k.clone(), Value::String("…".to_string()));
            }
            other => {
                out.insert(k.clone(), other.clone());
            }
        }
    }
    out
}
