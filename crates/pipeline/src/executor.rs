//! Template-driven pipeline execution.
//!
//! Nodes run in the fixed registry order. Semi-auto templates pause at
//! confirm-required nodes and fall back to the template's own params on
//! timeout; errors on mandatory nodes abort the run, all other errors
//! are recorded and execution continues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use cf_domain::template::{
    is_mandatory_node, AutoMode, EditTemplate, NodeConfig, NodeMode, DEFAULT_PIPELINE_ORDER,
    SEMI_AUTO_TIMEOUT_MAX, SEMI_AUTO_TIMEOUT_MIN,
};

use crate::cancel::CancelFlag;
use crate::runtime::{internal_tool_call_id, invoke_node, ToolRuntime};
use crate::tool::ToolRequest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Done,
    Error,
    Skipped,
    Cancelled,
    WaitingConfirm,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
            StepStatus::WaitingConfirm => "waiting_confirm",
        }
    }
}

/// Receives step-by-step progress, typically forwarded to the client.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, node_id: &str, status: StepStatus, progress: f64, message: &str);
}

/// Asks the user to confirm a node's params. Implementations block
/// until a reply arrives; the executor applies the timeout.
#[async_trait]
pub trait ConfirmGate: Send + Sync {
    async fn confirm(
        &self,
        node_id: &str,
        params: &Map<String, Value>,
        timeout_sec: u64,
    ) -> Option<Map<String, Value>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<String>,
    pub results: Map<String, Value>,
}

impl PipelineRunResult {
    fn done(results: Map<String, Value>) -> Self {
        Self {
            status: "done".into(),
            failed_node: None,
            results,
        }
    }

    fn cancelled(results: Map<String, Value>) -> Self {
        Self {
            status: "cancelled".into(),
            failed_node: None,
            results,
        }
    }

    fn failed(node_id: &str, results: Map<String, Value>) -> Self {
        Self {
            status: "error".into(),
            failed_node: Some(node_id.to_string()),
            results,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PipelineExecutor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PipelineExecutor {
    runtime: Arc<ToolRuntime>,
}

impl PipelineExecutor {
    pub fn new(runtime: Arc<ToolRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn run(
        &self,
        template: &EditTemplate,
        progress: Option<&dyn ProgressSink>,
        confirm: Option<&dyn ConfirmGate>,
        cancel: &CancelFlag,
    ) -> PipelineRunResult {
        let plan = build_execution_plan(template);
        let total = plan.len() as f64;
        let timeout_sec = template
            .semi_auto_timeout_sec
            .clamp(SEMI_AUTO_TIMEOUT_MIN, SEMI_AUTO_TIMEOUT_MAX);

        tracing::info!(
            template = %template.name,
            auto_mode = ?template.auto_mode,
            nodes = plan.len(),
            "starting pipeline"
        );

        let mut results = Map::new();

        for (idx, node_cfg) in plan.iter().enumerate() {
            let node_id = node_cfg.node_id.as_str();
            let at = idx as f64 / total;
            let after = (idx + 1) as f64 / total;

            if cancel.is_raised() {
                tracing::info!(node_id, "pipeline cancelled");
                emit(progress, node_id, StepStatus::Cancelled, at, "cancelled by user").await;
                return PipelineRunResult::cancelled(results);
            }

            if node_cfg.mode == NodeMode::Skip {
                emit(progress, node_id, StepStatus::Skipped, after, "skipped").await;
                results.insert(node_id.to_string(), json!({"status": "skipped"}));
                continue;
            }

            let mut params = node_cfg.params.clone();
            if template.auto_mode == AutoMode::SemiAuto && node_cfg.confirm_required {
                if let Some(gate) = confirm {
                    emit(
                        progress,
                        node_id,
                        StepStatus::WaitingConfirm,
                        at,
                        &format!("waiting for confirmation ({timeout_sec}s)"),
                    )
                    .await;
                    params = confirm_or_timeout(gate, node_id, params, timeout_sec).await;
                }
            }

            emit(progress, node_id, StepStatus::Running, at, &format!("running {node_id}")).await;

            let mut args = params;
            args.insert(
                "artifact_id".into(),
                Value::String(self.runtime.store.generate_artifact_id(node_id)),
            );
            let req = ToolRequest {
                node_id: node_id.to_string(),
                tool_call_id: internal_tool_call_id(),
                mode: node_cfg.mode,
                args,
                depth: 0,
            };

            match invoke_node(&self.runtime, req).await {
                Ok(outcome) => {
                    results.insert(
                        node_id.to_string(),
                        json!({
                            "status": if outcome.is_error { "error" } else { "done" },
                            "summary": outcome.summary,
                            "is_error": outcome.is_error,
                        }),
                    );
                    if outcome.is_error {
                        tracing::error!(node_id, summary = %outcome.summary, "node returned error");
                        emit(progress, node_id, StepStatus::Error, after, &outcome.summary).await;
                        if is_mandatory_node(node_id) {
                            return PipelineRunResult::failed(node_id, results);
                        }
                    } else {
                        emit(progress, node_id, StepStatus::Done, after, &outcome.summary).await;
                    }
                }
                Err(e) => {
                    tracing::error!(node_id, error = %e, "node failed");
                    results.insert(
                        node_id.to_string(),
                        json!({"status": "error", "error": e.to_string()}),
                    );
                    emit(progress, node_id, StepStatus::Error, after, &e.to_string()).await;
                    if is_mandatory_node(node_id) {
                        return PipelineRunResult::failed(node_id, results);
                    }
                }
            }
        }

        tracing::info!("pipeline completed");
        PipelineRunResult::done(results)
    }
}

/// Every node in registry order: template config when present,
/// otherwise mandatory nodes run and optional nodes skip.
fn build_execution_plan(template: &EditTemplate) -> Vec<NodeConfig> {
    let mut plan = Vec::with_capacity(DEFAULT_PIPELINE_ORDER.len());
    for node_id in DEFAULT_PIPELINE_ORDER {
        if let Some(cfg) = template.nodes.iter().find(|n| n.node_id == *node_id) {
            plan.push(cfg.clone());
        } else if is_mandatory_node(node_id) {
            plan.push(NodeConfig::new(node_id, NodeMode::Auto));
        } else {
            plan.push(NodeConfig::new(node_id, NodeMode::Skip));
        }
    }
    plan
}

async fn confirm_or_timeout(
    gate: &dyn ConfirmGate,
    node_id: &str,
    params: Map<String, Value>,
    timeout_sec: u64,
) -> Map<String, Value> {
    match tokio::time::timeout(
        Duration::from_secs(timeout_sec),
        gate.confirm(node_id, &params, timeout_sec),
    )
    .await
    {
        Ok(Some(confirmed)) => {
            tracing::info!(node_id, "confirmed by user");
            confirmed
        }
        Ok(None) => params,
        Err(_) => {
            tracing::info!(node_id, timeout_sec, "confirmation timed out, using defaults");
            params
        }
    }
}

async fn emit(
    progress: Option<&dyn ProgressSink>,
    node_id: &str,
    status: StepStatus,
    fraction: f64,
    message: &str,
) {
    if let Some(sink) = progress {
        sink.progress(node_id, status, fraction, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::default_interceptors;
    use crate::registry::{NodeRegistry, NodeSpec};
    use crate::runtime::RuntimeContext;
    use crate::tool::{PipelineTool, ToolOutcome};
    use cf_artifacts::ArtifactStore;
    use cf_domain::Result;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    struct StubTool {
        node_id: String,
        fail: bool,
        seen_params: Arc<Mutex<Vec<Map<String, Value>>>>,
    }

    #[async_trait]
    impl PipelineTool for StubTool {
        async fn call(&self, args: Map<String, Value>, _ctx: &RuntimeContext) -> Result<ToolOutcome> {
            self.seen_params.lock().push(args.clone());
            let aid = args["artifact_id"].as_str().unwrap().to_string();
            if self.fail {
                Ok(ToolOutcome::error(aid, format!("{} blew up", self.node_id)))
            } else {
                Ok(ToolOutcome::ok(aid, json!({}), format!("{} ok", self.node_id)))
            }
        }
    }

    struct Recorder {
        events: Mutex<Vec<(String, StepStatus)>>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn progress(&self, node_id: &str, status: StepStatus, _p: f64, _m: &str) {
            self.events.lock().push((node_id.to_string(), status));
        }
    }

    struct SilentGate;

    #[async_trait]
    impl ConfirmGate for SilentGate {
        async fn confirm(
            &self,
            _node_id: &str,
            _params: &Map<String, Value>,
            _timeout_sec: u64,
        ) -> Option<Map<String, Value>> {
            // The user never replies.
            std::future::pending().await
        }
    }

    struct Fixture {
        executor: PipelineExecutor,
        seen: Arc<Mutex<Vec<Map<String, Value>>>>,
        _dir: tempfile::TempDir,
    }

    /// Registers stubs for every pipeline node with no dependencies so
    /// executor behavior is isolated from resolution.
    fn fixture(failing: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let specs: Vec<NodeSpec> = DEFAULT_PIPELINE_ORDER
            .iter()
            .map(|id| NodeSpec {
                node_id: id.to_string(),
                kind: id.to_string(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            })
            .collect();
        let mut registry = NodeRegistry::new(specs);
        for id in DEFAULT_PIPELINE_ORDER {
            registry.register_tool(
                id,
                Arc::new(StubTool {
                    node_id: id.to_string(),
                    fail: failing.contains(id),
                    seen_params: seen.clone(),
                }),
            );
        }

        let store = Arc::new(ArtifactStore::new(&dir.path().join("artifacts"), "s1").unwrap());
        let ctx = RuntimeContext {
            session_id: "s1".into(),
            media_dir: dir.path().join("media"),
            bgm_dir: dir.path().join("bgm"),
            outputs_dir: dir.path().join("outputs"),
            lang: "en".into(),
            chat_model_key: "m".into(),
            vlm_model_key: "v".into(),
            tts: None,
            asset_api_key: None,
            events: None,
        };
        std::fs::create_dir_all(dir.path().join("media")).unwrap();
        let runtime = ToolRuntime::new(Arc::new(registry), store, ctx, default_interceptors());

        Fixture {
            executor: PipelineExecutor::new(runtime),
            seen,
            _dir: dir,
        }
    }

    fn bare_template(auto_mode: AutoMode) -> EditTemplate {
        EditTemplate {
            template_id: "t1".into(),
            name: "test".into(),
            description: String::new(),
            nodes: vec![],
            auto_mode,
            semi_auto_timeout_sec: 3,
            is_preset: false,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    #[tokio::test]
    async fn empty_template_runs_only_mandatory_nodes() {
        let f = fixture(&[]);
        let recorder = Recorder {
            events: Mutex::new(vec![]),
        };
        let result = f
            .executor
            .run(&bare_template(AutoMode::FullAuto), Some(&recorder), None, &CancelFlag::new())
            .await;

        assert_eq!(result.status, "done");
        let done: Vec<String> = recorder
            .events
            .lock()
            .iter()
            .filter(|(_, s)| *s == StepStatus::Done)
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(done, ["load_media", "plan_timeline", "render_video"]);
        let skipped = recorder
            .events
            .lock()
            .iter()
            .filter(|(_, s)| *s == StepStatus::Skipped)
            .count();
        assert_eq!(skipped, DEFAULT_PIPELINE_ORDER.len() - 3);
    }

    #[tokio::test]
    async fn cancel_before_first_step_stops_immediately() {
        let f = fixture(&[]);
        let cancel = CancelFlag::new();
        cancel.raise();
        let result = f
            .executor
            .run(&bare_template(AutoMode::FullAuto), None, None, &cancel)
            .await;
        assert_eq!(result.status, "cancelled");
        assert!(f.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn optional_node_error_continues_mandatory_error_aborts() {
        let f = fixture(&["select_bgm", "render_video"]);
        let mut template = bare_template(AutoMode::FullAuto);
        template.nodes = vec![
            NodeConfig::new("select_bgm", NodeMode::Auto),
            NodeConfig::new("plan_timeline", NodeMode::Auto),
            NodeConfig::new("render_video", NodeMode::Auto),
        ];

        let result = f.executor.run(&template, None, None, &CancelFlag::new()).await;
        assert_eq!(result.status, "error");
        assert_eq!(result.failed_node.as_deref(), Some("render_video"));
        // select_bgm errored but the run still reached render_video.
        assert_eq!(result.results["select_bgm"]["status"], "error");
        assert_eq!(result.results["plan_timeline"]["status"], "done");
    }

    #[tokio::test(start_paused = true)]
    async fn semi_auto_timeout_falls_back_to_template_params() {
        let f = fixture(&[]);
        let mut template = bare_template(AutoMode::SemiAuto);
        template.nodes = vec![
            NodeConfig::new("load_media", NodeMode::Auto),
            NodeConfig::new("filter_clips", NodeMode::Auto)
                .with_params(json!({"user_request": "keep the good ones"}))
                .confirmed(),
            NodeConfig::new("plan_timeline", NodeMode::Auto),
            NodeConfig::new("render_video", NodeMode::Auto),
        ];

        let gate = SilentGate;
        let result = f
            .executor
            .run(&template, None, Some(&gate), &CancelFlag::new())
            .await;

        // The unanswered confirm must not fail the run.
        assert_eq!(result.status, "done");
        assert_eq!(result.results["filter_clips"]["status"], "done");

        // filter_clips ran with the template-declared params.
        let filter_args = f
            .seen
            .lock()
            .iter()
            .find(|args| {
                args.get("artifact_id")
                    .and_then(Value::as_str)
                    .is_some_and(|a| a.starts_with("filter_clips_"))
            })
            .cloned()
            .unwrap();
        assert_eq!(filter_args["user_request"], "keep the good ones");
    }

    #[tokio::test]
    async fn confirmed_params_replace_template_params() {
        struct ReplacingGate;

        #[async_trait]
        impl ConfirmGate for ReplacingGate {
            async fn confirm(
                &self,
                _node_id: &str,
                _params: &Map<String, Value>,
                _timeout_sec: u64,
            ) -> Option<Map<String, Value>> {
                let mut out = Map::new();
                out.insert("user_request".into(), Value::String("user says so".into()));
                Some(out)
            }
        }

        let f = fixture(&[]);
        let mut template = bare_template(AutoMode::SemiAuto);
        template.nodes = vec![
            NodeConfig::new("load_media", NodeMode::Auto),
            NodeConfig::new("filter_clips", NodeMode::Auto)
                .with_params(json!({"user_request": "template default"}))
                .confirmed(),
            NodeConfig::new("plan_timeline", NodeMode::Auto),
            NodeConfig::new("render_video", NodeMode::Auto),
        ];

        let gate = ReplacingGate;
        let result = f
            .executor
            .run(&template, None, Some(&gate), &CancelFlag::new())
            .await;
        assert_eq!(result.status, "done");

        let filter_args = f
            .seen
            .lock()
            .iter()
            .find(|args| {
                args.get("artifact_id")
                    .and_then(Value::as_str)
                    .is_some_and(|a| a.starts_with("filter_clips_"))
            })
            .cloned()
            .unwrap();
        assert_eq!(filter_args["user_request"], "user says so");
    }
}
