//! The interceptor chain wrapped around every tool call.
//!
//! Order: dependency injector → result persister → TTS injector →
//! asset-key injector → the tool itself. The dependency injector may
//! recursively execute producer nodes before letting the request
//! through; the persister stores every successful result as an
//! artifact.

use std::sync::Arc;

use async_recursion::async_recursion;
use async_trait::async_trait;
use serde_json::{Map, Value};

use cf_artifacts::blob::{inline_path_blobs, BlobCodec};
use cf_domain::template::NodeMode;
use cf_domain::{Error, Result};

use crate::registry::CollectResult;
use crate::runtime::{internal_tool_call_id, invoke_node, Next, ToolRuntime};
use crate::tool::{ToolOutcome, ToolRequest};

/// Cycle guard for recursive dependency resolution.
pub const MAX_RESOLVE_DEPTH: u32 = 10;

#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    async fn handle(&self, req: ToolRequest, next: Next<'_>) -> Result<ToolOutcome>;
}

/// The standard chain.
pub fn default_interceptors() -> Vec<Arc<dyn ToolInterceptor>> {
    vec![
        Arc::new(DependencyInjector),
        Arc::new(ResultPersister),
        Arc::new(TtsConfigInjector),
        Arc::new(AssetKeyInjector),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DependencyInjector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves a node's required kinds before it runs.
///
/// - `load_media` gets every file of the session media dir inlined as
///   `{path, base64, md5}` under `inputs`.
/// - Registered nodes get each required kind's newest artifact payload
///   merged into their args (blobs re-inlined); missing kinds trigger
///   recursive execution of a producer in `default` mode.
/// - Unregistered auxiliary tools only get the artifacts dir.
pub struct DependencyInjector;

#[async_trait]
impl ToolInterceptor for DependencyInjector {
    async fn handle(&self, mut req: ToolRequest, next: Next<'_>) -> Result<ToolOutcome> {
        let runtime = next.runtime().clone();
        let ctx = runtime.context();
        let store = runtime.store.clone();
        let node_id = req.node_id.clone();

        let artifact_id = req
            .arg_str("artifact_id")
            .map(str::to_string)
            .unwrap_or_else(|| store.generate_artifact_id(&node_id));

        let mut input_data = Map::new();

        if node_id == "load_media" {
            input_data.insert("inputs".into(), inline_media_dir(&ctx.media_dir)?);
        } else if let Some(spec) = runtime.registry.spec(&node_id) {
            let required = if req.mode == NodeMode::Auto {
                spec.require_prior_kinds.clone()
            } else {
                spec.default_require_prior_kinds.clone()
            };

            let mut collect = runtime.registry.check_executable(&store, &required);
            if !collect.executable {
                tracing::info!(
                    node_id,
                    missing = ?collect.missing,
                    "resolving missing dependencies"
                );
                resolve_missing(&runtime, &collect.missing, &node_id, req.depth).await?;
                collect = runtime.registry.check_executable(&store, &required);
                if !collect.executable {
                    return Err(Error::tool(
                        &node_id,
                        format!("dependencies still missing after resolution: {:?}", collect.missing),
                    ));
                }
            }
            load_collected(&runtime, &collect, &mut input_data)?;
        } else {
            input_data.insert(
                "artifacts_dir".into(),
                Value::String(store.session_dir().to_string_lossy().into_owned()),
            );
        }

        // Merge order: defaults, then caller args, then resolved inputs.
        let mut merged = Map::new();
        merged.insert("artifact_id".into(), Value::String(artifact_id));
        merged.insert("lang".into(), Value::String(ctx.lang.clone()));
        for (k, v) in std::mem::take(&mut req.args) {
            merged.insert(k, v);
        }
        for (k, v) in input_data {
            merged.insert(k, v);
        }
        req.args = merged;

        next.run(req).await
    }
}

/// Inline every regular file in the session media dir.
fn inline_media_dir(media_dir: &std::path::Path) -> Result<Value> {
    let mut inputs = Vec::new();
    if media_dir.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(media_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();
        for path in entries {
            match BlobCodec::compress_and_encode(&path) {
                Ok(blob) => inputs.push(serde_json::json!({
                    "path": path.to_string_lossy(),
                    "base64": blob.base64,
                    "md5": blob.md5,
                })),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable media");
                }
            }
        }
    }
    Ok(Value::Array(inputs))
}

fn load_collected(
    runtime: &Arc<ToolRuntime>,
    collect: &CollectResult,
    input_data: &mut Map<String, Value>,
) -> Result<()> {
    for (kind, meta) in &collect.collected {
        let (_, envelope) = runtime.store.load_result(&meta.artifact_id)?;
        let mut payload = envelope.payload;
        inline_path_blobs(&mut payload);
        input_data.insert(kind.clone(), payload);
    }
    Ok(())
}

/// Execute a producer node (in `default` mode) for every missing kind.
/// Candidates are tried in registry order; the first success wins.
#[async_recursion]
async fn resolve_missing(
    runtime: &Arc<ToolRuntime>,
    missing: &[String],
    for_node: &str,
    depth: u32,
) -> Result<()> {
    if depth > MAX_RESOLVE_DEPTH {
        return Err(Error::tool(
            for_node,
            format!(
                "dependency recursion too deep (depth={depth}) while resolving {missing:?}; \
                 check for circular dependencies"
            ),
        ));
    }

    for kind in missing {
        let candidates = runtime.registry.candidates_for_kind(kind).to_vec();
        if candidates.is_empty() {
            return Err(Error::tool(
                for_node,
                format!("no producer registered for kind `{kind}`"),
            ));
        }

        let mut satisfied = false;
        for candidate in &candidates {
            let req = ToolRequest {
                node_id: candidate.clone(),
                tool_call_id: internal_tool_call_id(),
                mode: NodeMode::Default,
                args: Map::new(),
                depth: depth + 1,
            };
            match invoke_node(runtime, req).await {
                Ok(outcome) if !outcome.is_error => {
                    tracing::info!(candidate, kind, "dependency produced");
                    satisfied = true;
                    break;
                }
                Ok(outcome) => {
                    tracing::warn!(candidate, kind, summary = %outcome.summary, "candidate returned error");
                }
                Err(e) => {
                    tracing::warn!(candidate, kind, error = %e, "candidate failed");
                }
            }
        }
        if !satisfied {
            return Err(Error::tool(
                for_node,
                format!("cannot satisfy dependency `{kind}`; all candidates failed: {candidates:?}"),
            ));
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ResultPersister
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persists every successful result. The media-ingest and media-search
/// nodes extract their blobs into the session media dir; everything
/// else goes to the node's artifact directory.
pub struct ResultPersister;

#[async_trait]
impl ToolInterceptor for ResultPersister {
    async fn handle(&self, req: ToolRequest, next: Next<'_>) -> Result<ToolOutcome> {
        let runtime = next.runtime().clone();
        let node_id = req.node_id.clone();

        let outcome = next.run(req).await?;

        if !outcome.is_error {
            let ctx = runtime.context();
            let blob_dir = if node_id == "load_media" || node_id == "search_media" {
                Some(ctx.media_dir.clone())
            } else {
                None
            };
            runtime.store.save_result(
                &node_id,
                &outcome.artifact_id,
                Some(&outcome.summary),
                outcome.payload.clone(),
                blob_dir.as_deref(),
            )?;
        }
        Ok(outcome)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context injectors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Injects the session's TTS selection into voiceover tools. Explicit
/// request args win over injected values.
pub struct TtsConfigInjector;

#[async_trait]
impl ToolInterceptor for TtsConfigInjector {
    async fn handle(&self, mut req: ToolRequest, next: Next<'_>) -> Result<ToolOutcome> {
        if req.node_id.contains("voiceover") {
            let ctx = next.runtime().context();
            if let Some(Value::Object(tts)) = &ctx.tts {
                let provider = tts
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or("indextts")
                    .trim()
                    .to_lowercase();
                req.args
                    .entry("provider".to_string())
                    .or_insert(Value::String(provider.clone()));

                if let Some(voice) = tts
                    .get("voice_index")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                {
                    req.args
                        .entry("voice_index".to_string())
                        .or_insert(Value::String(voice.to_string()));
                }

                if let Some(Value::Object(provider_cfg)) = tts.get(&provider) {
                    for (key, value) in provider_cfg {
                        if value.is_null() {
                            continue;
                        }
                        req.args.entry(key.clone()).or_insert(value.clone());
                    }
                }
            }
        }
        next.run(req).await
    }
}

/// Injects the resolved asset-search API key into media search tools.
pub struct AssetKeyInjector;

#[async_trait]
impl ToolInterceptor for AssetKeyInjector {
    async fn handle(&self, mut req: ToolRequest, next: Next<'_>) -> Result<ToolOutcome> {
        if req.node_id.contains("search_media") {
            let ctx = next.runtime().context();
            if let Some(key) = ctx.asset_api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
            {
                req.args
                    .insert("asset_api_key".to_string(), Value::String(key.to_string()));
            }
        }
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeRegistry, NodeSpec};
    use crate::runtime::RuntimeContext;
    use crate::tool::PipelineTool;
    use cf_artifacts::ArtifactStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::tempdir;

    /// Records the args it was called with and returns a fixed payload.
    struct RecordingTool {
        node_id: String,
        calls: Arc<Mutex<Vec<Map<String, Value>>>>,
        fail: bool,
    }

    #[async_trait]
    impl PipelineTool for RecordingTool {
        async fn call(&self, args: Map<String, Value>, _ctx: &RuntimeContext) -> Result<ToolOutcome> {
            self.calls.lock().push(args.clone());
            let artifact_id = args
                .get("artifact_id")
                .and_then(Value::as_str)
                .unwrap_or("missing")
                .to_string();
            if self.fail {
                Ok(ToolOutcome::error(artifact_id, format!("{} failed", self.node_id)))
            } else {
                Ok(ToolOutcome::ok(
                    artifact_id,
                    json!({"from": self.node_id}),
                    format!("{} done", self.node_id),
                ))
            }
        }
    }

    struct Fixture {
        runtime: Arc<ToolRuntime>,
        calls: Arc<Mutex<Vec<Map<String, Value>>>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(specs: Vec<NodeSpec>, tools: &[(&str, bool)]) -> Fixture {
        let dir = tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut registry = NodeRegistry::new(specs);
        for (node_id, fail) in tools {
            registry.register_tool(
                node_id,
                Arc::new(RecordingTool {
                    node_id: node_id.to_string(),
                    calls: calls.clone(),
                    fail: *fail,
                }),
            );
        }

        let store = Arc::new(ArtifactStore::new(&dir.path().join("artifacts"), "s1").unwrap());
        let media_dir = dir.path().join("media");
        std::fs::create_dir_all(&media_dir).unwrap();

        let ctx = RuntimeContext {
            session_id: "s1".into(),
            media_dir,
            bgm_dir: dir.path().join("bgm"),
            outputs_dir: dir.path().join("outputs"),
            lang: "en".into(),
            chat_model_key: "deepseek-chat".into(),
            vlm_model_key: "qwen3-vl-8b-instruct".into(),
            tts: None,
            asset_api_key: None,
            events: None,
        };
        let runtime = ToolRuntime::new(Arc::new(registry), store, ctx, default_interceptors());
        Fixture {
            runtime,
            calls,
            _dir: dir,
        }
    }

    fn request(node_id: &str, mode: NodeMode) -> ToolRequest {
        ToolRequest::new(node_id, &internal_tool_call_id(), mode, Map::new())
    }

    #[tokio::test]
    async fn args_gain_artifact_id_and_lang() {
        let f = fixture(
            vec![NodeSpec {
                node_id: "select_bgm".into(),
                kind: "bgm".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            }],
            &[("select_bgm", false)],
        );

        let outcome = invoke_node(&f.runtime, request("select_bgm", NodeMode::Auto))
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert!(outcome.artifact_id.starts_with("select_bgm_"));

        let args = f.calls.lock()[0].clone();
        assert_eq!(args["lang"], "en");
        assert_eq!(args["artifact_id"], Value::String(outcome.artifact_id));
    }

    #[tokio::test]
    async fn missing_dependency_is_resolved_recursively() {
        let specs = vec![
            NodeSpec {
                node_id: "load_media".into(),
                kind: "load_media".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            },
            NodeSpec {
                node_id: "split_shots".into(),
                kind: "split_shots".into(),
                require_prior_kinds: vec!["load_media".into()],
                default_require_prior_kinds: vec!["load_media".into()],
                priority: 5,
            },
        ];
        let f = fixture(specs, &[("load_media", false), ("split_shots", false)]);

        let outcome = invoke_node(&f.runtime, request("split_shots", NodeMode::Auto))
            .await
            .unwrap();
        assert!(!outcome.is_error);

        // load_media ran first, then split_shots saw its payload.
        let calls = f.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[0]["artifact_id"].as_str().unwrap().starts_with("load_media_"));
        assert_eq!(calls[1]["load_media"], json!({"from": "load_media"}));

        // Both results were persisted.
        assert!(f.runtime.store.get_latest_meta("load_media").unwrap().is_some());
        assert!(f.runtime.store.get_latest_meta("split_shots").unwrap().is_some());
    }

    #[tokio::test]
    async fn satisfied_dependency_is_not_rerun() {
        let specs = vec![
            NodeSpec {
                node_id: "load_media".into(),
                kind: "load_media".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            },
            NodeSpec {
                node_id: "split_shots".into(),
                kind: "split_shots".into(),
                require_prior_kinds: vec!["load_media".into()],
                default_require_prior_kinds: vec!["load_media".into()],
                priority: 5,
            },
        ];
        let f = fixture(specs, &[("load_media", false), ("split_shots", false)]);

        invoke_node(&f.runtime, request("load_media", NodeMode::Auto))
            .await
            .unwrap();
        f.calls.lock().clear();

        invoke_node(&f.runtime, request("split_shots", NodeMode::Auto))
            .await
            .unwrap();
        let calls = f.calls.lock();
        assert_eq!(calls.len(), 1, "load_media must not run again");
    }

    #[tokio::test]
    async fn failed_candidate_falls_through_to_next() {
        let specs = vec![
            NodeSpec {
                node_id: "fancy_captioner".into(),
                kind: "caption".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 1,
            },
            NodeSpec {
                node_id: "basic_captioner".into(),
                kind: "caption".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 2,
            },
            NodeSpec {
                node_id: "consumer".into(),
                kind: "consumer".into(),
                require_prior_kinds: vec!["caption".into()],
                default_require_prior_kinds: vec![],
                priority: 5,
            },
        ];
        let f = fixture(
            specs,
            &[("fancy_captioner", true), ("basic_captioner", false), ("consumer", false)],
        );

        let outcome = invoke_node(&f.runtime, request("consumer", NodeMode::Auto))
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert!(f
            .runtime
            .store
            .get_latest_meta("basic_captioner")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn circular_dependencies_hit_depth_cap() {
        let specs = vec![
            NodeSpec {
                node_id: "a".into(),
                kind: "ka".into(),
                require_prior_kinds: vec!["kb".into()],
                default_require_prior_kinds: vec!["kb".into()],
                priority: 5,
            },
            NodeSpec {
                node_id: "b".into(),
                kind: "kb".into(),
                require_prior_kinds: vec!["ka".into()],
                default_require_prior_kinds: vec!["ka".into()],
                priority: 5,
            },
        ];
        let f = fixture(specs, &[("a", false), ("b", false)]);

        let err = invoke_node(&f.runtime, request("a", NodeMode::Auto))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot satisfy dependency"));
    }

    #[tokio::test]
    async fn load_media_inlines_session_files() {
        let f = fixture(
            vec![NodeSpec {
                node_id: "load_media".into(),
                kind: "load_media".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            }],
            &[("load_media", false)],
        );
        let media_dir = f.runtime.context().media_dir.clone();
        std::fs::write(media_dir.join("media_0001.bin"), b"AAAA").unwrap();

        invoke_node(&f.runtime, request("load_media", NodeMode::Auto))
            .await
            .unwrap();

        let args = f.calls.lock()[0].clone();
        let inputs = args["inputs"].as_array().unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0]["base64"].is_string());
        assert!(inputs[0]["md5"].is_string());
    }

    #[tokio::test]
    async fn unregistered_node_gets_artifacts_dir() {
        let mut registry = NodeRegistry::new(vec![]);
        let calls = Arc::new(Mutex::new(Vec::new()));
        registry.register_tool(
            "read_node_history",
            Arc::new(RecordingTool {
                node_id: "read_node_history".into(),
                calls: calls.clone(),
                fail: false,
            }),
        );
        let dir = tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(&dir.path().join("artifacts"), "s1").unwrap());
        let ctx = RuntimeContext {
            session_id: "s1".into(),
            media_dir: dir.path().join("media"),
            bgm_dir: dir.path().join("bgm"),
            outputs_dir: dir.path().join("outputs"),
            lang: "zh".into(),
            chat_model_key: "m".into(),
            vlm_model_key: "v".into(),
            tts: None,
            asset_api_key: None,
            events: None,
        };
        let runtime = ToolRuntime::new(Arc::new(registry), store, ctx, default_interceptors());

        invoke_node(&runtime, request("read_node_history", NodeMode::Auto))
            .await
            .unwrap();
        let args = calls.lock()[0].clone();
        assert!(args["artifacts_dir"].as_str().unwrap().contains("s1"));
    }

    #[tokio::test]
    async fn tts_config_injected_into_voiceover_args() {
        let f = fixture(
            vec![NodeSpec {
                node_id: "generate_voiceover".into(),
                kind: "tts".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            }],
            &[("generate_voiceover", false)],
        );
        f.runtime.update_context(|ctx| {
            ctx.tts = Some(json!({
                "provider": "indextts",
                "voice_index": "en_female_morning",
                "indextts": {"base_url": "http://tts.local:8049"},
            }));
        });

        invoke_node(&f.runtime, request("generate_voiceover", NodeMode::Auto))
            .await
            .unwrap();
        let args = f.calls.lock()[0].clone();
        assert_eq!(args["provider"], "indextts");
        assert_eq!(args["voice_index"], "en_female_morning");
        assert_eq!(args["base_url"], "http://tts.local:8049");
    }

    #[tokio::test]
    async fn explicit_args_win_over_tts_injection() {
        let f = fixture(
            vec![NodeSpec {
                node_id: "generate_voiceover".into(),
                kind: "tts".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            }],
            &[("generate_voiceover", false)],
        );
        f.runtime.update_context(|ctx| {
            ctx.tts = Some(json!({"provider": "indextts", "voice_index": "voice_01"}));
        });

        let mut req = request("generate_voiceover", NodeMode::Auto);
        req.args
            .insert("voice_index".into(), Value::String("voice_09".into()));
        invoke_node(&f.runtime, req).await.unwrap();

        let args = f.calls.lock()[0].clone();
        assert_eq!(args["voice_index"], "voice_09");
    }

    #[tokio::test]
    async fn asset_key_injected_into_search_tools() {
        let f = fixture(
            vec![NodeSpec {
                node_id: "search_media".into(),
                kind: "search_media".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            }],
            &[("search_media", false)],
        );
        f.runtime.update_context(|ctx| {
            ctx.asset_api_key = Some("key-123".into());
        });

        invoke_node(&f.runtime, request("search_media", NodeMode::Auto))
            .await
            .unwrap();
        assert_eq!(f.calls.lock()[0]["asset_api_key"], "key-123");
    }

    #[tokio::test]
    async fn error_outcomes_are_not_persisted() {
        let f = fixture(
            vec![NodeSpec {
                node_id: "select_bgm".into(),
                kind: "bgm".into(),
                require_prior_kinds: vec![],
                default_require_prior_kinds: vec![],
                priority: 5,
            }],
            &[("select_bgm", true)],
        );

        let outcome = invoke_node(&f.runtime, request("select_bgm", NodeMode::Auto))
            .await
            .unwrap();
        assert!(outcome.is_error);
        assert!(f.runtime.store.get_latest_meta("select_bgm").unwrap().is_none());
    }
}
