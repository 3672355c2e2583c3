//! Built-in auxiliary tools. Pipeline node backends (shot detection,
//! captioning, TTS, rendering) are wired per deployment; what lives
//! here only touches the artifact store.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use cf_artifacts::ArtifactStore;
use cf_domain::Result;

use crate::runtime::RuntimeContext;
use crate::tool::{PipelineTool, ToolOutcome};

/// `read_node_history` — fetch any prior step result by artifact id.
/// The agent uses it to revisit earlier pipeline output without
/// re-running the node.
pub struct ReadNodeHistoryTool;

#[async_trait]
impl PipelineTool for ReadNodeHistoryTool {
    async fn call(&self, args: Map<String, Value>, ctx: &RuntimeContext) -> Result<ToolOutcome> {
        let artifact_id = args
            .get("artifact_id")
            .and_then(Value::as_str)
            .unwrap_or("read_node_history_unknown")
            .to_string();

        let Some(query) = args
            .get("query_artifact_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
        else {
            return Ok(ToolOutcome::error(
                artifact_id,
                "query_artifact_id is required",
            ));
        };

        let store = ArtifactStore::new(&ctx.outputs_dir, &ctx.session_id)?;
        match store.load_result(query) {
            Ok((meta, envelope)) => Ok(ToolOutcome::ok(
                artifact_id,
                json!({
                    "history": {
                        "meta": meta,
                        "node_data": envelope,
                    }
                }),
                "history information retrieved",
            )),
            Err(e) => Ok(ToolOutcome::error(
                artifact_id,
                format!("history read failed for `{query}`: {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(outputs: &std::path::Path) -> RuntimeContext {
        RuntimeContext {
            session_id: "s1".into(),
            media_dir: outputs.join("media"),
            bgm_dir: outputs.join("bgm"),
            outputs_dir: outputs.to_path_buf(),
            lang: "en".into(),
            chat_model_key: "m".into(),
            vlm_model_key: "v".into(),
            tts: None,
            asset_api_key: None,
            events: None,
        }
    }

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn reads_back_a_saved_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "s1").unwrap();
        let saved_id = store.generate_artifact_id("split_shots");
        store
            .save_result("split_shots", &saved_id, Some("4 shots"), json!({"shots": [1, 2]}), None)
            .unwrap();

        let outcome = ReadNodeHistoryTool
            .call(
                args(&[
                    ("artifact_id", "read_node_history_aa"),
                    ("query_artifact_id", saved_id.as_str()),
                ]),
                &ctx(dir.path()),
            )
            .await
            .unwrap();

        assert!(!outcome.is_error);
        assert_eq!(
            outcome.payload["history"]["node_data"]["payload"]["shots"],
            json!([1, 2])
        );
        assert_eq!(outcome.payload["history"]["meta"]["artifact_id"], saved_id);
    }

    #[tokio::test]
    async fn unknown_artifact_is_a_tool_error_not_a_failure() {
        let dir = tempdir().unwrap();
        let outcome = ReadNodeHistoryTool
            .call(
                args(&[
                    ("artifact_id", "read_node_history_bb"),
                    ("query_artifact_id", "nope_00000000"),
                ]),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(outcome.is_error);
        assert!(outcome.summary.contains("nope_00000000"));
    }

    #[tokio::test]
    async fn missing_query_is_rejected() {
        let dir = tempdir().unwrap();
        let outcome = ReadNodeHistoryTool
            .call(args(&[("artifact_id", "x")]), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(outcome.is_error);
    }
}
