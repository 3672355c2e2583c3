//! Node registry: flat metadata describing the pipeline DAG plus the
//! tool implementations behind each node.
//!
//! A node *produces* one kind; other nodes depend on kinds, not node
//! ids, so alternative producers can satisfy the same dependency in
//! priority order.

use std::collections::HashMap;
use std::sync::Arc;

use cf_artifacts::{ArtifactMeta, ArtifactStore};

use crate::tool::PipelineTool;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeSpec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub node_id: String,
    /// The kind of output this node produces.
    pub kind: String,
    /// Kinds that must exist before an `auto` run.
    pub require_prior_kinds: Vec<String>,
    /// Kinds required when the node runs in `default`/`skip` mode
    /// (usually a smaller set).
    pub default_require_prior_kinds: Vec<String>,
    /// Candidate ordering among producers of the same kind (lower
    /// wins).
    pub priority: i32,
}

impl NodeSpec {
    fn new(
        node_id: &str,
        kind: &str,
        require: &[&str],
        default_require: &[&str],
        priority: i32,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            kind: kind.to_string(),
            require_prior_kinds: require.iter().map(|s| s.to_string()).collect(),
            default_require_prior_kinds: default_require.iter().map(|s| s.to_string()).collect(),
            priority,
        }
    }
}

/// The built-in pipeline topology.
pub fn default_node_specs() -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("search_media", "search_media", &[], &[], 5),
        NodeSpec::new("load_media", "load_media", &[], &[], 5),
        NodeSpec::new("split_shots", "split_shots", &["load_media"], &["load_media"], 5),
        NodeSpec::new(
            "understand_clips",
            "understand_clips",
            &["load_media", "split_shots"],
            &["load_media", "split_shots"],
            5,
        ),
        NodeSpec::new(
            "filter_clips",
            "filter_clips",
            &["split_shots", "understand_clips"],
            &["split_shots", "understand_clips"],
            5,
        ),
        NodeSpec::new("group_clips", "group_clips", &["filter_clips"], &["split_shots"], 5),
        NodeSpec::new("script_template_rec", "script_template_rec", &["group_clips"], &[], 5),
        NodeSpec::new("generate_script", "generate_script", &["group_clips"], &["group_clips"], 5),
        NodeSpec::new(
            "recommend_effects",
            "effects_rec",
            &["group_clips", "generate_script"],
            &[],
            5,
        ),
        NodeSpec::new(
            "generate_voiceover",
            "tts",
            &["group_clips", "generate_script"],
            &["group_clips", "generate_script"],
            5,
        ),
        NodeSpec::new("select_bgm", "bgm", &[], &[], 5),
        NodeSpec::new("plan_timeline", "plan_timeline", &["group_clips"], &["group_clips"], 5),
        NodeSpec::new("render_video", "render_video", &["plan_timeline"], &["plan_timeline"], 5),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a dependency availability check.
#[derive(Debug, Default)]
pub struct CollectResult {
    pub executable: bool,
    /// kind → newest artifact satisfying it.
    pub collected: HashMap<String, ArtifactMeta>,
    pub missing: Vec<String>,
}

pub struct NodeRegistry {
    specs: HashMap<String, NodeSpec>,
    tools: HashMap<String, Arc<dyn PipelineTool>>,
    /// kind → producing node ids, best candidate first.
    kind_to_nodes: HashMap<String, Vec<String>>,
}

impl NodeRegistry {
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        let mut kind_to_nodes: HashMap<String, Vec<(i32, String)>> = HashMap::new();
        for spec in &specs {
            kind_to_nodes
                .entry(spec.kind.clone())
                .or_default()
                .push((spec.priority, spec.node_id.clone()));
        }
        let kind_to_nodes = kind_to_nodes
            .into_iter()
            .map(|(kind, mut nodes)| {
                nodes.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                (kind, nodes.into_iter().map(|(_, id)| id).collect())
            })
            .collect();

        Self {
            specs: specs.into_iter().map(|s| (s.node_id.clone(), s)).collect(),
            tools: HashMap::new(),
            kind_to_nodes,
        }
    }

    pub fn with_default_specs() -> Self {
        Self::new(default_node_specs())
    }

    /// Attach the implementation behind a node id. Tools for unknown
    /// node ids are allowed (auxiliary tools like `read_node_history`).
    pub fn register_tool(&mut self, node_id: &str, tool: Arc<dyn PipelineTool>) {
        self.tools.insert(node_id.to_string(), tool);
    }

    pub fn spec(&self, node_id: &str) -> Option<&NodeSpec> {
        self.specs.get(node_id)
    }

    pub fn get_tool(&self, node_id: &str) -> Option<Arc<dyn PipelineTool>> {
        self.tools.get(node_id).cloned()
    }

    pub fn candidates_for_kind(&self, kind: &str) -> &[String] {
        self.kind_to_nodes
            .get(kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// For each required kind, find the newest artifact of any
    /// producing node in this session's store.
    pub fn check_executable(&self, store: &ArtifactStore, required_kinds: &[String]) -> CollectResult {
        let mut result = CollectResult {
            executable: true,
            ..Default::default()
        };
        for kind in required_kinds {
            let mut found = None;
            for node_id in self.candidates_for_kind(kind) {
                if let Ok(Some(meta)) = store.get_latest_meta(node_id) {
                    found = Some(meta);
                    break;
                }
            }
            match found {
                Some(meta) => {
                    result.collected.insert(kind.clone(), meta);
                }
                None => {
                    result.executable = false;
                    result.missing.push(kind.clone());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn default_specs_cover_pipeline_order() {
        let registry = NodeRegistry::with_default_specs();
        for node_id in cf_domain::template::DEFAULT_PIPELINE_ORDER {
            assert!(registry.spec(node_id).is_some(), "missing spec for {node_id}");
        }
    }

    #[test]
    fn kinds_resolve_to_producers() {
        let registry = NodeRegistry::with_default_specs();
        assert_eq!(registry.candidates_for_kind("tts"), ["generate_voiceover"]);
        assert_eq!(registry.candidates_for_kind("load_media"), ["load_media"]);
        assert!(registry.candidates_for_kind("no_such_kind").is_empty());
    }

    #[test]
    fn priority_orders_candidates() {
        let registry = NodeRegistry::new(vec![
            NodeSpec::new("fancy", "caption", &[], &[], 9),
            NodeSpec::new("basic", "caption", &[], &[], 1),
        ]);
        assert_eq!(registry.candidates_for_kind("caption"), ["basic", "fancy"]);
    }

    #[test]
    fn check_executable_reports_missing_and_collected() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "s1").unwrap();
        let registry = NodeRegistry::with_default_specs();

        let required = vec!["load_media".to_string(), "split_shots".to_string()];
        let r = registry.check_executable(&store, &required);
        assert!(!r.executable);
        assert_eq!(r.missing, ["load_media", "split_shots"]);

        let aid = store.generate_artifact_id("load_media");
        store
            .save_result("load_media", &aid, None, json!({"inputs": []}), None)
            .unwrap();

        let r = registry.check_executable(&store, &required);
        assert!(!r.executable);
        assert_eq!(r.missing, ["split_shots"]);
        assert!(r.collected.contains_key("load_media"));

        let aid = store.generate_artifact_id("split_shots");
        store
            .save_result("split_shots", &aid, None, json!({"shots": []}), None)
            .unwrap();
        let r = registry.check_executable(&store, &required);
        assert!(r.executable);
        assert!(r.missing.is_empty());
    }
}
