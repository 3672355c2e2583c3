//! Edit templates: declarative plans over the pipeline nodes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::{short_hex_id, unix_now};

/// Fixed topological order of the editing pipeline.
pub const DEFAULT_PIPELINE_ORDER: &[&str] = &[
    "search_media",
    "load_media",
    "split_shots",
    "understand_clips",
    "filter_clips",
    "group_clips",
    "script_template_rec",
    "generate_script",
    "recommend_effects",
    "generate_voiceover",
    "select_bgm",
    "plan_timeline",
    "render_video",
];

/// Nodes that always run (unless a template overrides them) and whose
/// failure aborts a pipeline run.
pub const MANDATORY_NODES: &[&str] = &["load_media", "plan_timeline", "render_video"];

pub fn is_mandatory_node(node_id: &str) -> bool {
    MANDATORY_NODES.contains(&node_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeConfig / EditTemplate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    #[default]
    Auto,
    Skip,
    /// Run with baked-in parameters only.
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub mode: NodeMode,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub confirm_required: bool,
}

impl NodeConfig {
    pub fn new(node_id: &str, mode: NodeMode) -> Self {
        Self {
            node_id: node_id.to_string(),
            mode,
            params: Map::new(),
            confirm_required: false,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirm_required = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoMode {
    #[default]
    FullAuto,
    SemiAuto,
}

pub const SEMI_AUTO_TIMEOUT_MIN: u64 = 3;
pub const SEMI_AUTO_TIMEOUT_MAX: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditTemplate {
    #[serde(default = "new_template_id")]
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub auto_mode: AutoMode,
    #[serde(default = "d_semi_auto_timeout")]
    pub semi_auto_timeout_sec: u64,
    #[serde(default)]
    pub is_preset: bool,
    #[serde(default = "unix_now")]
    pub created_at: f64,
    #[serde(default = "unix_now")]
    pub updated_at: f64,
}

fn new_template_id() -> String {
    short_hex_id(12)
}

fn d_semi_auto_timeout() -> u64 {
    10
}

impl EditTemplate {
    /// Reject templates that name unknown nodes or carry an
    /// out-of-range confirm timeout.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid("template name must not be empty"));
        }
        if !(SEMI_AUTO_TIMEOUT_MIN..=SEMI_AUTO_TIMEOUT_MAX).contains(&self.semi_auto_timeout_sec) {
            return Err(Error::invalid(format!(
                "semi_auto_timeout_sec must be within [{SEMI_AUTO_TIMEOUT_MIN}, {SEMI_AUTO_TIMEOUT_MAX}]"
            )));
        }
        for node in &self.nodes {
            if !DEFAULT_PIPELINE_ORDER.contains(&node.node_id.as_str()) {
                return Err(Error::invalid(format!("unknown node id: {}", node.node_id)));
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in presets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn preset(template_id: &str, name: &str, description: &str) -> EditTemplate {
    EditTemplate {
        template_id: template_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        nodes: Vec::new(),
        auto_mode: AutoMode::FullAuto,
        semi_auto_timeout_sec: 10,
        is_preset: true,
        created_at: 0.0,
        updated_at: 0.0,
    }
}

fn preset_travel_vlog() -> EditTemplate {
    let mut t = preset(
        "preset_travel_vlog",
        "Travel vlog",
        "Scenic travel footage with an upbeat voiceover and chill BGM",
    );
    t.nodes = vec![
        NodeConfig::new("search_media", NodeMode::Skip),
        NodeConfig::new("load_media", NodeMode::Auto),
        NodeConfig::new("split_shots", NodeMode::Auto),
        NodeConfig::new("understand_clips", NodeMode::Auto),
        NodeConfig::new("filter_clips", NodeMode::Auto).with_params(json!({
            "user_request": "keep scenic shots with a strong travel atmosphere"
        })),
        NodeConfig::new("group_clips", NodeMode::Auto).with_params(json!({
            "user_request": "order along the trip timeline, wide shots before details"
        })),
        NodeConfig::new("generate_script", NodeMode::Auto).with_params(json!({
            "user_request": "light, upbeat travel-vlog narration"
        })),
        NodeConfig::new("generate_voiceover", NodeMode::Auto),
        NodeConfig::new("select_bgm", NodeMode::Auto).with_params(json!({
            "filter_include": {"mood": ["Chill", "Happy"], "scene": ["Travel", "Vlog"]}
        })),
        NodeConfig::new("plan_timeline", NodeMode::Auto),
        NodeConfig::new("render_video", NodeMode::Auto),
    ];
    t
}

fn preset_food_short() -> EditTemplate {
    let mut t = preset(
        "preset_food_short",
        "Food short",
        "Food and cooking footage with emphasis on texture close-ups",
    );
    t.nodes = vec![
        NodeConfig::new("search_media", NodeMode::Skip),
        NodeConfig::new("load_media", NodeMode::Auto),
        NodeConfig::new("split_shots", NodeMode::Auto),
        NodeConfig::new("understand_clips", NodeMode::Auto),
        NodeConfig::new("filter_clips", NodeMode::Auto).with_params(json!({
            "user_request": "keep close-ups of dishes and the cooking process"
        })),
        NodeConfig::new("group_clips", NodeMode::Auto).with_params(json!({
            "user_request": "follow the cooking flow from ingredients to plating"
        })),
        NodeConfig::new("generate_script", NodeMode::Auto).with_params(json!({
            "user_request": "concise food narration highlighting ingredients and taste"
        })),
        NodeConfig::new("generate_voiceover", NodeMode::Auto),
        NodeConfig::new("select_bgm", NodeMode::Auto).with_params(json!({
            "filter_include": {"mood": ["Chill", "Happy"], "scene": ["Food", "Cafe"]}
        })),
        NodeConfig::new("plan_timeline", NodeMode::Auto),
        NodeConfig::new("render_video", NodeMode::Auto),
    ];
    t
}

fn preset_quick_cut() -> EditTemplate {
    let mut t = preset(
        "preset_quick_cut",
        "Quick cut",
        "Minimal flow: skip filtering and voiceover for a fast result",
    );
    t.nodes = vec![
        NodeConfig::new("search_media", NodeMode::Skip),
        NodeConfig::new("load_media", NodeMode::Auto),
        NodeConfig::new("split_shots", NodeMode::Auto),
        NodeConfig::new("understand_clips", NodeMode::Skip),
        NodeConfig::new("filter_clips", NodeMode::Skip),
        NodeConfig::new("group_clips", NodeMode::Auto),
        NodeConfig::new("generate_script", NodeMode::Skip),
        NodeConfig::new("generate_voiceover", NodeMode::Skip),
        NodeConfig::new("select_bgm", NodeMode::Auto),
        NodeConfig::new("plan_timeline", NodeMode::Auto),
        NodeConfig::new("render_video", NodeMode::Auto),
    ];
    t
}

fn preset_semi_auto() -> EditTemplate {
    let mut t = preset(
        "preset_semi_auto",
        "Semi-auto edit",
        "Key steps pause for confirmation and fall back to defaults on timeout",
    );
    t.auto_mode = AutoMode::SemiAuto;
    t.semi_auto_timeout_sec = 10;
    t.nodes = vec![
        NodeConfig::new("search_media", NodeMode::Skip),
        NodeConfig::new("load_media", NodeMode::Auto),
        NodeConfig::new("split_shots", NodeMode::Auto),
        NodeConfig::new("understand_clips", NodeMode::Auto),
        NodeConfig::new("filter_clips", NodeMode::Auto).confirmed(),
        NodeConfig::new("group_clips", NodeMode::Auto),
        NodeConfig::new("generate_script", NodeMode::Auto).confirmed(),
        NodeConfig::new("generate_voiceover", NodeMode::Auto).confirmed(),
        NodeConfig::new("select_bgm", NodeMode::Auto),
        NodeConfig::new("plan_timeline", NodeMode::Auto),
        NodeConfig::new("render_video", NodeMode::Auto),
    ];
    t
}

/// The built-in templates seeded into every template store.
pub fn preset_templates() -> Vec<EditTemplate> {
    vec![
        preset_travel_vlog(),
        preset_food_short(),
        preset_quick_cut(),
        preset_semi_auto(),
    ]
}
