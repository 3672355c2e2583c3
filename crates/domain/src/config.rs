//! Gateway configuration, loaded from a TOML file with serde defaults
//! for every section. Rate-limit and capacity knobs additionally honor
//! environment-variable overrides (applied once at load).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub developer: DeveloperConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides to the
    /// limits section. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        config.limits.apply_env_overrides();
        Ok(config)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project directories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Root for uploaded assets. With `session_subdirs` enabled, session
    /// media lands at `<parent>/<session_id>/<leaf>` where parent/leaf
    /// split this path.
    #[serde(default = "d_media_dir")]
    pub media_dir: PathBuf,
    /// Root for pipeline artifacts (per-session subdirectory).
    #[serde(default = "d_outputs_dir")]
    pub outputs_dir: PathBuf,
    /// Background-music library served through the preview endpoint.
    #[serde(default = "d_bgm_dir")]
    pub bgm_dir: PathBuf,
    /// User edit templates, one JSON file per template.
    #[serde(default = "d_templates_dir")]
    pub templates_dir: PathBuf,
    /// Server-side cache; preview responses from here are immutable.
    #[serde(default = "d_server_cache_dir")]
    pub server_cache_dir: PathBuf,
    #[serde(default = "d_true")]
    pub session_subdirs: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            media_dir: d_media_dir(),
            outputs_dir: d_outputs_dir(),
            bgm_dir: d_bgm_dir(),
            templates_dir: d_templates_dir(),
            server_cache_dir: d_server_cache_dir(),
            session_subdirs: true,
        }
    }
}

impl ProjectConfig {
    /// Resolve the media directory for one session:
    /// `<parent-of-media_dir>/<session_id>/<leaf-of-media_dir>`.
    pub fn session_media_dir(&self, session_id: &str) -> PathBuf {
        let root = abs_path(&self.media_dir);
        if !self.session_subdirs {
            return root;
        }
        let leaf = root
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "media".into());
        let parent = root.parent().map(Path::to_path_buf).unwrap_or(root.clone());
        parent.join(session_id).join(leaf)
    }
}

/// Absolutize a path against the current working directory.
pub fn abs_path(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limits & capacity caps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every knob keeps the shipped default unless a `RATE_LIMIT_*` /
/// `MAX_*` / `UPLOAD_*` environment variable overrides it. On a shared
/// egress all clients can present the same IP, hence the per-rule
/// "all" buckets that cap the fleet as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    // Per-IP buckets.
    pub http_global_rpm: u64,
    pub http_global_burst: u64,
    pub create_session_rpm: u64,
    pub create_session_burst: u64,
    pub upload_media_rpm: u64,
    pub upload_media_burst: u64,
    pub upload_media_count_rpm: u64,
    pub upload_media_count_burst: u64,
    pub media_get_rpm: u64,
    pub media_get_burst: u64,
    pub clear_session_rpm: u64,
    pub clear_session_burst: u64,
    pub api_rpm: u64,
    pub api_burst: u64,
    pub ws_connect_rpm: u64,
    pub ws_connect_burst: u64,
    pub ws_chat_send_rpm: u64,
    pub ws_chat_send_burst: u64,

    // Cross-IP ("all") buckets.
    pub http_all_rpm: u64,
    pub http_all_burst: u64,
    pub create_session_all_rpm: u64,
    pub create_session_all_burst: u64,
    pub upload_media_all_rpm: u64,
    pub upload_media_all_burst: u64,
    pub upload_media_count_all_rpm: u64,
    pub upload_media_count_all_burst: u64,
    pub media_get_all_rpm: u64,
    pub media_get_all_burst: u64,
    pub ws_connect_all_rpm: u64,
    pub ws_connect_all_burst: u64,
    pub ws_chat_send_all_rpm: u64,
    pub ws_chat_send_all_burst: u64,

    /// Upload admission cost: one token per this many request bytes.
    pub upload_cost_bytes: u64,

    // Session capacity caps.
    pub max_upload_files_per_request: usize,
    pub max_media_per_session: usize,
    pub max_pending_media_per_session: usize,

    // Global concurrency ceilings.
    pub ws_max_connections: usize,
    pub chat_max_concurrency: usize,
    pub upload_max_concurrency: usize,

    // Bucket table hygiene.
    pub bucket_ttl_sec: u64,
    pub bucket_cleanup_interval_sec: u64,
    pub max_buckets: usize,
    pub evict_batch: usize,

    // Resumable uploads.
    pub resumable_chunk_bytes: u64,
    pub resumable_ttl_sec: u64,

    /// Trust X-Forwarded-For / X-Real-IP when resolving the client IP.
    pub trust_proxy_headers: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            http_global_rpm: 3000,
            http_global_burst: 600,
            create_session_rpm: 3000,
            create_session_burst: 50,
            upload_media_rpm: 12000,
            upload_media_burst: 300,
            upload_media_count_rpm: 50000,
            upload_media_count_burst: 1000,
            media_get_rpm: 2400,
            media_get_burst: 60,
            clear_session_rpm: 3000,
            clear_session_burst: 50,
            api_rpm: 2400,
            api_burst: 120,
            ws_connect_rpm: 600,
            ws_connect_burst: 50,
            ws_chat_send_rpm: 300,
            ws_chat_send_burst: 20,

            http_all_rpm: 1200,
            http_all_burst: 200,
            create_session_all_rpm: 120,
            create_session_all_burst: 20,
            upload_media_all_rpm: 6000,
            upload_media_all_burst: 2000,
            upload_media_count_all_rpm: 6000,
            upload_media_count_all_burst: 2000,
            media_get_all_rpm: 600,
            media_get_all_burst: 120,
            ws_connect_all_rpm: 60000,
            ws_connect_all_burst: 2000,
            ws_chat_send_all_rpm: 500,
            ws_chat_send_all_burst: 30,

            upload_cost_bytes: 10 * 1024 * 1024,

            max_upload_files_per_request: 30,
            max_media_per_session: 30,
            max_pending_media_per_session: 30,

            ws_max_connections: 500,
            chat_max_concurrency: 80,
            upload_max_concurrency: 100,

            bucket_ttl_sec: 900,
            bucket_cleanup_interval_sec: 60,
            max_buckets: 100_000,
            evict_batch: 2000,

            resumable_chunk_bytes: 8 * 1024 * 1024,
            resumable_ttl_sec: 3600,

            trust_proxy_headers: false,
        }
    }
}

impl LimitsConfig {
    pub fn apply_env_overrides(&mut self) {
        env_u64("RATE_LIMIT_HTTP_GLOBAL_RPM", &mut self.http_global_rpm);
        env_u64("RATE_LIMIT_HTTP_GLOBAL_BURST", &mut self.http_global_burst);
        env_u64("RATE_LIMIT_CREATE_SESSION_RPM", &mut self.create_session_rpm);
        env_u64("RATE_LIMIT_CREATE_SESSION_BURST", &mut self.create_session_burst);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_RPM", &mut self.upload_media_rpm);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_BURST", &mut self.upload_media_burst);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_COUNT_RPM", &mut self.upload_media_count_rpm);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_COUNT_BURST", &mut self.upload_media_count_burst);
        env_u64("RATE_LIMIT_MEDIA_GET_RPM", &mut self.media_get_rpm);
        env_u64("RATE_LIMIT_MEDIA_GET_BURST", &mut self.media_get_burst);
        env_u64("RATE_LIMIT_CLEAR_SESSION_RPM", &mut self.clear_session_rpm);
        env_u64("RATE_LIMIT_CLEAR_SESSION_BURST", &mut self.clear_session_burst);
        env_u64("RATE_LIMIT_API_RPM", &mut self.api_rpm);
        env_u64("RATE_LIMIT_API_BURST", &mut self.api_burst);
        env_u64("RATE_LIMIT_WS_CONNECT_RPM", &mut self.ws_connect_rpm);
        env_u64("RATE_LIMIT_WS_CONNECT_BURST", &mut self.ws_connect_burst);
        env_u64("RATE_LIMIT_WS_CHAT_SEND_RPM", &mut self.ws_chat_send_rpm);
        env_u64("RATE_LIMIT_WS_CHAT_SEND_BURST", &mut self.ws_chat_send_burst);

        env_u64("RATE_LIMIT_HTTP_ALL_RPM", &mut self.http_all_rpm);
        env_u64("RATE_LIMIT_HTTP_ALL_BURST", &mut self.http_all_burst);
        env_u64("RATE_LIMIT_CREATE_SESSION_ALL_RPM", &mut self.create_session_all_rpm);
        env_u64("RATE_LIMIT_CREATE_SESSION_ALL_BURST", &mut self.create_session_all_burst);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_ALL_RPM", &mut self.upload_media_all_rpm);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_ALL_BURST", &mut self.upload_media_all_burst);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_COUNT_ALL_RPM", &mut self.upload_media_count_all_rpm);
        env_u64("RATE_LIMIT_UPLOAD_MEDIA_COUNT_ALL_BURST", &mut self.upload_media_count_all_burst);
        env_u64("RATE_LIMIT_MEDIA_GET_ALL_RPM", &mut self.media_get_all_rpm);
        env_u64("RATE_LIMIT_MEDIA_GET_ALL_BURST", &mut self.media_get_all_burst);
        env_u64("RATE_LIMIT_WS_CONNECT_ALL_RPM", &mut self.ws_connect_all_rpm);
        env_u64("RATE_LIMIT_WS_CONNECT_ALL_BURST", &mut self.ws_connect_all_burst);
        env_u64("RATE_LIMIT_WS_CHAT_SEND_ALL_RPM", &mut self.ws_chat_send_all_rpm);
        env_u64("RATE_LIMIT_WS_CHAT_SEND_ALL_BURST", &mut self.ws_chat_send_all_burst);

        env_u64("RATE_LIMIT_UPLOAD_COST_BYTES", &mut self.upload_cost_bytes);

        env_usize("MAX_UPLOAD_FILES_PER_REQUEST", &mut self.max_upload_files_per_request);
        env_usize("MAX_MEDIA_PER_SESSION", &mut self.max_media_per_session);
        env_usize("MAX_PENDING_MEDIA_PER_SESSION", &mut self.max_pending_media_per_session);

        env_usize("RATE_LIMIT_WS_MAX_CONNECTIONS", &mut self.ws_max_connections);
        env_usize("RATE_LIMIT_CHAT_MAX_CONCURRENCY", &mut self.chat_max_concurrency);
        env_usize("RATE_LIMIT_UPLOAD_MAX_CONCURRENCY", &mut self.upload_max_concurrency);

        env_u64("RATE_LIMIT_TTL_SEC", &mut self.bucket_ttl_sec);
        env_u64("RATE_LIMIT_CLEANUP_INTERVAL_SEC", &mut self.bucket_cleanup_interval_sec);
        env_usize("RATE_LIMIT_MAX_BUCKETS", &mut self.max_buckets);
        env_usize("RATE_LIMIT_EVICT_BATCH", &mut self.evict_batch);

        env_u64("UPLOAD_RESUMABLE_CHUNK_BYTES", &mut self.resumable_chunk_bytes);
        env_u64("RESUMABLE_UPLOAD_TTL_SEC", &mut self.resumable_ttl_sec);

        if let Ok(v) = std::env::var("RATE_LIMIT_TRUST_PROXY_HEADERS") {
            self.trust_proxy_headers = v == "1";
        }
    }
}

fn env_u64(name: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(n) = v.parse() {
            *slot = n;
        }
    }
}

fn env_usize(name: &str, slot: &mut usize) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(n) = v.parse() {
            *slot = n;
        }
    }
}

/// Requests-per-minute to tokens-per-second.
pub fn rpm_to_rps(rpm: u64) -> f64 {
    rpm as f64 / 60.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sentinel model key the UI sends when the user supplies inline
/// credentials instead of picking a configured model.
pub const CUSTOM_MODEL_KEY: &str = "__custom__";

/// Fully-resolved credentials for one model endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOverride {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

impl ModelOverride {
    /// Stable key used to detect whether an agent rebuild is needed.
    pub fn stable_key(&self) -> String {
        format!("{}|{}|{}", self.model, self.base_url, self.api_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelEntry {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "d_default_llm")]
    pub default_llm: String,
    #[serde(default = "d_default_vlm")]
    pub default_vlm: String,
    /// Per-model sub-tables keyed by model name.
    #[serde(default)]
    pub entries: HashMap<String, ModelEntry>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_llm: d_default_llm(),
            default_vlm: d_default_vlm(),
            entries: HashMap::new(),
        }
    }
}

impl ModelsConfig {
    /// Resolve the override for a configured model name.
    ///
    /// Order: the model's config sub-table, then environment variables
    /// keyed by the model-name prefix (`DEEPSEEK_API_KEY` for
    /// `deepseek-chat`, etc.). Missing credentials are an error the
    /// caller surfaces to the user.
    pub fn resolve_override(&self, model_name: &str) -> Result<ModelOverride> {
        let entry = self.entries.get(model_name).cloned().unwrap_or_default();

        let (env_key, env_url) = env_fallback_for_model(model_name);

        let model = entry
            .model
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| model_name.to_string());
        let base_url = entry
            .base_url
            .filter(|s| !s.trim().is_empty())
            .or(env_url)
            .ok_or_else(|| {
                Error::Config(format!("no base_url configured for model `{model_name}`"))
            })?;
        let api_key = entry
            .api_key
            .filter(|s| !s.trim().is_empty())
            .or(env_key)
            .ok_or_else(|| {
                Error::Config(format!("no api_key configured for model `{model_name}`"))
            })?;

        Ok(ModelOverride {
            model,
            base_url,
            api_key,
        })
    }
}

/// `deepseek-chat` → (`$DEEPSEEK_API_KEY`, `$DEEPSEEK_BASE_URL`).
fn env_fallback_for_model(model_name: &str) -> (Option<String>, Option<String>) {
    let prefix: String = model_name
        .split(['-', '/'])
        .next()
        .unwrap_or(model_name)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    let key = std::env::var(format!("{prefix}_API_KEY")).ok().filter(|s| !s.is_empty());
    let url = std::env::var(format!("{prefix}_BASE_URL")).ok().filter(|s| !s.is_empty());
    (key, url)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTS / asset search / developer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "d_tts_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_voice: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: d_tts_provider(),
            base_url: None,
            default_voice: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchConfig {
    /// Default API key for the stock-asset search tool. Sessions may
    /// override it with a user-supplied key.
    #[serde(default)]
    pub asset_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeveloperConfig {
    #[serde(default)]
    pub developer_mode: bool,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8020
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_media_dir() -> PathBuf {
    "./data/media".into()
}
fn d_outputs_dir() -> PathBuf {
    "./data/outputs".into()
}
fn d_bgm_dir() -> PathBuf {
    "./data/bgm".into()
}
fn d_templates_dir() -> PathBuf {
    "./data/templates".into()
}
fn d_server_cache_dir() -> PathBuf {
    "./data/.server_cache".into()
}
fn d_true() -> bool {
    true
}
fn d_default_llm() -> String {
    "deepseek-chat".into()
}
fn d_default_vlm() -> String {
    "qwen3-vl-8b-instruct".into()
}
fn d_tts_provider() -> String {
    "indextts".into()
}
