//! One session's full state: media tables and staging, conversation
//! history, the model-facing context, agent lifecycle, and the
//! in-flight resumable-upload table.
//!
//! Locking: `chat_lock` is exclusive over a whole chat turn;
//! `media` covers the media/upload tables. They are independent so
//! uploads proceed while a turn streams, and neither is ever acquired
//! while holding the other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use cf_artifacts::ArtifactStore;
use cf_domain::config::{Config, ModelOverride, CUSTOM_MODEL_KEY};
use cf_domain::message::ContextMessage;
use cf_domain::{short_hex_id, unix_now, Error, Result};
use cf_media::{
    detect_media_kind, file_extension, make_store_filename, parse_media_seq, sanitize_filename,
    MediaMeta, MediaStore,
};
use cf_pipeline::agent::{Agent, AgentFactory};
use cf_pipeline::interceptors::default_interceptors;
use cf_pipeline::registry::NodeRegistry;
use cf_pipeline::runtime::{RuntimeContext, ToolRuntime};
use cf_pipeline::CancelFlag;

use crate::history::HistoryLog;
use crate::uploads::ResumableUpload;

/// Index of the upload-stats system slot in the model-facing context.
const STATS_SLOT: usize = 1;

fn system_prompt(lang: &str) -> String {
    match lang {
        "zh" => "你是一个视频剪辑助手，通过调用剪辑流水线工具帮助用户完成素材整理、脚本、配音与成片。".to_string(),
        _ => "You are a video-editing assistant. Use the editing pipeline tools to organize \
              footage, write scripts, generate voiceovers, and render the final cut."
            .to_string(),
    }
}

fn base_context(lang: &str) -> Vec<ContextMessage> {
    vec![
        ContextMessage::system(system_prompt(lang)),
        ContextMessage::system("[User media upload status] {}"),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Internal state blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct MediaTables {
    load_media: HashMap<String, MediaMeta>,
    pending_media_ids: Vec<String>,
    resumable: HashMap<String, Arc<ResumableUpload>>,
    /// Capacity pre-reserved by in-progress multipart uploads.
    direct_reservations: usize,
    seq_inited: bool,
    seq_next: u32,
}

struct ChatState {
    lang: String,
    chat_model_key: String,
    vlm_model_key: String,
    chat_models: Vec<String>,
    vlm_models: Vec<String>,
    developer_mode: bool,
    custom_llm: Option<ModelOverride>,
    custom_vlm: Option<ModelOverride>,
    tts: Option<Value>,
    /// `Some` = user-supplied asset-search key overrides the default.
    asset_key_custom: Option<String>,
    sent_media_total: u64,
}

struct AgentSlot {
    agent: Arc<dyn Agent>,
    build_key: (String, String),
}

#[derive(Default)]
struct PipelineState {
    task: Option<JoinHandle<()>>,
    confirm_tx: Option<oneshot::Sender<Map<String, Value>>>,
}

/// Response payload of a resumable init.
#[derive(Debug, Clone)]
pub struct ResumableInit {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub filename: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChatSession {
    pub session_id: String,
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    media_dir: PathBuf,
    pub media_store: Arc<MediaStore>,

    /// Exclusive over one whole chat turn.
    pub chat_lock: Arc<tokio::sync::Mutex<()>>,
    media: tokio::sync::Mutex<MediaTables>,
    state: Mutex<ChatState>,
    pub history: Mutex<HistoryLog>,
    /// Model-facing context (rewritten on cancel).
    pub context: Mutex<Vec<ContextMessage>>,

    pub cancel: CancelFlag,
    pub pipeline_cancel: CancelFlag,
    pipeline: Mutex<PipelineState>,

    agent: Mutex<Option<AgentSlot>>,
    tool_runtime: Mutex<Option<Arc<ToolRuntime>>>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    pub fn new(session_id: String, config: Arc<Config>, registry: Arc<NodeRegistry>) -> Result<Arc<Self>> {
        let media_dir = config.project.session_media_dir(&session_id);
        let media_store = Arc::new(MediaStore::new(&media_dir)?);
        let lang = "zh".to_string();

        let state = ChatState {
            lang: lang.clone(),
            chat_model_key: config.models.default_llm.clone(),
            vlm_model_key: config.models.default_vlm.clone(),
            chat_models: vec![config.models.default_llm.clone(), CUSTOM_MODEL_KEY.into()],
            vlm_models: vec![config.models.default_vlm.clone(), CUSTOM_MODEL_KEY.into()],
            developer_mode: config.developer.developer_mode,
            custom_llm: None,
            custom_vlm: None,
            tts: None,
            asset_key_custom: None,
            sent_media_total: 0,
        };

        Ok(Arc::new(Self {
            session_id,
            config,
            registry,
            media_dir,
            media_store,
            chat_lock: Arc::new(tokio::sync::Mutex::new(())),
            media: tokio::sync::Mutex::new(MediaTables::default()),
            state: Mutex::new(state),
            history: Mutex::new(HistoryLog::new()),
            context: Mutex::new(base_context(&lang)),
            cancel: CancelFlag::new(),
            pipeline_cancel: CancelFlag::new(),
            pipeline: Mutex::new(PipelineState::default()),
            agent: Mutex::new(None),
            tool_runtime: Mutex::new(None),
        }))
    }

    pub fn media_dir(&self) -> &PathBuf {
        &self.media_dir
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    // ── Language & models ────────────────────────────────────────────

    pub fn lang(&self) -> String {
        self.state.lock().lang.clone()
    }

    /// Only `zh`/`en` are recognized; anything else falls back to `zh`.
    pub fn set_lang(&self, lang: &str) -> String {
        let lang = match lang.trim().to_lowercase().as_str() {
            "en" => "en".to_string(),
            _ => "zh".to_string(),
        };
        self.state.lock().lang = lang.clone();
        if let Some(runtime) = self.tool_runtime.lock().clone() {
            let lang2 = lang.clone();
            runtime.update_context(move |ctx| ctx.lang = lang2);
        }
        lang
    }

    pub fn chat_model_key(&self) -> String {
        self.state.lock().chat_model_key.clone()
    }

    pub fn vlm_model_key(&self) -> String {
        self.state.lock().vlm_model_key.clone()
    }

    pub fn set_chat_model(&self, key: &str) {
        let key = key.trim();
        if !key.is_empty() {
            self.state.lock().chat_model_key = key.to_string();
        }
    }

    pub fn set_vlm_model(&self, key: &str) {
        let key = key.trim();
        if !key.is_empty() {
            self.state.lock().vlm_model_key = key.to_string();
        }
    }

    // ── Service config ───────────────────────────────────────────────

    /// Apply a `service_config` payload: custom LLM/VLM credentials,
    /// TTS selection, asset-search key. Partial updates are fine;
    /// present-but-invalid sections reject the whole payload.
    pub fn apply_service_config(&self, service_cfg: Option<&Value>) -> Result<()> {
        let Some(Value::Object(cfg)) = service_cfg else {
            return Ok(());
        };

        let llm = cfg
            .get("llm")
            .map(|v| parse_model_block(v, "LLM"))
            .transpose()?;
        let vlm = cfg
            .get("vlm")
            .map(|v| parse_model_block(v, "VLM"))
            .transpose()?;

        let mut st = self.state.lock();
        if let Some(llm) = llm {
            st.custom_llm = Some(llm);
        }
        if let Some(vlm) = vlm {
            st.custom_vlm = Some(vlm);
        }

        if let Some(Value::Object(tts)) = cfg.get("tts") {
            if !tts.is_empty() {
                st.tts = Some(Value::Object(tts.clone()));
            }
        }

        if let Some(Value::Object(search)) = cfg.get("asset_search") {
            if !search.is_empty() {
                let mode = search
                    .get("mode")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_lowercase();
                if mode == "custom" {
                    let key = search
                        .get("api_key")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    st.asset_key_custom = Some(key);
                } else {
                    st.asset_key_custom = None;
                }
            }
        }
        Ok(())
    }

    // ── Agent lifecycle ──────────────────────────────────────────────

    /// Resolve overrides, rebuild the agent when the `(llm, vlm)` pair
    /// changed, and sync the tool-runtime context. Returns the agent
    /// for this turn.
    pub fn ensure_agent(&self, factory: &dyn AgentFactory) -> Result<Arc<dyn Agent>> {
        let (llm, vlm) = self.resolve_model_overrides()?;
        let build_key = (llm.stable_key(), vlm.stable_key());

        let runtime = self.ensure_tool_runtime()?;
        self.sync_runtime_context(&runtime);

        let mut slot = self.agent.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.build_key == build_key {
                return Ok(existing.agent.clone());
            }
        }

        tracing::info!(session_id = %self.session_id, model = %llm.model, vlm = %vlm.model, "building agent");
        let agent = factory.build(&llm, &vlm, runtime)?;
        *slot = Some(AgentSlot {
            agent: agent.clone(),
            build_key,
        });
        Ok(agent)
    }

    fn resolve_model_overrides(&self) -> Result<(ModelOverride, ModelOverride)> {
        let (chat_key, vlm_key, custom_llm, custom_vlm) = {
            let st = self.state.lock();
            (
                st.chat_model_key.clone(),
                st.vlm_model_key.clone(),
                st.custom_llm.clone(),
                st.custom_vlm.clone(),
            )
        };

        let llm = if chat_key == CUSTOM_MODEL_KEY {
            custom_llm.ok_or_else(|| {
                Error::invalid("please fill in model/base_url/api_key of the custom LLM")
            })?
        } else {
            self.config.models.resolve_override(&chat_key)?
        };
        let vlm = if vlm_key == CUSTOM_MODEL_KEY {
            custom_vlm.ok_or_else(|| {
                Error::invalid("please fill in model/base_url/api_key of the custom VLM")
            })?
        } else {
            self.config.models.resolve_override(&vlm_key)?
        };
        Ok((llm, vlm))
    }

    /// Tool runtime with a freshly-synced context; used by template
    /// pipeline runs, which need the interceptor chain but no agent.
    pub fn prepare_runtime(&self) -> Result<Arc<ToolRuntime>> {
        let runtime = self.ensure_tool_runtime()?;
        self.sync_runtime_context(&runtime);
        Ok(runtime)
    }

    pub fn ensure_tool_runtime(&self) -> Result<Arc<ToolRuntime>> {
        {
            let runtime = self.tool_runtime.lock();
            if let Some(rt) = runtime.as_ref() {
                return Ok(rt.clone());
            }
        }
        let store = Arc::new(ArtifactStore::new(
            &self.config.project.outputs_dir,
            &self.session_id,
        )?);
        let ctx = self.build_runtime_context();
        let runtime = ToolRuntime::new(self.registry.clone(), store, ctx, default_interceptors());
        *self.tool_runtime.lock() = Some(runtime.clone());
        Ok(runtime)
    }

    fn build_runtime_context(&self) -> RuntimeContext {
        let st = self.state.lock();
        RuntimeContext {
            session_id: self.session_id.clone(),
            media_dir: self.media_dir.clone(),
            bgm_dir: self.config.project.bgm_dir.clone(),
            outputs_dir: self.config.project.outputs_dir.clone(),
            lang: st.lang.clone(),
            chat_model_key: st.chat_model_key.clone(),
            vlm_model_key: st.vlm_model_key.clone(),
            tts: st.tts.clone(),
            asset_api_key: resolve_asset_key(&st, &self.config),
            events: None,
        }
    }

    fn sync_runtime_context(&self, runtime: &Arc<ToolRuntime>) {
        let st = self.state.lock();
        let lang = st.lang.clone();
        let chat = st.chat_model_key.clone();
        let vlm = st.vlm_model_key.clone();
        let tts = st.tts.clone();
        let asset_key = resolve_asset_key(&st, &self.config);
        drop(st);
        runtime.update_context(move |ctx| {
            ctx.lang = lang;
            ctx.chat_model_key = chat;
            ctx.vlm_model_key = vlm;
            ctx.tts = tts;
            ctx.asset_api_key = asset_key;
        });
    }

    // ── History / context ────────────────────────────────────────────

    /// Reset history and the model-facing context; media and the store
    /// sequence are untouched.
    pub fn reset_conversation(&self) {
        let lang = self.lang();
        self.state.lock().sent_media_total = 0;
        self.history.lock().clear();
        *self.context.lock() = base_context(&lang);
    }

    /// Record attachments sent this turn and rewrite the upload-stats
    /// system slot.
    pub fn note_attachments_sent(&self, turn_count: usize) {
        let total = {
            let mut st = self.state.lock();
            st.sent_media_total += turn_count as u64;
            st.sent_media_total
        };
        let library = std::fs::read_dir(&self.media_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_file())
                    .count()
            })
            .unwrap_or(0);

        let stats = json!({
            "media_attached_to_this_message": turn_count,
            "media_sent_across_all_turns": total,
            "media_in_session_library": library,
        });
        let slot = ContextMessage::system(format!(
            "[User media upload status] Use these fields to judge the media the user provided:\n{stats}"
        ));

        let mut ctx = self.context.lock();
        while ctx.len() <= STATS_SLOT {
            ctx.push(ContextMessage::system(""));
        }
        ctx[STATS_SLOT] = slot;
    }

    // ── Pipeline task bookkeeping ────────────────────────────────────

    pub fn pipeline_running(&self) -> bool {
        self.pipeline
            .lock()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn set_pipeline_task(&self, task: JoinHandle<()>) {
        self.pipeline.lock().task = Some(task);
    }

    pub fn set_confirm_sender(&self, tx: oneshot::Sender<Map<String, Value>>) {
        self.pipeline.lock().confirm_tx = Some(tx);
    }

    pub fn clear_confirm_sender(&self) {
        self.pipeline.lock().confirm_tx = None;
    }

    /// Deliver a confirm response to a waiting pipeline. `false` when
    /// nothing is waiting.
    pub fn resolve_confirm(&self, params: Map<String, Value>) -> bool {
        match self.pipeline.lock().confirm_tx.take() {
            Some(tx) => tx.send(params).is_ok(),
            None => false,
        }
    }

    // ── Media: direct uploads ────────────────────────────────────────

    /// Capacity check + store-name reservation for a multipart upload.
    /// The reservation counts against session caps until
    /// [`Self::finish_direct_upload`] releases it.
    pub async fn begin_direct_upload(&self, display_names: &[String]) -> Result<Vec<String>> {
        let mut tables = self.media.lock().await;
        self.reap_stale_uploads(&mut tables);
        self.check_media_caps(&tables, display_names.len())?;
        tables.direct_reservations += display_names.len();
        Ok(self.reserve_store_names(&mut tables, display_names))
    }

    pub async fn finish_direct_upload(&self, n: usize) {
        let mut tables = self.media.lock().await;
        tables.direct_reservations = tables.direct_reservations.saturating_sub(n);
    }

    /// Register finalized uploads as pending. Direct uploads sort the
    /// pending list by store name so it matches reservation order.
    pub async fn commit_media(&self, metas: Vec<MediaMeta>, sort_pending: bool) {
        let mut tables = self.media.lock().await;
        for meta in metas {
            tables.pending_media_ids.push(meta.id.clone());
            tables.load_media.insert(meta.id.clone(), meta);
        }
        if sort_pending {
            let mut keyed: Vec<(String, String)> = tables
                .pending_media_ids
                .iter()
                .map(|id| {
                    let key = tables
                        .load_media
                        .get(id)
                        .and_then(|m| m.path.file_name().map(|n| n.to_string_lossy().into_owned()))
                        .unwrap_or_default();
                    (key, id.clone())
                })
                .collect();
            keyed.sort();
            tables.pending_media_ids = keyed.into_iter().map(|(_, id)| id).collect();
        }
    }

    // ── Media: resumable uploads ─────────────────────────────────────

    pub async fn init_resumable_upload(&self, filename: &str, size: u64) -> Result<ResumableInit> {
        if size == 0 {
            return Err(Error::invalid("invalid size"));
        }
        let filename = sanitize_filename(filename);
        let chunk_size = self.config.limits.resumable_chunk_bytes.max(1);

        let mut tables = self.media.lock().await;
        self.reap_stale_uploads(&mut tables);
        self.check_media_caps(&tables, 1)?;

        let store_filename = self
            .reserve_store_names(&mut tables, std::slice::from_ref(&filename))
            .remove(0);

        let upload_id = short_hex_id(32);
        let tmp_path = self.media_store.uploads_dir().join(format!("{upload_id}.part"));
        std::fs::File::create(&tmp_path)?;

        let upload = Arc::new(ResumableUpload::new(
            upload_id.clone(),
            filename.clone(),
            store_filename,
            size,
            chunk_size,
            tmp_path,
            detect_media_kind(&filename),
        ));
        let init = ResumableInit {
            upload_id: upload_id.clone(),
            chunk_size,
            total_chunks: upload.total_chunks,
            filename,
        };
        tables.resumable.insert(upload_id, upload);
        Ok(init)
    }

    pub async fn resumable(&self, upload_id: &str) -> Option<Arc<ResumableUpload>> {
        let mut tables = self.media.lock().await;
        self.reap_stale_uploads(&mut tables);
        tables.resumable.get(upload_id).cloned()
    }

    /// Finalize a resumable upload: verify completeness, promote the
    /// temp file, register the media as pending.
    pub async fn complete_resumable(&self, upload_id: &str) -> Result<MediaMeta> {
        let upload = self
            .resumable(upload_id)
            .await
            .ok_or_else(|| Error::not_found("upload_id not found or expired"))?;

        upload.seal().await?;

        {
            let mut tables = self.media.lock().await;
            tables.resumable.remove(upload_id);
        }

        let meta = self
            .media_store
            .save_from_path(&upload.tmp_path, &upload.store_filename, &upload.filename)
            .await?;
        self.commit_media(vec![meta.clone()], false).await;
        Ok(meta)
    }

    /// Abort an in-flight upload. Unknown ids are fine.
    pub async fn cancel_resumable(&self, upload_id: &str) {
        let upload = {
            let mut tables = self.media.lock().await;
            tables.resumable.remove(upload_id)
        };
        if let Some(upload) = upload {
            upload.abort().await;
        }
    }

    // ── Media: pending lifecycle ─────────────────────────────────────

    pub fn public_media(&self, meta: &MediaMeta) -> Value {
        json!({
            "id": meta.id,
            "name": meta.name,
            "kind": meta.kind,
            "thumb_url": format!("/api/sessions/{}/media/{}/thumb", self.session_id, meta.id),
            "file_url": format!("/api/sessions/{}/media/{}/file", self.session_id, meta.id),
        })
    }

    pub async fn pending_media_public(&self) -> Vec<Value> {
        let tables = self.media.lock().await;
        tables
            .pending_media_ids
            .iter()
            .filter_map(|id| tables.load_media.get(id))
            .map(|meta| self.public_media(meta))
            .collect()
    }

    /// Physically delete a media item — only while it is still pending.
    pub async fn delete_pending(&self, media_id: &str) -> Result<()> {
        let meta = {
            let mut tables = self.media.lock().await;
            if !tables.pending_media_ids.iter().any(|id| id == media_id) {
                return Err(Error::invalid("media is not pending (refusing physical delete)"));
            }
            tables.pending_media_ids.retain(|id| id != media_id);
            tables.load_media.remove(media_id)
        };
        if let Some(meta) = meta {
            self.media_store.delete_files(&meta).await;
        }
        Ok(())
    }

    /// Drain the given ids (or everything) from pending for this turn.
    /// The media itself stays registered.
    pub async fn take_pending_for_message(&self, ids: Option<&[String]>) -> Vec<MediaMeta> {
        let mut tables = self.media.lock().await;
        let picked: Vec<String> = match ids {
            Some(ids) => ids
                .iter()
                .filter(|id| tables.pending_media_ids.iter().any(|p| p == *id))
                .cloned()
                .collect(),
            None => tables.pending_media_ids.clone(),
        };
        tables.pending_media_ids.retain(|id| !picked.contains(id));
        picked
            .iter()
            .filter_map(|id| tables.load_media.get(id).cloned())
            .collect()
    }

    pub async fn media_meta(&self, media_id: &str) -> Option<MediaMeta> {
        self.media.lock().await.load_media.get(media_id).cloned()
    }

    // ── Snapshot ─────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> Value {
        let pending = self.pending_media_public().await;
        let (media_count, pending_count, inflight) = {
            let tables = self.media.lock().await;
            (
                tables.load_media.len(),
                tables.pending_media_ids.len(),
                tables.resumable.len(),
            )
        };
        let st = self.state.lock();
        let limits = &self.config.limits;
        json!({
            "session_id": self.session_id,
            "developer_mode": st.developer_mode,
            "pending_media": pending,
            "history": self.history.lock().to_value(),
            "limits": {
                "max_upload_files_per_request": limits.max_upload_files_per_request,
                "max_media_per_session": limits.max_media_per_session,
                "max_pending_media_per_session": limits.max_pending_media_per_session,
                "upload_chunk_bytes": limits.resumable_chunk_bytes,
            },
            "stats": {
                "media_count": media_count,
                "pending_count": pending_count,
                "inflight_uploads": inflight,
            },
            "chat_model_key": st.chat_model_key,
            "chat_models": st.chat_models,
            "llm_model_key": st.chat_model_key,
            "llm_models": st.chat_models,
            "vlm_model_key": st.vlm_model_key,
            "vlm_models": st.vlm_models,
            "lang": st.lang,
        })
    }

    // ── Private: caps, reaping, naming ───────────────────────────────

    fn check_media_caps(&self, tables: &MediaTables, add: usize) -> Result<()> {
        let limits = &self.config.limits;
        let total =
            tables.load_media.len() + tables.resumable.len() + tables.direct_reservations;
        let pending =
            tables.pending_media_ids.len() + tables.resumable.len() + tables.direct_reservations;

        if limits.max_media_per_session > 0 && total + add > limits.max_media_per_session {
            return Err(Error::invalid(format!(
                "session media cap reached: {total}/{}",
                limits.max_media_per_session
            )));
        }
        if limits.max_pending_media_per_session > 0
            && pending + add > limits.max_pending_media_per_session
        {
            return Err(Error::invalid(format!(
                "pending media cap reached: {pending}/{}",
                limits.max_pending_media_per_session
            )));
        }
        Ok(())
    }

    /// Drop in-flight uploads idle past the TTL and remove their temp
    /// files.
    fn reap_stale_uploads(&self, tables: &mut MediaTables) {
        let now = unix_now();
        let ttl = self.config.limits.resumable_ttl_sec;
        let dead: Vec<String> = tables
            .resumable
            .iter()
            .filter(|(_, u)| u.idle_secs(now) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for upload_id in dead {
            if let Some(upload) = tables.resumable.remove(&upload_id) {
                tracing::info!(upload_id = %upload.upload_id, "reaping stale upload");
                let _ = std::fs::remove_file(&upload.tmp_path);
            }
        }
    }

    /// Initialize the sequence from everything known (disk, registered
    /// media, in-flight uploads), so numbering survives a history
    /// clear and never reuses a number.
    fn init_media_seq(&self, tables: &mut MediaTables) {
        if tables.seq_inited {
            return;
        }
        let mut max_seq = 0;
        if let Ok(entries) = std::fs::read_dir(&self.media_dir) {
            for entry in entries.flatten() {
                if let Some(seq) = parse_media_seq(&entry.file_name().to_string_lossy()) {
                    max_seq = max_seq.max(seq);
                }
            }
        }
        for meta in tables.load_media.values() {
            if let Some(name) = meta.path.file_name() {
                if let Some(seq) = parse_media_seq(&name.to_string_lossy()) {
                    max_seq = max_seq.max(seq);
                }
            }
        }
        for upload in tables.resumable.values() {
            if let Some(seq) = parse_media_seq(&upload.store_filename) {
                max_seq = max_seq.max(seq);
            }
        }
        tables.seq_next = max_seq + 1;
        tables.seq_inited = true;
    }

    /// Reserve store names in order. Numbers are never reused; names
    /// colliding with on-disk files are skipped.
    fn reserve_store_names(&self, tables: &mut MediaTables, display_names: &[String]) -> Vec<String> {
        self.init_media_seq(tables);
        let mut out = Vec::with_capacity(display_names.len());
        let mut seq = tables.seq_next;

        for display in display_names {
            let display = sanitize_filename(display);
            let ext = file_extension(&display);
            let store = loop {
                let candidate = make_store_filename(seq, &ext);
                if !self.media_dir.join(&candidate).exists() {
                    break candidate;
                }
                seq += 1;
            };
            out.push(store);
            seq += 1;
        }
        tables.seq_next = seq;
        out
    }
}

fn resolve_asset_key(st: &ChatState, config: &Config) -> Option<String> {
    match &st.asset_key_custom {
        Some(key) if !key.is_empty() => Some(key.clone()),
        Some(_) => None,
        None => config.search.asset_api_key.clone(),
    }
}

/// A custom model block must carry all three of model/base_url/api_key,
/// and the URL must be http(s).
fn parse_model_block(value: &Value, label: &str) -> Result<ModelOverride> {
    let Value::Object(obj) = value else {
        return Err(Error::invalid(format!("custom {label} config must be an object")));
    };
    let field = |key: &str| -> Result<String> {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::invalid(format!("custom {label} requires model, base_url and api_key"))
            })
    };
    let model = field("model")?;
    let base_url = field("base_url")?;
    let api_key = field("api_key")?;
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(Error::invalid(format!(
            "custom {label} base_url must use http or https"
        )));
    }
    Ok(ModelOverride {
        model,
        base_url,
        api_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_domain::config::ProjectConfig;
    use tempfile::tempdir;

    fn session(dir: &std::path::Path) -> Arc<ChatSession> {
        let config = Arc::new(Config {
            project: ProjectConfig {
                media_dir: dir.join("media"),
                outputs_dir: dir.join("outputs"),
                bgm_dir: dir.join("bgm"),
                templates_dir: dir.join("templates"),
                server_cache_dir: dir.join(".server_cache"),
                session_subdirs: true,
            },
            ..Config::default()
        });
        let registry = Arc::new(NodeRegistry::with_default_specs());
        ChatSession::new("sess0001".into(), config, registry).unwrap()
    }

    async fn add_media(sess: &ChatSession, display: &str, content: &[u8]) -> MediaMeta {
        let names = sess.begin_direct_upload(&[display.to_string()]).await.unwrap();
        let mut reader = std::io::Cursor::new(content.to_vec());
        let meta = sess
            .media_store
            .save_upload(&mut reader, &names[0], display)
            .await
            .unwrap();
        sess.finish_direct_upload(1).await;
        sess.commit_media(vec![meta.clone()], true).await;
        meta
    }

    #[tokio::test]
    async fn store_names_are_sequential_per_reservation_order() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());

        let names = sess
            .begin_direct_upload(&["a.png".into(), "b.mp4".into(), "c.jpg".into()])
            .await
            .unwrap();
        assert_eq!(names, ["media_0001.png", "media_0002.mp4", "media_0003.jpg"]);
        sess.finish_direct_upload(3).await;
    }

    #[tokio::test]
    async fn numbering_never_reuses_after_delete_or_clear() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());

        let m1 = add_media(&sess, "a.png", b"1").await;
        add_media(&sess, "b.png", b"2").await;

        sess.delete_pending(&m1.id).await.unwrap();
        sess.reset_conversation();

        let names = sess.begin_direct_upload(&["c.png".into()]).await.unwrap();
        // media_0002.png still exists on disk, so the next number is 3.
        assert_eq!(names, ["media_0003.png"]);
        sess.finish_direct_upload(1).await;
    }

    #[tokio::test]
    async fn pending_delete_requires_pending_state() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        let meta = add_media(&sess, "a.png", b"1").await;

        // Consume the media in a turn; it is no longer pending.
        let taken = sess.take_pending_for_message(None).await;
        assert_eq!(taken.len(), 1);

        let err = sess.delete_pending(&meta.id).await.unwrap_err();
        assert!(err.to_string().contains("not pending"));
        assert!(meta.path.exists(), "consumed media must never be deleted");
    }

    #[tokio::test]
    async fn take_pending_with_explicit_ids_keeps_others() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        let m1 = add_media(&sess, "a.png", b"1").await;
        let _m2 = add_media(&sess, "b.png", b"2").await;

        let taken = sess.take_pending_for_message(Some(&[m1.id.clone()])).await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, m1.id);

        let pending = sess.pending_media_public().await;
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn resumable_roundtrip_single_chunk() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());

        let init = sess.init_resumable_upload("clip.bin", 3).await.unwrap();
        assert_eq!(init.total_chunks, 1);

        let upload = sess.resumable(&init.upload_id).await.unwrap();
        upload.write_chunk(0, b"abc").await.unwrap();

        let meta = sess.complete_resumable(&init.upload_id).await.unwrap();
        assert_eq!(meta.path.file_name().unwrap().to_string_lossy(), "media_0001.bin");
        assert_eq!(std::fs::read(&meta.path).unwrap(), b"abc");

        // The upload is gone from the in-flight table.
        assert!(sess.resumable(&init.upload_id).await.is_none());
        assert_eq!(sess.pending_media_public().await.len(), 1);
    }

    #[tokio::test]
    async fn resumable_roundtrip_two_chunks_tail_first() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());

        // One byte past the 8 MiB chunk boundary → two chunks.
        let size: u64 = 10_485_761;
        let init = sess.init_resumable_upload("big.mp4", size).await.unwrap();
        assert_eq!(init.chunk_size, 8_388_608);
        assert_eq!(init.total_chunks, 2);

        let upload = sess.resumable(&init.upload_id).await.unwrap();
        let tail = vec![7u8; (size - init.chunk_size) as usize];
        upload.write_chunk(1, &tail).await.unwrap();
        let head = vec![1u8; init.chunk_size as usize];
        upload.write_chunk(0, &head).await.unwrap();

        let meta = sess.complete_resumable(&init.upload_id).await.unwrap();
        assert_eq!(meta.path.metadata().unwrap().len(), size);
        assert_eq!(
            meta.path.file_name().unwrap().to_string_lossy(),
            "media_0001.mp4"
        );
    }

    #[tokio::test]
    async fn resumable_complete_rejects_missing_chunks() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        let init = sess
            .init_resumable_upload("big.bin", 10_485_761)
            .await
            .unwrap();
        assert_eq!(init.total_chunks, 2);

        let err = sess.complete_resumable(&init.upload_id).await.unwrap_err();
        assert!(err.to_string().contains("chunks missing"));
    }

    #[tokio::test]
    async fn resumable_cancel_is_idempotent() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        let init = sess.init_resumable_upload("x.bin", 5).await.unwrap();
        let tmp = sess.resumable(&init.upload_id).await.unwrap().tmp_path.clone();

        sess.cancel_resumable(&init.upload_id).await;
        assert!(!tmp.exists());
        sess.cancel_resumable(&init.upload_id).await;
        assert!(sess.resumable(&init.upload_id).await.is_none());
    }

    #[tokio::test]
    async fn media_caps_count_inflight_and_reservations() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.project = ProjectConfig {
            media_dir: dir.path().join("media"),
            outputs_dir: dir.path().join("outputs"),
            bgm_dir: dir.path().join("bgm"),
            templates_dir: dir.path().join("templates"),
            server_cache_dir: dir.path().join(".server_cache"),
            session_subdirs: true,
        };
        config.limits.max_media_per_session = 2;
        config.limits.max_pending_media_per_session = 2;
        let registry = Arc::new(NodeRegistry::with_default_specs());
        let sess = ChatSession::new("s".into(), Arc::new(config), registry).unwrap();

        sess.init_resumable_upload("a.bin", 1).await.unwrap();
        sess.init_resumable_upload("b.bin", 1).await.unwrap();
        let err = sess.init_resumable_upload("c.bin", 1).await.unwrap_err();
        assert!(err.to_string().contains("cap reached"));
    }

    #[tokio::test]
    async fn snapshot_shape() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        add_media(&sess, "a.png", b"1").await;

        let snap = sess.snapshot().await;
        assert_eq!(snap["session_id"], "sess0001");
        assert_eq!(snap["stats"]["media_count"], 1);
        assert_eq!(snap["stats"]["pending_count"], 1);
        assert_eq!(snap["lang"], "zh");
        assert!(snap["limits"]["upload_chunk_bytes"].as_u64().unwrap() > 0);
        let pending = snap["pending_media"].as_array().unwrap();
        assert!(pending[0]["thumb_url"]
            .as_str()
            .unwrap()
            .contains("/api/sessions/sess0001/media/"));
    }

    #[test]
    fn service_config_validation() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());

        // Missing api_key → rejected.
        let bad = json!({"llm": {"model": "m", "base_url": "https://x"}});
        assert!(sess.apply_service_config(Some(&bad)).is_err());

        // Bad scheme → rejected.
        let bad = json!({"llm": {"model": "m", "base_url": "ftp://x", "api_key": "k"}});
        assert!(sess.apply_service_config(Some(&bad)).is_err());

        // Valid partial update.
        let ok = json!({
            "vlm": {"model": "v", "base_url": "http://y", "api_key": "k2"},
            "tts": {"provider": "indextts", "voice_index": "voice_01"},
            "asset_search": {"mode": "custom", "api_key": "ak"},
        });
        sess.apply_service_config(Some(&ok)).unwrap();

        // Absent config is a no-op.
        sess.apply_service_config(None).unwrap();
    }

    #[test]
    fn lang_validation_falls_back_to_zh() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        assert_eq!(sess.set_lang("EN"), "en");
        assert_eq!(sess.set_lang("fr"), "zh");
    }

    #[tokio::test]
    async fn reset_conversation_keeps_media() {
        let dir = tempdir().unwrap();
        let sess = session(dir.path());
        add_media(&sess, "a.png", b"1").await;
        sess.history.lock().push_user("hello", vec![]);

        sess.reset_conversation();
        assert!(sess.history.lock().entries().is_empty());
        assert_eq!(sess.context.lock().len(), 2);
        assert_eq!(sess.pending_media_public().await.len(), 1);
    }
}
