//! Shared application state passed to all handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use cf_domain::config::Config;
use cf_pipeline::agent::AgentFactory;
use cf_pipeline::registry::NodeRegistry;
use cf_pipeline::templates::TemplateStore;
use cf_sessions::SessionStore;

use crate::limits::TokenBucketLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Session & pipeline ────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub templates: Arc<TemplateStore>,
    pub registry: Arc<NodeRegistry>,
    pub agent_factory: Arc<dyn AgentFactory>,

    // ── Admission ─────────────────────────────────────────────────────
    pub limiter: Arc<TokenBucketLimiter>,
    /// Live WebSocket connections.
    pub ws_connections: Arc<Semaphore>,
    /// Concurrently streaming chat turns (LLM concurrency).
    pub chat_turns: Arc<Semaphore>,
    /// Concurrent upload requests, thumbnailing included.
    pub uploads: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        templates: Arc<TemplateStore>,
        agent_factory: Arc<dyn AgentFactory>,
    ) -> Self {
        let limits = &config.limits;
        let limiter = Arc::new(TokenBucketLimiter::new(
            Duration::from_secs(limits.bucket_ttl_sec),
            Duration::from_secs(limits.bucket_cleanup_interval_sec),
            limits.max_buckets,
            limits.evict_batch,
        ));
        let sessions = Arc::new(SessionStore::new(config.clone(), registry.clone()));

        Self {
            ws_connections: Arc::new(Semaphore::new(limits.ws_max_connections)),
            chat_turns: Arc::new(Semaphore::new(limits.chat_max_concurrency)),
            uploads: Arc::new(Semaphore::new(limits.upload_max_concurrency)),
            limiter,
            sessions,
            templates,
            registry,
            agent_factory,
            config,
        }
    }
}
