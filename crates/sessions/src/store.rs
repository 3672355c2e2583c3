//! In-memory session store keyed by a generated opaque id. Sessions
//! are ephemeral by contract; nothing survives a process restart.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cf_domain::config::Config;
use cf_domain::{short_hex_id, Error, Result};
use cf_pipeline::registry::NodeRegistry;

use crate::session::ChatSession;

pub struct SessionStore {
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    sessions: RwLock<HashMap<String, Arc<ChatSession>>>,
}

impl SessionStore {
    pub fn new(config: Arc<Config>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self) -> Result<Arc<ChatSession>> {
        let session_id = short_hex_id(32);
        let session =
            ChatSession::new(session_id.clone(), self.config.clone(), self.registry.clone())?;
        self.sessions.write().insert(session_id.clone(), session.clone());
        tracing::info!(session_id, "session created");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ChatSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn get_or_404(&self, session_id: &str) -> Result<Arc<ChatSession>> {
        self.get(session_id)
            .ok_or_else(|| Error::not_found("session not found"))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
