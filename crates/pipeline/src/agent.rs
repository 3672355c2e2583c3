//! The agent seam.
//!
//! The language-model side of a chat turn is a black box that consumes
//! the model-facing context and produces a tagged event stream: text
//! deltas, authoritative message updates, and a terminal done/error.
//! Tool calls happen inside the agent, through the interceptor chain of
//! the [`ToolRuntime`] it was built with.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;

use cf_domain::config::ModelOverride;
use cf_domain::message::ContextMessage;
use cf_domain::Result;

use crate::runtime::ToolRuntime;

/// A boxed async stream.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Events an agent emits while running one turn.
#[derive(Debug, Clone)]
pub enum AgentItem {
    /// Incremental assistant text.
    Delta(String),
    /// Authoritative new messages since the previous graph step.
    Update(Vec<ContextMessage>),
    /// The turn finished cleanly.
    Done,
    /// The turn failed; the message is user-facing.
    Error(String),
}

pub trait Agent: Send + Sync {
    /// Run one turn over the given context. The stream ends after
    /// `Done` or `Error`; dropping it cancels the turn cooperatively.
    fn stream_turn(&self, messages: Vec<ContextMessage>) -> BoxStream<'static, AgentItem>;
}

/// Builds agents for a resolved `(llm, vlm)` override pair. The
/// gateway caches the built agent until the pair changes.
pub trait AgentFactory: Send + Sync {
    fn build(
        &self,
        llm: &ModelOverride,
        vlm: &ModelOverride,
        runtime: Arc<ToolRuntime>,
    ) -> Result<Arc<dyn Agent>>;
}
