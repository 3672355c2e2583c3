//! Default agent factory.
//!
//! Agent construction (provider clients, prompts, auth) is deployment
//! territory; the stock binary ships a factory that reports the gap as
//! a normal in-band error instead of failing at startup.

use std::sync::Arc;

use cf_domain::config::ModelOverride;
use cf_domain::{Error, Result};
use cf_pipeline::agent::{Agent, AgentFactory};
use cf_pipeline::runtime::ToolRuntime;

/// Factory used until a real agent backend is wired in.
pub struct UnconfiguredAgentFactory;

impl AgentFactory for UnconfiguredAgentFactory {
    fn build(
        &self,
        llm: &ModelOverride,
        _vlm: &ModelOverride,
        _runtime: Arc<ToolRuntime>,
    ) -> Result<Arc<dyn Agent>> {
        tracing::warn!(model = %llm.model, "no agent backend wired into this build");
        Err(Error::Config(
            "no agent backend configured for this deployment".to_string(),
        ))
    }
}
