use crate::config::AgentConfig;
use crate::session::SessionController;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Owner of every voice session
    pub controller: Arc<SessionController>,

    /// Persona and voice used when a request omits them
    pub agent: Arc<AgentConfig>,
}

impl AppState {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self {
            controller,
            agent: Arc::new(AgentConfig::default()),
        }
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = Arc::new(agent);
        self
    }
}
