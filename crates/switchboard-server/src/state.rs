use std::sync::Arc;

use switchboard::{agent::Agent, conversation::InMemoryStore, retry::RetryController};

use crate::configuration::{Settings, StreamSettings};
use crate::error::ConfigError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub stream: StreamSettings,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let agent = Agent::new(
            settings.agent.clone(),
            RetryController::new(settings.retry.clone()),
            settings.routes()?,
            settings.registry()?,
            Arc::new(InMemoryStore::new()),
        );
        Ok(Self {
            agent: Arc::new(agent),
            stream: settings.stream.clone(),
        })
    }
}
