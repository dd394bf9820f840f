mod configuration;
mod error;
mod routes;
mod state;

use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = configuration::Settings::new()?;
    let state = state::AppState::from_settings(&settings)?;
    info!(
        providers = settings.fallbacks.len() + 1,
        tool_servers = settings.tools.servers.len(),
        "configuration loaded"
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(settings.server.socket_addr()?).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod test_support {
    use std::env;
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use serde_json::json;
    use switchboard::{
        agent::{Agent, AgentConfig},
        conversation::InMemoryStore,
        multiplexer::ClientEvent,
        providers::{
            credential::{ProviderCredential, SecretRef},
            mock::{MockProvider, MockResponse},
        },
        retry::{RetryController, RetryPolicy, Route},
        tools::{builtin::CalculatorTool, RegistryConfig, ToolRegistry},
    };

    use crate::configuration::StreamSettings;
    use crate::state::AppState;

    pub fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("SWITCHBOARD_") {
                env::remove_var(&key);
            }
        }
    }

    /// State backed by a scripted provider and an in memory store
    pub fn mock_state(responses: Vec<MockResponse>) -> (AppState, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new("mock", responses));
        let credential = ProviderCredential::new("mock", SecretRef::Literal("test".to_string()));
        let registry = ToolRegistry::new(RegistryConfig::default()).with_executor(Arc::new(CalculatorTool));
        let agent = Agent::new(
            AgentConfig::default(),
            RetryController::new(RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            }),
            vec![Route::new(provider.clone(), Arc::new(credential))],
            Arc::new(registry),
            Arc::new(InMemoryStore::new()),
        );
        let state = AppState {
            agent: Arc::new(agent),
            stream: StreamSettings {
                capacity: 16,
                heartbeat_secs: 3600,
            },
        };
        (state, provider)
    }

    pub fn reply_request(conversation_id: &str, text: &str) -> Request<Body> {
        Request::builder()
            .uri("/reply")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"conversation_id": conversation_id, "text": text}).to_string(),
            ))
            .unwrap()
    }

    /// The `data:` frames of an event stream body, decoded
    pub fn parse_events(body: &[u8]) -> Vec<ClientEvent> {
        String::from_utf8_lossy(body)
            .split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }
}
