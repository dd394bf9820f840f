use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::configuration::Settings;
use crate::error::{api_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct ReloadResponse {
    providers: Vec<String>,
    tool_servers: Vec<String>,
}

/// Re-read the configuration and swap in new provider routes, the retry
/// policy and tool servers. Turns already running finish with what they
/// started with.
async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let settings = Settings::new().map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let routes = settings
        .routes()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let registry = settings
        .registry()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    let response = ReloadResponse {
        providers: routes
            .iter()
            .map(|route| route.provider.name().to_string())
            .collect(),
        tool_servers: registry
            .servers()
            .iter()
            .map(|server| server.name().to_string())
            .collect(),
    };

    state.agent.set_routes(routes);
    state.agent.set_retry_policy(settings.retry.clone());
    state.agent.set_registry(registry);
    tracing::info!(
        providers = ?response.providers,
        max_attempts = settings.retry.max_attempts,
        tool_servers = ?response.tool_servers,
        "configuration reloaded"
    );
    Ok(Json(response))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/config/reload", post(reload))
        .with_state(state)
}
