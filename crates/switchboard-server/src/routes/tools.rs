use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard::tools::{ToolDescriptor, ToolSource};

use crate::error::{api_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct ToolInfo {
    name: String,
    description: String,
    input_schema: Value,
    /// `builtin` or the name of the tool server
    source: String,
}

impl From<ToolDescriptor> for ToolInfo {
    fn from(descriptor: ToolDescriptor) -> Self {
        let source = match &descriptor.source {
            ToolSource::Static(_) => "builtin".to_string(),
            ToolSource::Remote(server) => server.name().to_string(),
        };
        Self {
            name: descriptor.name,
            description: descriptor.description,
            input_schema: descriptor.schema,
            source,
        }
    }
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    let tools = state.agent.registry().list().await;
    Json(tools.into_iter().map(ToolInfo::from).collect())
}

/// Ask every tool server for its tools now instead of waiting for the cache to expire
async fn refresh_tools(State(state): State<AppState>) -> Result<Json<Vec<ToolInfo>>, ApiError> {
    let registry = state.agent.registry();
    registry
        .refresh()
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))?;
    let tools = registry.list().await;
    Ok(Json(tools.into_iter().map(ToolInfo::from).collect()))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/refresh", post(refresh_tools))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mock_state;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_list_builtin_tools() {
        let (state, _) = mock_state(vec![]);
        let request = Request::builder().uri("/tools").body(Body::empty()).unwrap();

        let response = routes(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let tools: Vec<ToolInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "calculator");
        assert_eq!(tools[0].source, "builtin");
        assert_eq!(tools[0].input_schema["required"][0], "expression");
    }
}
