use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use switchboard::models::message::Message;

use crate::error::{api_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct CancelResponse {
    cancelled: bool,
}

/// The active path of a conversation, oldest first
async fn messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    state
        .agent
        .store()
        .read_active_path(&conversation_id)
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

async fn cancel(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = state.agent.cancel(&conversation_id);
    tracing::info!(conversation = %conversation_id, cancelled, "cancel requested");
    Json(CancelResponse { cancelled })
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/conversations/:id/messages", get(messages))
        .route("/conversations/:id/cancel", post(cancel))
        .with_state(state)
}
