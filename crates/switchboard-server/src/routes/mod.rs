pub mod config;
pub mod conversations;
pub mod reply;
pub mod tools;

use axum::Router;

use crate::state::AppState;

pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(reply::routes(state.clone()))
        .merge(conversations::routes(state.clone()))
        .merge(tools::routes(state.clone()))
        .merge(config::routes(state))
}
