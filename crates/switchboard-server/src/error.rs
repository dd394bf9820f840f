use axum::{http::StatusCode, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid provider configuration: {0}")]
    Provider(String),

    #[error("Invalid tool server configuration: {0}")]
    ToolServer(String),

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error<E: std::fmt::Display>(status: StatusCode, error: E) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// The environment variable that sets a configuration key, e.g.
/// `provider.type` becomes `SWITCHBOARD_PROVIDER__TYPE`.
pub fn to_env_var(field_path: &str) -> String {
    let path = field_path
        .split('.')
        .map(|part| part.to_uppercase())
        .collect::<Vec<_>>()
        .join("__");
    format!("SWITCHBOARD_{}", path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("provider.type"), "SWITCHBOARD_PROVIDER__TYPE");
        assert_eq!(to_env_var("server.port"), "SWITCHBOARD_SERVER__PORT");
        assert_eq!(to_env_var("agent.max_tool_calls"), "SWITCHBOARD_AGENT__MAX_TOOL_CALLS");
    }
}
