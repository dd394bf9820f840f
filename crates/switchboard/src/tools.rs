//! Tools the agent can call: builtin executors compiled into the process and
//! tools discovered at runtime from remote tool servers.
pub mod builtin;
pub mod registry;
pub mod remote;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

pub use registry::{RegistryConfig, ToolRegistry};
pub use remote::RemoteToolServer;

/// A tool implemented in process
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Name, description and argument schema
    fn tool(&self) -> Tool;

    /// Whether calls to this tool must wait for earlier calls in the same batch
    fn sequential(&self) -> bool {
        false
    }

    async fn execute(&self, arguments: Value) -> ToolResult<Vec<Content>>;
}

#[derive(Clone)]
pub enum ToolSource {
    Static(Arc<dyn ToolExecutor>),
    Remote(Arc<RemoteToolServer>),
}

/// Everything needed to validate and run one tool
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub sequential: bool,
    pub source: ToolSource,
    pub fetched_at: Instant,
}

impl ToolDescriptor {
    pub fn from_executor(executor: Arc<dyn ToolExecutor>) -> Self {
        let tool = executor.tool();
        Self {
            name: tool.name,
            description: tool.description,
            schema: tool.input_schema,
            sequential: executor.sequential(),
            source: ToolSource::Static(executor),
            fetched_at: Instant::now(),
        }
    }

    pub fn as_tool(&self) -> Tool {
        Tool::new(&self.name, &self.description, self.schema.clone())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, ToolSource::Remote(_))
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            ToolSource::Static(_) => "static".to_string(),
            ToolSource::Remote(server) => format!("remote:{}", server.name()),
        };
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("sequential", &self.sequential)
            .field("source", &source)
            .finish()
    }
}

/// Check arguments against a tool's JSON schema before it runs
pub fn validate_against_schema(schema: &Value, args: &Value) -> ToolResult<()> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| ToolError::execution(format!("invalid tool schema: {e}")))?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    Err(ToolError::validation(errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolErrorKind;
    use serde_json::json;

    #[test]
    fn test_validate_against_schema() {
        let schema = json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        });

        assert!(validate_against_schema(&schema, &json!({"city": "Paris"})).is_ok());

        let error = validate_against_schema(&schema, &json!({"city": 3})).unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Validation);

        let error = validate_against_schema(&schema, &json!({})).unwrap_err();
        assert!(error.message.contains("city"));
    }

    #[test]
    fn test_invalid_schema_is_execution_error() {
        let error = validate_against_schema(&json!({"type": 12}), &json!({})).unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Execution);
    }
}
