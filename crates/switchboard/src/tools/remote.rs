use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// A tool as listed by a remote server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub sequential: bool,
}

fn empty_object_schema() -> Value {
    json!({"type": "object"})
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    tools: Vec<RemoteTool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<Content>,
    #[serde(default)]
    is_error: bool,
}

/// Client for a tool server speaking JSON-RPC 2.0 over HTTP
/// (`tools/list` and `tools/call`).
#[derive(Debug)]
pub struct RemoteToolServer {
    name: String,
    endpoint: String,
    client: Client,
    next_id: AtomicU64,
}

impl RemoteToolServer {
    pub fn new<N: Into<String>, E: Into<String>>(
        name: N,
        endpoint: E,
        timeout: Duration,
    ) -> ToolResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::unavailable(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Transport failures mean the server is unavailable; JSON-RPC errors
    /// come from the tool itself and are execution failures.
    async fn call(&self, method: &str, params: Value) -> ToolResult<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::unavailable(format!("{}: {}", self.name, e)))?;

        if !response.status().is_success() {
            return Err(ToolError::unavailable(format!(
                "{} responded with {}",
                self.name,
                response.status()
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ToolError::unavailable(format!("{}: invalid response: {}", self.name, e)))?;

        if let Some(error) = body.error {
            return Err(ToolError::execution(format!(
                "{} ({})",
                error.message, error.code
            )));
        }
        body.result
            .ok_or_else(|| ToolError::unavailable(format!("{}: response had no result", self.name)))
    }

    pub async fn discover(&self) -> ToolResult<Vec<RemoteTool>> {
        let result = self.call("tools/list", json!({})).await?;
        let listing: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| ToolError::unavailable(format!("{}: invalid listing: {}", self.name, e)))?;
        Ok(listing.tools)
    }

    pub async fn execute(&self, tool_name: &str, arguments: Value) -> ToolResult<Vec<Content>> {
        let result = self
            .call("tools/call", json!({"name": tool_name, "arguments": arguments}))
            .await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| ToolError::execution(format!("invalid tool result: {}", e)))?;

        if result.is_error {
            let message = result
                .content
                .iter()
                .filter_map(Content::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ToolError::execution(message));
        }
        Ok(result.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolErrorKind;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server(uri: String) -> RemoteToolServer {
        RemoteToolServer::new("stub", uri, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_discover() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"jsonrpc": "2.0", "method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"tools": [
                    {"name": "weather", "description": "Current weather", "inputSchema": {"type": "object"}},
                    {"name": "echo"}
                ]}
            })))
            .mount(&mock_server)
            .await;

        let tools = server(mock_server.uri()).discover().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "weather");
        assert_eq!(tools[1].input_schema, json!({"type": "object"}));
        assert!(!tools[1].sequential);
    }

    #[tokio::test]
    async fn test_execute_maps_rpc_and_tool_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "weather"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"content": [{"type": "text", "text": "unknown city"}], "isError": true}
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "missing"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {"code": -32601, "message": "no such tool"}
            })))
            .mount(&mock_server)
            .await;

        let server = server(mock_server.uri());
        let error = server.execute("weather", json!({"city": "Atlantis"})).await.unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Execution);
        assert_eq!(error.message, "unknown city");

        let error = server.execute("missing", json!({})).await.unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Execution);
        assert!(error.message.contains("no such tool"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let error = server("http://127.0.0.1:1".to_string())
            .discover()
            .await
            .unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Unavailable);
    }
}
