use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

pub fn handle(request: RpcRequest) -> RpcResponse {
    match request.method.as_str() {
        "tools/list" => RpcResponse::ok(request.id, json!({ "tools": tool_listing() })),
        "tools/call" => {
            let name = request.params["name"].as_str().unwrap_or_default().to_string();
            let arguments = &request.params["arguments"];
            match call_tool(&name, arguments) {
                Ok(text) => RpcResponse::ok(
                    request.id,
                    json!({"content": [{"type": "text", "text": text}], "isError": false}),
                ),
                Err(message) => RpcResponse::error(request.id, INVALID_PARAMS, message),
            }
        }
        other => RpcResponse::error(
            request.id,
            METHOD_NOT_FOUND,
            format!("method not found: {}", other),
        ),
    }
}

fn tool_listing() -> Value {
    json!([
        {
            "name": "weather",
            "description": "Current weather for a city",
            "inputSchema": {
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }
        },
        {
            "name": "echo",
            "description": "Repeat the given text back",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        }
    ])
}

fn call_tool(name: &str, arguments: &Value) -> Result<String, String> {
    match name {
        "weather" => {
            let city = arguments["city"]
                .as_str()
                .ok_or_else(|| "city must be a string".to_string())?;
            Ok(forecast(city))
        }
        "echo" => arguments["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "text must be a string".to_string()),
        other => Err(format!("unknown tool: {}", other)),
    }
}

// Canned so that runs are reproducible
fn forecast(city: &str) -> String {
    let conditions = match city.to_lowercase().as_str() {
        "paris" => "18C, light rain",
        "london" => "14C, overcast",
        "tokyo" => "24C, clear",
        _ => "21C, partly cloudy",
    };
    format!("{}: {}", city, conditions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            id: json!(7),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_list_tools() {
        let response = handle(request("tools/list", json!({})));
        let tools = response.result.unwrap()["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["weather", "echo"]);
        assert_eq!(response.id, json!(7));
    }

    #[test]
    fn test_weather() {
        let response = handle(request(
            "tools/call",
            json!({"name": "weather", "arguments": {"city": "Paris"}}),
        ));
        assert_eq!(
            response.result.unwrap()["content"][0]["text"],
            "Paris: 18C, light rain"
        );
    }

    #[test]
    fn test_echo_requires_text() {
        let response = handle(request(
            "tools/call",
            json!({"name": "echo", "arguments": {"text": 5}}),
        ));
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.message, "text must be a string");
    }

    #[test]
    fn test_unknown_method() {
        let response = handle(request("resources/list", Value::Null));
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
        assert!(response.result.is_none());
    }
}
