use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::Value;

use super::base::{AuthStyle, ByteStream, CompletionRequest, Provider, ProviderRequest, Usage};
use super::credential::ProviderCredential;
use super::http::HttpTransport;
use super::openai::OpenAiStreamParser;
use super::sse::drive;
use crate::errors::ProviderError;
use crate::models::delta::{Delta, DeltaStream};

/// One scripted reply from a `MockProvider`
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Deliver these deltas, then end the stream
    Deltas(Vec<Delta>),
    /// Deliver these deltas, then stall without ever finishing
    Stall(Vec<Delta>),
    /// Fail before any delta is produced
    Error(ProviderError),
}

impl MockResponse {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MockResponse::Deltas(vec![
            Delta::text(text),
            Delta::Usage {
                usage: Usage::new(10, 5),
            },
            Delta::done(Some("stop")),
        ])
    }

    /// A response requesting the given tool calls, in order
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut deltas = Vec::new();
        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            deltas.push(Delta::ToolCallStart {
                index,
                id: id.to_string(),
                name: name.to_string(),
            });
            deltas.push(Delta::ToolCallArgs {
                index,
                fragment: arguments.to_string(),
            });
            deltas.push(Delta::ToolCallEnd {
                index,
                truncated: false,
            });
        }
        deltas.push(Delta::done(Some("tool_calls")));
        MockResponse::Deltas(deltas)
    }
}

/// A mock provider that replays scripted responses, for testing
pub struct MockProvider {
    name: String,
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
    transport: HttpTransport,
}

impl MockProvider {
    pub fn new<S: Into<String>>(name: S, responses: Vec<MockResponse>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            transport: HttpTransport::default(),
        }
    }

    /// Requests received so far, including those answered with an error
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        "mock://"
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::None
    }

    fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<ProviderRequest, ProviderError> {
        Ok(ProviderRequest {
            path: "mock".to_string(),
            headers: Vec::new(),
            body: Value::String(request.model.clone()),
            stream: true,
        })
    }

    fn parse_stream(&self, raw: ByteStream) -> DeltaStream {
        drive(OpenAiStreamParser::new(self.name()), raw)
    }

    fn parse_whole(&self, _body: Value) -> Result<Vec<Delta>, ProviderError> {
        Ok(Vec::new())
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credential: &ProviderCredential,
    ) -> Result<DeltaStream, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());

        match next {
            Some(MockResponse::Deltas(deltas)) => Ok(stream::iter(deltas).boxed()),
            Some(MockResponse::Stall(deltas)) => {
                Ok(stream::iter(deltas).chain(stream::pending()).boxed())
            }
            Some(MockResponse::Error(error)) => Err(error),
            None => Err(ProviderError::fatal(&self.name, "no scripted response left")),
        }
    }
}
