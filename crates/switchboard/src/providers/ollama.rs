use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::base::{AuthStyle, ByteStream, CompletionRequest, Provider, ProviderRequest};
use super::http::HttpTransport;
use super::openai::{chat_completion_payload, OpenAiStreamParser};
use super::sse::drive;
use super::utils::openai_response_to_deltas;
use crate::errors::ProviderError;
use crate::models::delta::{Delta, DeltaStream};

pub const OLLAMA_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OllamaProviderConfig {
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    OLLAMA_HOST.to_string()
}

impl Default for OllamaProviderConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

/// Local models served through Ollama's OpenAI compatible endpoint. Tool
/// calls are only reliable without streaming, so responses are requested
/// whole and replayed as deltas.
pub struct OllamaProvider {
    transport: HttpTransport,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self, ProviderError> {
        let transport = HttpTransport::new(Duration::from_secs(600))?; // 10 minutes timeout
        Ok(Self { transport, config })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::None
    }

    fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<ProviderRequest, ProviderError> {
        let stream = self.supports_streaming();
        Ok(ProviderRequest {
            path: "v1/chat/completions".to_string(),
            headers: Vec::new(),
            body: chat_completion_payload(self.name(), request, stream)?,
            stream,
        })
    }

    fn parse_stream(&self, raw: ByteStream) -> DeltaStream {
        drive(OpenAiStreamParser::new(self.name()), raw)
    }

    fn parse_whole(&self, body: Value) -> Result<Vec<Delta>, ProviderError> {
        openai_response_to_deltas(self.name(), &body)
    }
}
