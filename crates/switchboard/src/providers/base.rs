use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::credential::ProviderCredential;
use super::http::{byte_stream, HttpTransport};
use crate::errors::ProviderError;
use crate::models::delta::{Delta, DeltaStream};
use crate::models::message::Message;
use crate::models::tool::Tool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Combine two reports for the same call. Providers report running totals,
    /// so taking the maximum keeps the figure monotonic no matter how often or
    /// in which order the numbers arrive.
    pub fn merge_max(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.max(other.input_tokens),
            output_tokens: self.output_tokens.max(other.output_tokens),
        }
    }

    /// Sum of two independent calls
    pub fn add(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
        }
    }
}

/// A provider independent request for a model completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new<M: Into<String>, S: Into<String>>(model: M, system: S, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }
}

/// A request already translated into a vendor's wire format
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub stream: bool,
}

/// How a credential's secret is attached to outgoing requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    Header(String),
    None,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// Base trait for model providers (OpenAI, Anthropic, etc)
///
/// Adapters only translate: requests into the vendor's wire format and the
/// vendor's responses into canonical deltas. Sending, retrying and routing
/// live elsewhere.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier used in logs and errors, and to match credentials to providers
    fn name(&self) -> &str;

    fn host(&self) -> &str;

    fn auth_style(&self) -> AuthStyle;

    fn transport(&self) -> &HttpTransport;

    /// Whether the vendor can stream; when false the whole response is parsed
    /// and replayed as a stream of deltas.
    fn supports_streaming(&self) -> bool {
        true
    }

    fn translate_request(&self, request: &CompletionRequest)
        -> Result<ProviderRequest, ProviderError>;

    fn parse_stream(&self, raw: ByteStream) -> DeltaStream;

    fn parse_whole(&self, body: Value) -> Result<Vec<Delta>, ProviderError>;

    /// Send a completion request with the given credential and return its deltas.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credential: &ProviderCredential,
    ) -> Result<DeltaStream, ProviderError> {
        let provider_request = self.translate_request(request)?;
        let secret = match self.auth_style() {
            AuthStyle::None => None,
            _ => Some(credential.secret.resolve(self.name())?),
        };
        let response = self
            .transport()
            .post(
                self.name(),
                self.host(),
                &provider_request,
                &self.auth_style(),
                secret.as_deref(),
            )
            .await?;

        if provider_request.stream {
            return Ok(self.parse_stream(byte_stream(self.name(), response)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::transient(self.name(), e.to_string()))?;
        let deltas = self.parse_whole(body)?;
        Ok(stream::iter(deltas).boxed())
    }
}
