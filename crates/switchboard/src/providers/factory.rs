use std::sync::Arc;

use serde::Deserialize;

use super::{
    anthropic::{AnthropicProvider, AnthropicProviderConfig},
    base::Provider,
    ollama::{OllamaProvider, OllamaProviderConfig},
    openai::{OpenAiProvider, OpenAiProviderConfig},
};
use crate::errors::ProviderError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    #[serde(rename = "openai")]
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Ollama(OllamaProviderConfig),
}

pub fn get_provider(config: ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Ok(Arc::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Arc::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::Ollama(ollama_config) => Ok(Arc::new(OllamaProvider::new(ollama_config)?)),
    }
}
