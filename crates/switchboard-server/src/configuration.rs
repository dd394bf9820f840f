use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use switchboard::{
    agent::AgentConfig,
    providers::{
        anthropic::{AnthropicProviderConfig, ANTHROPIC_DEFAULT_HOST},
        credential::{ProviderCredential, SecretRef},
        factory::{get_provider, ProviderConfig},
        ollama::{OllamaProviderConfig, OLLAMA_HOST},
        openai::{OpenAiProviderConfig, OPENAI_DEFAULT_HOST},
    },
    retry::{RetryPolicy, Route},
    tools::{builtin::CalculatorTool, RegistryConfig, RemoteToolServer, ToolRegistry},
};

/// Points at an optional TOML file layered under the environment
pub const CONFIG_PATH_VAR: &str = "SWITCHBOARD_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// An API key given inline. Never printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(***)")
    }
}

/// One entry of the provider fallback list. Keys are read from `api_key_env`
/// at call time unless given inline with `api_key`. A `retry` table replaces
/// the global `[retry]` policy for this provider only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    OpenAi {
        #[serde(default = "default_openai_host")]
        host: String,
        #[serde(default)]
        api_key: Option<ApiKey>,
        #[serde(default = "default_openai_key_env")]
        api_key_env: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        retry: Option<RetryPolicy>,
    },
    Anthropic {
        #[serde(default = "default_anthropic_host")]
        host: String,
        #[serde(default = "default_anthropic_max_tokens")]
        max_tokens: u32,
        #[serde(default)]
        api_key: Option<ApiKey>,
        #[serde(default = "default_anthropic_key_env")]
        api_key_env: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        retry: Option<RetryPolicy>,
    },
    Ollama {
        #[serde(default = "default_ollama_host")]
        host: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        retry: Option<RetryPolicy>,
    },
}

impl ProviderSettings {
    pub fn model(&self) -> Option<&str> {
        match self {
            ProviderSettings::OpenAi { model, .. }
            | ProviderSettings::Anthropic { model, .. }
            | ProviderSettings::Ollama { model, .. } => model.as_deref(),
        }
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        match self {
            ProviderSettings::OpenAi { retry, .. }
            | ProviderSettings::Anthropic { retry, .. }
            | ProviderSettings::Ollama { retry, .. } => retry.as_ref(),
        }
    }

    /// Build the provider and its credential
    pub fn into_route(self) -> Result<Route, ConfigError> {
        let model = self.model().map(str::to_string);
        let retry = self.retry().cloned();
        let (config, secret) = match self {
            ProviderSettings::OpenAi {
                host,
                api_key,
                api_key_env,
                ..
            } => (
                ProviderConfig::OpenAi(OpenAiProviderConfig { host }),
                secret(api_key, api_key_env),
            ),
            ProviderSettings::Anthropic {
                host,
                max_tokens,
                api_key,
                api_key_env,
                ..
            } => (
                ProviderConfig::Anthropic(AnthropicProviderConfig { host, max_tokens }),
                secret(api_key, api_key_env),
            ),
            ProviderSettings::Ollama { host, .. } => (
                ProviderConfig::Ollama(OllamaProviderConfig { host }),
                SecretRef::Literal(String::new()),
            ),
        };

        let provider = get_provider(config).map_err(|e| ConfigError::Provider(e.to_string()))?;
        let credential = Arc::new(ProviderCredential::new(provider.name(), secret));
        let mut route = Route::new(provider, credential);
        if let Some(model) = model {
            route = route.with_model(model);
        }
        if let Some(retry) = retry {
            route = route.with_retry(retry);
        }
        Ok(route)
    }
}

fn secret(api_key: Option<ApiKey>, api_key_env: String) -> SecretRef {
    match api_key {
        Some(ApiKey(key)) => SecretRef::Literal(key),
        None => SecretRef::Env(api_key_env),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolServerSettings {
    pub name: String,
    pub url: String,
    #[serde(default = "default_tool_server_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolSettings {
    #[serde(default)]
    pub servers: Vec<ToolServerSettings>,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamSettings {
    /// Events buffered per client before the turn waits
    #[serde(default = "default_stream_capacity")]
    pub capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            capacity: default_stream_capacity(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl StreamSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    /// Tried first
    pub provider: ProviderSettings,
    /// Tried in order once the primary provider is exhausted
    #[serde(default)]
    pub fallbacks: Vec<ProviderSettings>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub stream: StreamSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("stream.capacity", default_stream_capacity() as u64)?
            .set_default("stream.heartbeat_secs", default_heartbeat_secs())?;

        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Toml));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("SWITCHBOARD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // The tag of an internally tagged enum is reported without its path
        if let Err(config::ConfigError::NotFound(_)) = config.get_string("provider.type") {
            return Err(ConfigError::MissingEnvVar {
                env_var: to_env_var("provider.type"),
            });
        }

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`');
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }

    /// The primary provider followed by the fallbacks, in order
    pub fn routes(&self) -> Result<Vec<Route>, ConfigError> {
        std::iter::once(self.provider.clone())
            .chain(self.fallbacks.iter().cloned())
            .map(ProviderSettings::into_route)
            .collect()
    }

    pub fn registry(&self) -> Result<Arc<ToolRegistry>, ConfigError> {
        let mut registry = ToolRegistry::new(self.tools.registry.clone())
            .with_executor(Arc::new(CalculatorTool));
        for server in &self.tools.servers {
            let remote = RemoteToolServer::new(
                &server.name,
                &server.url,
                Duration::from_secs(server.timeout_secs),
            )
            .map_err(|e| ConfigError::ToolServer(format!("{}: {}", server.name, e)))?;
            registry = registry.with_server(Arc::new(remote));
        }
        Ok(Arc::new(registry))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_openai_host() -> String {
    OPENAI_DEFAULT_HOST.to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_anthropic_host() -> String {
    ANTHROPIC_DEFAULT_HOST.to_string()
}

fn default_anthropic_max_tokens() -> u32 {
    AnthropicProviderConfig::default().max_tokens
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_ollama_host() -> String {
    OLLAMA_HOST.to_string()
}

fn default_tool_server_timeout() -> u64 {
    30
}

fn default_stream_capacity() -> usize {
    64
}

fn default_heartbeat_secs() -> u64 {
    15
}
