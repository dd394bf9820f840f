use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{validate_against_schema, RemoteToolServer, ToolDescriptor, ToolExecutor, ToolSource};
use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long a discovery result is trusted before servers are asked again
    pub refresh_interval_secs: u64,
    /// Descriptors older than this are never used without a fresh discovery attempt
    pub max_staleness_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            max_staleness_secs: 300,
        }
    }
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness_secs)
    }
}

#[derive(Default)]
struct DynamicCache {
    tools: BTreeMap<String, ToolDescriptor>,
    last_attempt: Option<Instant>,
}

/// Builtin tools plus a cache of tools discovered from remote servers.
///
/// Reads take a shared lock on the cache. Refreshes are single flight: one
/// caller talks to the servers while concurrent callers wait and reuse its result.
pub struct ToolRegistry {
    statics: BTreeMap<String, ToolDescriptor>,
    servers: Vec<Arc<RemoteToolServer>>,
    cache: RwLock<DynamicCache>,
    refresh_lock: Mutex<()>,
    refresh_interval: Duration,
    max_staleness: Duration,
}

impl ToolRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_durations(config.refresh_interval(), config.max_staleness())
    }

    pub fn with_durations(refresh_interval: Duration, max_staleness: Duration) -> Self {
        Self {
            statics: BTreeMap::new(),
            servers: Vec::new(),
            cache: RwLock::new(DynamicCache::default()),
            refresh_lock: Mutex::new(()),
            refresh_interval,
            max_staleness,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        let descriptor = ToolDescriptor::from_executor(executor);
        self.statics.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn with_server(mut self, server: Arc<RemoteToolServer>) -> Self {
        self.servers.push(server);
        self
    }

    pub fn servers(&self) -> &[Arc<RemoteToolServer>] {
        &self.servers
    }

    fn read_cache<T>(&self, f: impl FnOnce(&DynamicCache) -> T) -> T {
        match self.cache.read() {
            Ok(cache) => f(&cache),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_cache<T>(&self, f: impl FnOnce(&mut DynamicCache) -> T) -> T {
        match self.cache.write() {
            Ok(mut cache) => f(&mut cache),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Ask every remote server for its tools. Servers that fail keep their
    /// previous descriptors, which then age towards the staleness limit.
    pub async fn refresh(&self) -> ToolResult<()> {
        let requested_at = Instant::now();
        let _guard = self.refresh_lock.lock().await;

        // Another caller refreshed while we were waiting for the lock
        if self.read_cache(|cache| cache.last_attempt.is_some_and(|at| at >= requested_at)) {
            return Ok(());
        }

        let results = join_all(self.servers.iter().map(|server| async move {
            (server.clone(), server.discover().await)
        }))
        .await;

        let fetched_at = Instant::now();
        let mut failures = Vec::new();
        self.write_cache(|cache| {
            for (server, result) in results {
                match result {
                    Ok(tools) => {
                        cache.tools.retain(|_, descriptor| {
                            !matches!(&descriptor.source, ToolSource::Remote(s) if Arc::ptr_eq(s, &server))
                        });
                        for tool in tools {
                            if self.statics.contains_key(&tool.name) {
                                tracing::warn!(server = server.name(), tool = %tool.name, "remote tool shadowed by builtin");
                                continue;
                            }
                            cache.tools.insert(
                                tool.name.clone(),
                                ToolDescriptor {
                                    name: tool.name,
                                    description: tool.description,
                                    schema: tool.input_schema,
                                    sequential: tool.sequential,
                                    source: ToolSource::Remote(server.clone()),
                                    fetched_at,
                                },
                            );
                        }
                    }
                    Err(error) => {
                        tracing::warn!(server = server.name(), error = %error, "tool discovery failed");
                        failures.push(format!("{}: {}", server.name(), error.message));
                    }
                }
            }
            cache.last_attempt = Some(fetched_at);
        });

        if !failures.is_empty() && failures.len() == self.servers.len() {
            return Err(ToolError::unavailable(failures.join("; ")));
        }
        Ok(())
    }

    /// Refresh if the refresh interval has passed. Returns whether a refresh was attempted.
    async fn ensure_fresh(&self) -> bool {
        if self.servers.is_empty() {
            return false;
        }
        let due = self.read_cache(|cache| {
            cache
                .last_attempt
                .map_or(true, |at| at.elapsed() >= self.refresh_interval)
        });
        if due {
            if let Err(error) = self.refresh().await {
                tracing::warn!(error = %error, "continuing with cached tools");
            }
        }
        due
    }

    fn cached(&self, name: &str) -> Option<ToolDescriptor> {
        self.read_cache(|cache| cache.tools.get(name).cloned())
    }

    fn is_fresh(&self, descriptor: &ToolDescriptor) -> bool {
        descriptor.fetched_at.elapsed() <= self.max_staleness
    }

    pub async fn resolve(&self, name: &str) -> ToolResult<ToolDescriptor> {
        if let Some(descriptor) = self.statics.get(name) {
            return Ok(descriptor.clone());
        }

        let refreshed = self.ensure_fresh().await;
        match self.cached(name) {
            Some(descriptor) if self.is_fresh(&descriptor) => Ok(descriptor),
            Some(_) => {
                if !refreshed {
                    if let Err(error) = self.refresh().await {
                        tracing::warn!(tool = name, error = %error, "could not refresh stale tool");
                    }
                }
                match self.cached(name) {
                    Some(descriptor) if self.is_fresh(&descriptor) => Ok(descriptor),
                    _ => Err(ToolError::unavailable(format!(
                        "{} is stale and its server could not be reached",
                        name
                    ))),
                }
            }
            None => Err(ToolError::not_found(name)),
        }
    }

    /// Every tool currently usable, builtin first then remote, each sorted by name
    pub async fn list(&self) -> Vec<ToolDescriptor> {
        self.ensure_fresh().await;
        let mut descriptors: Vec<ToolDescriptor> = self.statics.values().cloned().collect();
        let remote: Vec<ToolDescriptor> = self.read_cache(|cache| {
            cache
                .tools
                .values()
                .filter(|descriptor| self.is_fresh(descriptor))
                .cloned()
                .collect()
        });
        descriptors.extend(remote);
        descriptors
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.list().await.iter().map(ToolDescriptor::as_tool).collect()
    }

    /// Validate and run one call. Dropping the returned future abandons the
    /// call, which also drops any in-flight request to a remote server.
    pub async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        arguments: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ToolResult<Vec<Content>> {
        validate_against_schema(&descriptor.schema, &arguments)?;

        let call = async {
            match &descriptor.source {
                ToolSource::Static(executor) => executor.execute(arguments).await,
                ToolSource::Remote(server) => server.execute(&descriptor.name, arguments).await,
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::cancelled()),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(ToolError::timeout(format!(
                    "{} did not finish within {}ms",
                    descriptor.name,
                    timeout.as_millis()
                ))),
            },
        };

        if let Err(error) = &result {
            tracing::debug!(tool = %descriptor.name, error = %error, "tool call failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolErrorKind;
    use crate::tools::builtin::CalculatorTool;
    use async_trait::async_trait;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct SlowTool;

    #[async_trait]
    impl ToolExecutor for SlowTool {
        fn tool(&self) -> Tool {
            Tool::new("slow", "Never finishes quickly", json!({"type": "object"}))
        }

        async fn execute(&self, _arguments: Value) -> ToolResult<Vec<Content>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![Content::text("late")])
        }
    }

    fn listing() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"tools": [{
                "name": "weather",
                "description": "Current weather",
                "inputSchema": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }
            }]}
        }))
    }

    fn remote(uri: String) -> Arc<RemoteToolServer> {
        Arc::new(RemoteToolServer::new("stub", uri, Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn test_resolve_static_and_missing() {
        let registry = ToolRegistry::new(RegistryConfig::default())
            .with_executor(Arc::new(CalculatorTool));

        let descriptor = registry.resolve("calculator").await.unwrap();
        assert!(!descriptor.is_remote());

        let error = registry.resolve("nope").await.unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_invoke_validates_arguments() {
        let registry = ToolRegistry::new(RegistryConfig::default())
            .with_executor(Arc::new(CalculatorTool));
        let descriptor = registry.resolve("calculator").await.unwrap();
        let cancel = CancellationToken::new();

        let error = registry
            .invoke(&descriptor, json!({"expr": "1+1"}), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Validation);

        let result = registry
            .invoke(&descriptor, json!({"expression": "1+1"}), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(result, vec![Content::text("2")]);
    }

    #[tokio::test]
    async fn test_invoke_timeout_and_cancel() {
        let registry = ToolRegistry::new(RegistryConfig::default()).with_executor(Arc::new(SlowTool));
        let descriptor = registry.resolve("slow").await.unwrap();

        let error = registry
            .invoke(&descriptor, json!({}), Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Timeout);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = registry
            .invoke(&descriptor, json!({}), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_discovery() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(listing().set_delay(Duration::from_millis(50)))
            .expect(1)
            .mount(&mock_server)
            .await;

        let registry = Arc::new(
            ToolRegistry::with_durations(Duration::from_secs(3600), Duration::from_secs(3600))
                .with_server(remote(mock_server.uri())),
        );

        let lookups = (0..5).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("weather").await })
        });
        for lookup in join_all(lookups).await {
            let descriptor = lookup.unwrap().unwrap();
            assert!(descriptor.is_remote());
        }
    }

    #[tokio::test]
    async fn test_stale_descriptor_is_not_used_when_refresh_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(listing())
            .mount(&mock_server)
            .await;

        let registry = ToolRegistry::with_durations(Duration::from_secs(3600), Duration::from_millis(50))
            .with_server(remote(mock_server.uri()));
        assert!(registry.resolve("weather").await.is_ok());

        mock_server.reset().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let error = registry.resolve("weather").await.unwrap_err();
        assert_eq!(error.kind, ToolErrorKind::Unavailable);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_degrades_to_builtin_when_discovery_fails() {
        let registry = ToolRegistry::new(RegistryConfig::default())
            .with_executor(Arc::new(CalculatorTool))
            .with_server(remote("http://127.0.0.1:1".to_string()));

        let names: Vec<String> = registry.tools().await.into_iter().map(|tool| tool.name).collect();
        assert_eq!(names, vec!["calculator".to_string()]);
        assert!(registry.refresh().await.is_err());
    }
}
