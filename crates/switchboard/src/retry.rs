//! Retry and failover around opening a provider stream.
//!
//! A call is retried only until its first delta has been handed to the
//! caller; after that the stream belongs to the orchestrator and failures
//! surface as error deltas.
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::delta::{Delta, DeltaStream};
use crate::providers::base::{CompletionRequest, Provider};
use crate::providers::credential::ProviderCredential;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per route, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, kind: ProviderErrorKind) -> bool {
        matches!(kind, ProviderErrorKind::Transient | ProviderErrorKind::RateLimit)
    }

    /// min(base * 2^attempt + base * jitter, max) with jitter in [0, 1]
    pub fn backoff_delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay_ms as f64;
        let exponential = base * 2_f64.powi(attempt.min(30) as i32);
        let delay = (exponential + base * jitter.clamp(0.0, 1.0)).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.backoff_delay_with_jitter(attempt, jitter)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// A provider paired with the credential used to call it
#[derive(Clone)]
pub struct Route {
    pub provider: Arc<dyn Provider>,
    pub credential: Arc<ProviderCredential>,
    /// Model to ask this route for, overriding the one in the request
    pub model: Option<String>,
    /// Retry policy for this route, overriding the controller's
    pub retry: Option<RetryPolicy>,
}

impl Route {
    pub fn new(provider: Arc<dyn Provider>, credential: Arc<ProviderCredential>) -> Self {
        Self {
            provider,
            credential,
            model: None,
            retry: None,
        }
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("provider", &self.provider.name())
            .field("credential", &self.credential.provider_id)
            .field("model", &self.model)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    #[error("all provider routes failed: {0}")]
    Exhausted(ProviderError),

    #[error("provider call was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a stream on the first route that produces a delta, retrying and
    /// failing over as the error taxonomy allows.
    pub async fn open(
        &self,
        request: &CompletionRequest,
        routes: &[Route],
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, RetryError> {
        let mut last_error =
            ProviderError::fatal("router", "no provider routes are configured");

        for route in schedule(routes) {
            let provider = route.provider.name().to_string();
            let policy = route.retry.clone().unwrap_or_else(|| self.policy.clone());

            for attempt in 0..policy.max_attempts.max(1) {
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }

                let error = match self.attempt(&route, request).await {
                    Ok(stream) => return Ok(stream),
                    Err(error) => error,
                };
                tracing::warn!(
                    provider = %provider,
                    attempt,
                    kind = %error.kind,
                    error = %error.message,
                    "provider call failed"
                );

                if error.kind == ProviderErrorKind::ContentPolicy {
                    return Err(RetryError::Exhausted(error));
                }

                let retry_after = error.retry_after;
                let retryable = policy.is_retryable(error.kind);
                last_error = error;

                if !retryable || attempt + 1 >= policy.max_attempts {
                    break;
                }
                // A server asking for a longer pause than we are willing to
                // wait sends us to the next route instead.
                if retry_after.is_some_and(|wait| wait > policy.max_delay()) {
                    break;
                }

                let delay = policy
                    .backoff_delay(attempt)
                    .max(retry_after.unwrap_or_default());
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            tracing::info!(provider = %provider, "failing over to next route");
        }

        Err(RetryError::Exhausted(last_error))
    }

    /// One attempt: send the request and wait for the first delta. An error as
    /// the first delta counts as a failed attempt since nothing was delivered yet.
    async fn attempt(
        &self,
        route: &Route,
        request: &CompletionRequest,
    ) -> Result<DeltaStream, ProviderError> {
        let credential = route.credential.clone();
        let routed;
        let request = match &route.model {
            Some(model) if *model != request.model => {
                routed = CompletionRequest {
                    model: model.clone(),
                    ..request.clone()
                };
                &routed
            }
            _ => request,
        };
        let outcome = async {
            let mut deltas = route.provider.stream(request, &credential).await?;
            match deltas.next().await {
                Some(Delta::Error { error }) => Err(error),
                Some(first) => Ok((first, deltas)),
                None => Err(ProviderError::truncated(route.provider.name())),
            }
        }
        .await;

        match outcome {
            Ok((first, rest)) => {
                credential.record_success();
                let tracked = rest.inspect(move |delta| {
                    if let Delta::Error { error } = delta {
                        credential.record_failure(error);
                    }
                });
                Ok(stream::once(async move { first }).chain(tracked).boxed())
            }
            Err(error) => {
                route.credential.record_failure(&error);
                Err(error)
            }
        }
    }
}

/// Routes in configured order, with credentials that are cooling down moved last.
fn schedule(routes: &[Route]) -> Vec<Route> {
    let (ready, cooling): (Vec<Route>, Vec<Route>) = routes
        .iter()
        .cloned()
        .partition(|route| !route.credential.is_cooling_down());
    ready.into_iter().chain(cooling).collect()
}
