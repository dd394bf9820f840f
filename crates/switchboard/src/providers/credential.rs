use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::{ProviderError, ProviderErrorKind};

/// Where a secret comes from. Secrets are resolved at request time so rotated
/// environment values are picked up without a restart.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretRef {
    Literal(String),
    Env(String),
}

impl SecretRef {
    pub fn resolve(&self, provider: &str) -> Result<String, ProviderError> {
        match self {
            SecretRef::Literal(value) => Ok(value.clone()),
            SecretRef::Env(var) => std::env::var(var).map_err(|_| {
                ProviderError::auth(provider, format!("environment variable {} is not set", var))
            }),
        }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Literal(_) => write!(f, "Literal(***)"),
            SecretRef::Env(var) => write!(f, "Env({})", var),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitState {
    pub requests: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<ProviderErrorKind>,
    pub cooldown_until: Option<Instant>,
}

/// A secret for one provider along with its mutable rate limit bookkeeping.
#[derive(Debug)]
pub struct ProviderCredential {
    pub provider_id: String,
    pub secret: SecretRef,
    rate_limit: Mutex<RateLimitState>,
}

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);
const MAX_COOLDOWN: Duration = Duration::from_secs(60);

impl ProviderCredential {
    pub fn new<S: Into<String>>(provider_id: S, secret: SecretRef) -> Self {
        Self {
            provider_id: provider_id.into(),
            secret,
            rate_limit: Mutex::new(RateLimitState::default()),
        }
    }

    pub fn snapshot(&self) -> RateLimitState {
        match self.rate_limit.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_cooling_down(&self) -> bool {
        self.snapshot()
            .cooldown_until
            .is_some_and(|until| until > Instant::now())
    }

    pub fn record_success(&self) {
        self.update(|state| {
            state.requests += 1;
            state.consecutive_failures = 0;
            state.cooldown_until = None;
        });
    }

    /// Record a failed call. Rate limited credentials are parked for the
    /// server's requested interval, or an exponential default when none was given.
    pub fn record_failure(&self, error: &ProviderError) {
        self.update(|state| {
            state.requests += 1;
            state.failures += 1;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error = Some(error.kind);
            if error.kind == ProviderErrorKind::RateLimit {
                let backoff = error.retry_after.unwrap_or_else(|| {
                    let exponent = state.consecutive_failures.saturating_sub(1).min(6);
                    (DEFAULT_COOLDOWN * 2u32.pow(exponent)).min(MAX_COOLDOWN)
                });
                state.cooldown_until = Some(Instant::now() + backoff);
            }
        });
    }

    fn update<F: FnOnce(&mut RateLimitState)>(&self, f: F) {
        let mut guard = match self.rate_limit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_secret_resolves() {
        let secret = SecretRef::Literal("sk-test".to_string());
        assert_eq!(secret.resolve("openai").unwrap(), "sk-test");
        assert_eq!(format!("{:?}", secret), "Literal(***)");
    }

    #[test]
    fn test_missing_env_secret_is_auth_error() {
        let secret = SecretRef::Env("SWITCHBOARD_TEST_SECRET_THAT_IS_NOT_SET".to_string());
        let error = secret.resolve("openai").unwrap_err();
        assert_eq!(error.kind, ProviderErrorKind::Auth);
    }

    #[test]
    fn test_rate_limit_failure_starts_cooldown() {
        let credential = ProviderCredential::new("openai", SecretRef::Literal("k".into()));
        credential.record_failure(&ProviderError::rate_limit(
            "openai",
            "slow down",
            Some(Duration::from_secs(30)),
        ));

        let state = credential.snapshot();
        assert_eq!(state.failures, 1);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.last_error, Some(ProviderErrorKind::RateLimit));
        assert!(credential.is_cooling_down());

        credential.record_success();
        let state = credential.snapshot();
        assert_eq!(state.requests, 2);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!credential.is_cooling_down());
    }

    #[test]
    fn test_transient_failure_does_not_cool_down() {
        let credential = ProviderCredential::new("openai", SecretRef::Literal("k".into()));
        credential.record_failure(&ProviderError::transient("openai", "reset"));
        assert!(!credential.is_cooling_down());
        assert_eq!(credential.snapshot().failures, 1);
    }
}
