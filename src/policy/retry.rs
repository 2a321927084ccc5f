//! Retry engine.
//!
//! A policy wraps a fallible async operation, retrying on a retryable
//! failure up to `max_attempts` times with a strategy-specific delay, and
//! re-raising the *original* failure once attempts are exhausted — retries
//! are recovered locally; they never invent a new error.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{GraphError, PolicyError, Result, RuntimeError};
use crate::events::EmitFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Exponential,
    Jitter,
}

impl RetryStrategy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "fixed" => Ok(RetryStrategy::Fixed),
            "exponential" => Ok(RetryStrategy::Exponential),
            "jitter" => Ok(RetryStrategy::Jitter),
            other => Err(GraphError::Policy(PolicyError::new(
                "ERR_RETRY_PREDICATE",
                format!("unknown retry strategy '{other}'"),
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub interval: Duration,
    pub jitter: Duration,
}

impl RetryPolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(GraphError::Policy(PolicyError::new(
                "ERR_RETRY_PREDICATE",
                "max_attempts must be >= 1",
            )));
        }
        Ok(())
    }

    /// Delay before attempt `n` (1-based), per strategy:
    /// fixed: `interval`; exponential: `interval * 2^(n-1)`;
    /// jitter: `interval * max(1, n) + U[0, jitter]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.interval,
            RetryStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.interval * factor
            }
            RetryStrategy::Jitter => {
                let base = self.interval * attempt.max(1);
                let jitter_secs = self.jitter.as_secs_f64();
                let extra = if jitter_secs > 0.0 {
                    rand::thread_rng().gen_range(0.0..=jitter_secs)
                } else {
                    0.0
                };
                base + Duration::from_secs_f64(extra)
            }
        }
    }
}

pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn execute<T, F, Fut>(
        &self,
        emit: &EmitFn,
        run_id: &str,
        node_id: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    let retryable = is_retryable(&err);
                    if !retryable || attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    let delay = self.config.delay_for_attempt(attempt);
                    let mut payload = HashMap::new();
                    payload.insert("run_id".to_string(), serde_json::Value::String(run_id.to_string()));
                    payload.insert("node_id".to_string(), serde_json::Value::String(node_id.to_string()));
                    payload.insert("attempt".to_string(), serde_json::Value::from(attempt));
                    payload.insert("delay".to_string(), serde_json::Value::from(delay.as_secs_f64()));
                    payload.insert("error".to_string(), serde_json::Value::String(err.to_string()));
                    let _ = emit("retry.attempt", payload);
                    tracing::warn!(run_id, node_id, attempt, delay_ms = delay.as_secs_f64() * 1000.0, error = %err, "retrying node after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn is_retryable(err: &GraphError) -> bool {
    match err {
        GraphError::Runtime(inner) => inner.is_retryable(),
        _ => false,
    }
}

/// Resolves a per-node policy override, falling back to the configured
/// default.
pub struct RetryManager {
    default_policy: RetryPolicyConfig,
    overrides: HashMap<String, RetryPolicyConfig>,
}

impl RetryManager {
    pub fn new(default_policy: RetryPolicyConfig, overrides: HashMap<String, RetryPolicyConfig>) -> Result<Self> {
        default_policy.validate()?;
        for policy in overrides.values() {
            policy.validate()?;
        }
        Ok(Self { default_policy, overrides })
    }

    pub fn for_node(&self, node_id: &str) -> Result<RetryPolicy> {
        let config = self.overrides.get(node_id).cloned().unwrap_or_else(|| self.default_policy.clone());
        RetryPolicy::new(config)
    }
}
