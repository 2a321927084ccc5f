//! Rate limiters: token bucket and fixed window, each guarded by its own
//! mutex, plus a manager that consults a shared/provider layer before a
//! per-node layer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::{GraphError, PolicyError, Result};
use crate::events::EmitFn;

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, emit: &EmitFn, run_id: &str, scope: &str, target: &str) -> Result<()>;
}

struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucketRateLimiter {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<TokenBucketState>,
}

impl TokenBucketRateLimiter {
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if capacity <= 0.0 || refill_rate <= 0.0 {
            return Err(GraphError::Policy(PolicyError::new(
                "ERR_RL_POLICY_PARAM",
                "token bucket requires capacity > 0 and refill_rate > 0",
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
            state: Mutex::new(TokenBucketState { tokens: capacity, last_refill: Instant::now() }),
        })
    }

    fn accrue(&self, state: &mut TokenBucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

#[async_trait::async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn acquire(&self, emit: &EmitFn, run_id: &str, scope: &str, target: &str) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.accrue(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate))
                }
            };
            match wait {
                None => return Ok(()),
                Some(wait) => {
                    emit_wait(emit, run_id, scope, target, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

struct FixedWindowState {
    window_start: Instant,
    count: u64,
}

pub struct FixedWindowRateLimiter {
    limit: u64,
    window: Duration,
    state: Mutex<FixedWindowState>,
}

impl FixedWindowRateLimiter {
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 || window.is_zero() {
            return Err(GraphError::Policy(PolicyError::new(
                "ERR_RL_POLICY_PARAM",
                "fixed window requires limit > 0 and window > 0",
            )));
        }
        Ok(Self { limit, window, state: Mutex::new(FixedWindowState { window_start: Instant::now(), count: 0 }) })
    }
}

#[async_trait::async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn acquire(&self, emit: &EmitFn, run_id: &str, scope: &str, target: &str) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now.duration_since(state.window_start) >= self.window {
                    state.window_start = now;
                    state.count = 0;
                }
                if state.count < self.limit {
                    state.count += 1;
                    None
                } else {
                    Some(self.window - now.duration_since(state.window_start))
                }
            };
            match wait {
                None => return Ok(()),
                Some(wait) => {
                    emit_wait(emit, run_id, scope, target, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

fn emit_wait(emit: &EmitFn, run_id: &str, scope: &str, target: &str, wait: Duration) {
    let mut payload = HashMap::new();
    payload.insert("run_id".to_string(), serde_json::Value::String(run_id.to_string()));
    payload.insert("scope".to_string(), serde_json::Value::String(scope.to_string()));
    payload.insert("target".to_string(), serde_json::Value::String(target.to_string()));
    payload.insert("wait_time".to_string(), serde_json::Value::from(wait.as_secs_f64()));
    let _ = emit("rate.limit.wait", payload);
}

/// Resolves layered limiters for a node: a shared-or-per-provider layer,
/// then a per-node layer; either may be absent.
#[derive(Default)]
pub struct RateLimiterManager {
    node_limits: HashMap<String, Box<dyn RateLimiter>>,
    provider_limits: HashMap<String, Box<dyn RateLimiter>>,
    shared_providers: HashMap<String, String>,
}

impl RateLimiterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node_limit(&mut self, node_id: impl Into<String>, limiter: Box<dyn RateLimiter>) {
        self.node_limits.insert(node_id.into(), limiter);
    }

    pub fn register_provider_limit(&mut self, provider_id: impl Into<String>, limiter: Box<dyn RateLimiter>) {
        self.provider_limits.insert(provider_id.into(), limiter);
    }

    pub fn alias_provider(&mut self, provider_id: impl Into<String>, shared_target: impl Into<String>) {
        self.shared_providers.insert(provider_id.into(), shared_target.into());
    }

    pub async fn acquire(&self, emit: &EmitFn, run_id: &str, node_id: &str, provider_id: Option<&str>) -> Result<()> {
        if let Some(provider_id) = provider_id {
            let target = self.shared_providers.get(provider_id).map(String::as_str).unwrap_or(provider_id);
            if let Some(limiter) = self.provider_limits.get(target) {
                limiter.acquire(emit, run_id, "provider", target).await?;
            }
        }
        if let Some(limiter) = self.node_limits.get(node_id) {
            limiter.acquire(emit, run_id, "node", node_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::null_emit_fn;

    #[tokio::test]
    async fn token_bucket_admits_back_to_back_with_large_refill() {
        let limiter = TokenBucketRateLimiter::new(1.0, 1_000_000.0).unwrap();
        let emit = null_emit_fn();
        for _ in 0..5 {
            limiter.acquire(&emit, "r1", "node", "n1").await.unwrap();
        }
    }

    #[tokio::test]
    async fn fixed_window_admits_up_to_limit_then_waits() {
        let limiter = FixedWindowRateLimiter::new(2, Duration::from_millis(20)).unwrap();
        let emit = null_emit_fn();
        limiter.acquire(&emit, "r1", "node", "n1").await.unwrap();
        limiter.acquire(&emit, "r1", "node", "n1").await.unwrap();
        let start = Instant::now();
        limiter.acquire(&emit, "r1", "node", "n1").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn invalid_token_bucket_params_are_rejected() {
        assert_eq!(TokenBucketRateLimiter::new(0.0, 1.0).unwrap_err().code(), "ERR_RL_POLICY_PARAM");
        assert_eq!(TokenBucketRateLimiter::new(1.0, 0.0).unwrap_err().code(), "ERR_RL_POLICY_PARAM");
    }

    #[test]
    fn invalid_fixed_window_params_are_rejected() {
        assert_eq!(FixedWindowRateLimiter::new(0, Duration::from_secs(1)).unwrap_err().code(), "ERR_RL_POLICY_PARAM");
    }

    #[tokio::test]
    async fn manager_consults_provider_then_node_layer() {
        let mut manager = RateLimiterManager::new();
        manager.register_provider_limit("openai", Box::new(TokenBucketRateLimiter::new(1.0, 1_000_000.0).unwrap()));
        manager.register_node_limit("n1", Box::new(TokenBucketRateLimiter::new(1.0, 1_000_000.0).unwrap()));
        let emit = null_emit_fn();
        manager.acquire(&emit, "r1", "n1", Some("openai")).await.unwrap();
    }
}
