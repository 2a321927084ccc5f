//! Per-run cost limiter. Enforced on `llm.call` emission, not
//! on node completion, so it can gate the event before downstream sinks
//! ever see it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{GraphError, PolicyError, Result};

#[derive(Debug, Clone, Default)]
pub struct CostConfig {
    pub per_run_tokens: Option<u64>,
}

#[derive(Default)]
pub struct CostLimiter {
    config: CostConfig,
    run_totals: Mutex<HashMap<String, u64>>,
}

impl CostLimiter {
    pub fn new(config: CostConfig) -> Self {
        Self { config, run_totals: Mutex::new(HashMap::new()) }
    }

    pub fn record_llm_call(&self, run_id: &str, tokens_in: u64, tokens_out: u64) -> Result<()> {
        let Some(cap) = self.config.per_run_tokens else { return Ok(()) };
        let mut totals = self.run_totals.lock().expect("cost limiter mutex poisoned");
        let total = totals.entry(run_id.to_string()).or_insert(0);
        *total += tokens_in + tokens_out;
        if *total > cap {
            return Err(GraphError::Policy(PolicyError::new(
                "ERR_COST_LIMIT_EXCEEDED",
                format!("run '{run_id}' exceeded per-run token cap of {cap} (used {total})"),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_calls_under_cap() {
        let limiter = CostLimiter::new(CostConfig { per_run_tokens: Some(100) });
        limiter.record_llm_call("r1", 30, 30).unwrap();
        limiter.record_llm_call("r1", 30, 9).unwrap();
    }

    #[test]
    fn rejects_calls_over_cap() {
        let limiter = CostLimiter::new(CostConfig { per_run_tokens: Some(50) });
        limiter.record_llm_call("r1", 30, 10).unwrap();
        let err = limiter.record_llm_call("r1", 20, 0).unwrap_err();
        assert_eq!(err.code(), "ERR_COST_LIMIT_EXCEEDED");
    }

    #[test]
    fn unconfigured_cap_never_rejects() {
        let limiter = CostLimiter::new(CostConfig::default());
        for _ in 0..10 {
            limiter.record_llm_call("r1", 1_000_000, 1_000_000).unwrap();
        }
    }

    #[test]
    fn tracks_runs_independently() {
        let limiter = CostLimiter::new(CostConfig { per_run_tokens: Some(10) });
        limiter.record_llm_call("r1", 10, 0).unwrap();
        limiter.record_llm_call("r2", 10, 0).unwrap();
    }
}
