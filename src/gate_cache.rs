// =============================================================================
// Gate Cache — 1s local cache over `dyn:gate:{sym}` reads
// =============================================================================
//
// The Detector (via the Window Worker), Router, and Evaluator all read the
// same dyn-gate Hash every tick. Spec.md §4.5 step 2 and §5 call for "a 1s
// local cache to bound read rate" — implemented once here so every reader
// shares the same caching contract instead of re-deriving it.

use std::collections::HashMap;

use crate::config::AppConfig;
use crate::market_env::DynGate;
use crate::redis_stream::RedisStreams;

const CACHE_TTL_MS: i64 = 1_000;

/// Per-symbol cached `DynGate` reads, refreshed at most once per second.
#[derive(Default)]
pub struct GateCache {
    entries: HashMap<String, (DynGate, i64)>,
}

impl GateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached gate for `sym`, re-fetching from Redis if the
    /// cache entry is missing or older than 1s. Falls back to a gate
    /// derived from static defaults if no cycle has ever populated Redis
    /// yet: consumers must tolerate stale values.
    pub async fn get(&mut self, redis: &RedisStreams, cfg: &AppConfig, sym: &str, now_ms: i64) -> DynGate {
        if let Some((gate, fetched_at)) = self.entries.get(sym) {
            if now_ms - fetched_at < CACHE_TTL_MS {
                return *gate;
            }
        }

        let key = cfg.key(format!("dyn:gate:{{{sym}}}"));
        let gate = match redis.hgetall(&key).await {
            Ok(fields) if !fields.is_empty() => DynGate::from_fields(&fields).unwrap_or_else(|| default_gate(now_ms)),
            _ => default_gate(now_ms),
        };
        self.entries.insert(sym.to_string(), (gate, now_ms));
        gate
    }
}

fn default_gate(now_ms: i64) -> DynGate {
    DynGate::compute(0.0, 0.0, 0.0, false, 0, crate::market_env::DEFAULT_MIN_NOTIONAL3S_BASE, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gate_is_conservative() {
        let g = default_gate(0);
        assert!(g.eff_min0 >= 0.6);
        assert_eq!(g.oi_regime, 0);
    }
}
