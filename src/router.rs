// =============================================================================
// Signal Router — second-layer gating + reference-price resolution
// =============================================================================
//
// Consumes `signal:detected:{sym}` (group `cg:signal-router`) and decides
// whether a detected signal becomes a tradeable `signal:final:{sym}` row.
// Owns its own per-(symbol,dir) emission history — disjoint from the
// Aggregator's, since the Router's gates (hysteresis, min-spacing,
// idempotency) are a distinct policy layer applied downstream of detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{groups, AppConfig};
use crate::gate_cache::GateCache;
use crate::redis_stream::{GroupStart, RedisStreams, Trim};
use crate::types::{BookFrame, DetectedSignal, Dir, FinalSignal, RefPxSource, TradeEvent};

const READ_COUNT: usize = 200;
const READ_BLOCK_MS: u64 = 200;
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIM_MIN_IDLE: Duration = Duration::from_secs(30);
/// Reference-price staleness threshold, held independent of `EVAL_PX_SEARCH_MS`:
/// the Router's refPx is a best-effort snapshot at emission time, not a
/// retrying search like the Evaluator's resolver.
const REF_PX_STALE_MS: i64 = 200;

#[derive(Debug, Clone, Default)]
struct RouterState {
    last_emit_ts_by_dir: HashMap<Dir, i64>,
    last_sig_key_by_dir: HashMap<Dir, String>,
    last_emit_dir: Option<Dir>,
    /// Per-reason drop counts for this symbol — the data
    /// `quant_router_dropped_total{reason=...}` would read, kept in-process
    /// since metrics export itself is out of scope.
    drops: HashMap<&'static str, u64>,
}

impl RouterState {
    fn bump_drop(&mut self, reason: &'static str) {
        *self.drops.entry(reason).or_insert(0) += 1;
    }

    /// Drop count for a given reason, e.g. `"strength"`, `"cooldown"`,
    /// `"dedup"`, `"min_spacing"`, `"hysteresis"`, `"idempotent_lock"`,
    /// `"bad_row"`.
    #[allow(dead_code)]
    fn drop_count(&self, reason: &str) -> u64 {
        self.drops.get(reason).copied().unwrap_or(0)
    }
}

fn detected_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("signal:detected:{{{sym}}}"))
}

fn final_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("signal:final:{{{sym}}}"))
}

fn book_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:book"))
}

fn trades_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:trades"))
}

fn idem_key(cfg: &AppConfig, sym: &str, dir: Dir, src: &str, bucket: i64) -> String {
    cfg.key(format!("idem:final:{{{sym}}}:{dir}:{src}:{bucket}"))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Resolve a reference price at emission time: book mid if fresh, else the
/// last trade price.
async fn resolve_ref_px(redis: &RedisStreams, cfg: &AppConfig, sym: &str, now: i64) -> (Option<f64>, Option<RefPxSource>, Option<i64>, bool) {
    if let Ok(rows) = redis.xrevrange_latest(&book_key(cfg, sym), 1).await {
        if let Some((_, fields)) = rows.into_iter().next() {
            if let Ok(book) = BookFrame::decode(&fields) {
                if let Some(mid) = book.mid() {
                    let stale = now - book.ts > REF_PX_STALE_MS;
                    return (Some(mid), Some(RefPxSource::Mid), Some(book.ts), stale);
                }
            }
        }
    }

    if let Ok(rows) = redis.xrevrange_latest(&trades_key(cfg, sym), 1).await {
        if let Some((_, fields)) = rows.into_iter().next() {
            if let Ok(trade) = TradeEvent::decode(&fields) {
                let stale = now - trade.ts > REF_PX_STALE_MS;
                return (Some(trade.px), Some(RefPxSource::Last), Some(trade.ts), stale);
            }
        }
    }

    (None, None, None, true)
}

/// Run the Signal Router until `running` is cleared.
pub async fn run(redis: RedisStreams, cfg: Arc<AppConfig>, running: Arc<AtomicBool>) {
    if !cfg.gate.enabled {
        warn!("signal router: gating disabled via config, not starting");
        return;
    }
    if cfg.symbols.is_empty() {
        warn!("signal router: empty symbol list, stopping");
        return;
    }

    let keys: Vec<String> = cfg.symbols.iter().map(|s| detected_key(&cfg, s)).collect();
    for key in &keys {
        if let Err(e) = redis.ensure_group(key, groups::SIGNAL_ROUTER, GroupStart::New).await {
            warn!(key, error = %e, "signal router: failed to ensure consumer group, stopping");
            return;
        }
    }

    let consumer = format!("router#{}", std::process::id());
    let mut states: HashMap<String, RouterState> = cfg.symbols.iter().map(|s| (s.clone(), RouterState::default())).collect();
    let mut gate_cache = GateCache::new();
    let mut last_reclaim = tokio::time::Instant::now();

    while running.load(Ordering::Relaxed) {
        let batch = redis
            .read_group(&keys, groups::SIGNAL_ROUTER, &consumer, READ_COUNT, Duration::from_millis(READ_BLOCK_MS))
            .await;
        let mut entries = batch.unwrap_or_default();

        if last_reclaim.elapsed() >= RECLAIM_INTERVAL {
            last_reclaim = tokio::time::Instant::now();
            for key in &keys {
                match redis.xautoclaim(key, groups::SIGNAL_ROUTER, &consumer, RECLAIM_MIN_IDLE).await {
                    Ok(reclaimed) => {
                        for (id, fields) in reclaimed {
                            entries.push(crate::redis_stream::StreamEntry { stream_key: key.clone(), id, fields });
                        }
                    }
                    Err(e) => warn!(key, error = %e, "signal router: xautoclaim failed"),
                }
            }
        }

        if entries.is_empty() {
            continue;
        }

        let now = now_ms();
        let normalized = redis.normalize_batch(&entries, now);

        for msg in normalized {
            let signal = match DetectedSignal::decode(&msg.fields, &msg.symbol) {
                Ok(s) => s,
                Err(e) => {
                    debug!(symbol = %msg.symbol, error = %e, "signal router: dropping malformed detected signal (bad_row)");
                    if let Some(state) = states.get_mut(&msg.symbol) {
                        state.bump_drop("bad_row");
                    }
                    redis.ack(&msg.stream_key, groups::SIGNAL_ROUTER, &msg.id).await;
                    continue;
                }
            };

            let Some(state) = states.get_mut(&msg.symbol) else {
                redis.ack(&msg.stream_key, groups::SIGNAL_ROUTER, &msg.id).await;
                continue;
            };

            let _ = route_one(&redis, &cfg, &mut gate_cache, &msg.symbol, state, signal, now).await;

            redis.ack(&msg.stream_key, groups::SIGNAL_ROUTER, &msg.id).await;
        }
    }
}

/// Apply the full gate cascade to one detected signal. Returns `Ok(())` if a
/// final signal was published, or `Err(reason)` naming the gate that
/// rejected it (also recorded in `state`'s drop counters).
async fn route_one(
    redis: &RedisStreams,
    cfg: &AppConfig,
    gate_cache: &mut GateCache,
    sym: &str,
    state: &mut RouterState,
    signal: DetectedSignal,
    now: i64,
) -> Result<(), &'static str> {
    let gate = gate_cache.get(redis, cfg, sym, now).await;

    // finalMin: the stricter of the dyn-gate floor and the static floor.
    let final_min = gate.eff_min0.max(cfg.gate.min_strength_floor);
    if signal.strength < final_min {
        state.bump_drop("strength");
        return Err("strength");
    }

    // Cooldown (per-direction), extended by the Router's own extra cooldown.
    let cooldown_ms = gate.cooldown_ms + cfg.gate.extra_cooldown_ms;
    if let Some(last_ts) = state.last_emit_ts_by_dir.get(&signal.dir) {
        if now - last_ts < cooldown_ms {
            state.bump_drop("cooldown");
            return Err("cooldown");
        }
    }

    // Dedup against the last approx_key emitted for this direction.
    if let Some(prev_key) = state.last_sig_key_by_dir.get(&signal.dir) {
        if prev_key == &signal.approx_key {
            if let Some(last_ts) = state.last_emit_ts_by_dir.get(&signal.dir) {
                if now - last_ts < gate.dedup_ms {
                    state.bump_drop("dedup");
                    return Err("dedup");
                }
            }
        }
    }

    // Min-spacing: per (sym, dir), like cooldown.
    if let Some(last_ts) = state.last_emit_ts_by_dir.get(&signal.dir) {
        if now - last_ts < cfg.gate.min_spacing_ms {
            state.bump_drop("min_spacing");
            return Err("min_spacing");
        }
    }

    // Hysteresis: a direction flip needs the high threshold; a continuation
    // of the same direction only needs the low one.
    let required = match state.last_emit_dir {
        Some(prev_dir) if prev_dir != signal.dir => cfg.gate.hyst_hi,
        Some(_) => cfg.gate.hyst_lo,
        None => cfg.gate.hyst_hi,
    };
    if signal.strength < required {
        state.bump_drop("hysteresis");
        return Err("hysteresis");
    }

    // Idempotency lock: bucket the signal's own ts (not wall-clock `now`) so
    // retried/duplicate deliveries of the same detected signal collapse onto
    // a single emission regardless of when the router happens to see them.
    let bucket = signal.ts.div_euclid(cfg.gate.idem_bucket_ms) * cfg.gate.idem_bucket_ms;
    let lock_key = idem_key(cfg, sym, signal.dir, &signal.evidence.src, bucket);
    match redis.set_nx_px(&lock_key, &signal.ts.to_string(), Duration::from_millis(cfg.gate.idem_ttl_ms as u64)).await {
        Ok(true) => {}
        Ok(false) => {
            state.bump_drop("idempotent_lock");
            return Err("idempotent_lock");
        }
        Err(e) => {
            warn!(sym, error = %e, "signal router: idempotency lock failed, skipping emission");
            state.bump_drop("idempotent_lock");
            return Err("idempotent_lock");
        }
    }

    let (ref_px, ref_px_source, ref_px_ts, ref_px_stale) = resolve_ref_px(redis, cfg, sym, now).await;
    let mut detected = signal.clone();
    // ttlMs is the Router's own view of cooldown, not the detector's: the
    // final signal's lifetime is governed by the gate that actually decided
    // to emit it.
    detected.ttl_ms = cooldown_ms.max(3_000);
    let final_signal = FinalSignal {
        detected,
        ref_px,
        ref_px_source,
        ref_px_ts,
        ref_px_stale,
    };

    if let Err(e) = redis.xadd(&final_key(cfg, sym), &final_signal.to_fields(), Trim::MaxLenApprox(5_000)).await {
        warn!(sym, error = %e, "signal router: failed to publish final signal");
        return Err("publish_failed");
    }

    state.last_emit_ts_by_dir.insert(signal.dir, now);
    state.last_sig_key_by_dir.insert(signal.dir, signal.approx_key.clone());
    state.last_emit_dir = Some(signal.dir);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signal(dir: Dir, strength: f64, approx_key: &str) -> DetectedSignal {
        DetectedSignal {
            ts: 0,
            sym: "BTC-USDT-SWAP".to_string(),
            dir,
            strength,
            evidence: crate::types::Evidence::default(),
            approx_key: approx_key.to_string(),
            strategy_id: "intra.v1".to_string(),
            ttl_ms: 6_000,
        }
    }

    #[test]
    fn router_state_defaults_are_empty() {
        let state = RouterState::default();
        assert!(state.last_emit_ts_by_dir.is_empty());
        assert!(state.last_emit_dir.is_none());
    }

    #[test]
    fn drop_counters_track_reason_and_accumulate() {
        let mut state = RouterState::default();
        assert_eq!(state.drop_count("strength"), 0);
        state.bump_drop("strength");
        state.bump_drop("strength");
        state.bump_drop("cooldown");
        assert_eq!(state.drop_count("strength"), 2);
        assert_eq!(state.drop_count("cooldown"), 1);
        assert_eq!(state.drop_count("dedup"), 0);
    }

    #[test]
    fn sample_signal_roundtrips_fields() {
        let s = sample_signal(Dir::Buy, 0.8, "k1");
        let fields = s.to_fields();
        let decoded = DetectedSignal::decode(&fields, "BTC-USDT-SWAP").unwrap();
        assert_eq!(decoded.approx_key, "k1");
        assert_eq!(decoded.dir, Dir::Buy);
    }
}
