// =============================================================================
// Window Worker task — trade stream consumer, sealing, rollup, detection
// =============================================================================
//
// One cooperative task per process, consuming `ws:{sym}:trades` for every
// configured symbol via a single consumer-group read. Owns every per-symbol
// map exclusively — no locks needed, since nothing else ever touches it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aggregator::{Aggregator, AggregatorDynConfig, AggregatorStaticConfig};
use crate::config::{groups, AppConfig};
use crate::detector::{detect_all, DetectorCtx, DetectorStaticConfig};
use crate::gate_cache::GateCache;
use crate::numeric::ewma_update;
use crate::redis_stream::{GroupStart, RedisStreams, Trim};
use crate::types::TradeEvent;
use crate::window::{Flow3s, PriceHistory, TfWindow, Win1m, DYN_ABS_DELTA_ALPHA};

const READ_COUNT: usize = 200;
const READ_BLOCK_MS: u64 = 200;
const STATE_TTL_SECS: i64 = 600;
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIM_MIN_IDLE: Duration = Duration::from_secs(30);

struct SymbolState {
    win1m: Win1m,
    tf: HashMap<&'static str, TfWindow>,
    flow: Flow3s,
    prices: PriceHistory,
    dyn_abs_delta: Option<f64>,
}

impl SymbolState {
    fn new() -> Self {
        let mut tf = HashMap::new();
        tf.insert("5m", TfWindow::new(5 * 60_000));
        tf.insert("15m", TfWindow::new(15 * 60_000));
        Self { win1m: Win1m::default(), tf, flow: Flow3s::default(), prices: PriceHistory::default(), dyn_abs_delta: None }
    }
}

fn trades_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:trades"))
}

fn win_state_key(cfg: &AppConfig, tf: &str, sym: &str) -> String {
    cfg.key(format!("win:state:{tf}:{{{sym}}}"))
}

fn win_stream_key(cfg: &AppConfig, tf: &str, sym: &str) -> String {
    cfg.key(format!("win:{tf}:{{{sym}}}"))
}

fn detected_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("signal:detected:{{{sym}}}"))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Run the Window Worker until `running` is cleared.
pub async fn run(redis: RedisStreams, cfg: Arc<AppConfig>, running: Arc<AtomicBool>) {
    if cfg.symbols.is_empty() {
        warn!("window worker: empty symbol list, stopping");
        return;
    }

    let keys: Vec<String> = cfg.symbols.iter().map(|s| trades_key(&cfg, s)).collect();
    for key in &keys {
        if let Err(e) = redis.ensure_group(key, groups::WINDOW, GroupStart::New).await {
            warn!(key, error = %e, "window worker: failed to ensure consumer group, stopping");
            return;
        }
    }

    let consumer = format!("window#{}", std::process::id());
    let mut states: HashMap<String, SymbolState> = cfg.symbols.iter().map(|s| (s.clone(), SymbolState::new())).collect();
    let mut aggregator = Aggregator::new();
    let mut gate_cache = GateCache::new();
    let static_cfg = AggregatorStaticConfig::default();
    let detector_static = DetectorStaticConfig::default();

    let mut drop_bad_row: u64 = 0;
    let mut last_reclaim = tokio::time::Instant::now();

    while running.load(Ordering::Relaxed) {
        let batch = redis
            .read_group(&keys, groups::WINDOW, &consumer, READ_COUNT, Duration::from_millis(READ_BLOCK_MS))
            .await;

        let mut entries = batch.unwrap_or_default();

        if last_reclaim.elapsed() >= RECLAIM_INTERVAL {
            last_reclaim = tokio::time::Instant::now();
            for key in &keys {
                match redis.xautoclaim(key, groups::WINDOW, &consumer, RECLAIM_MIN_IDLE).await {
                    Ok(reclaimed) => {
                        for (id, fields) in reclaimed {
                            entries.push(crate::redis_stream::StreamEntry { stream_key: key.clone(), id, fields });
                        }
                    }
                    Err(e) => warn!(key, error = %e, "window worker: xautoclaim failed"),
                }
            }
        }

        if entries.is_empty() {
            continue;
        }

        let now = now_ms();
        let normalized = redis.normalize_batch(&entries, now);

        for msg in normalized {
            let trade = match TradeEvent::decode(&msg.fields) {
                Ok(t) => t,
                Err(e) => {
                    drop_bad_row += 1;
                    debug!(symbol = %msg.symbol, error = %e, total = drop_bad_row, "window worker: dropping malformed trade, leaving unacked");
                    continue;
                }
            };

            let Some(state) = states.get_mut(&msg.symbol) else {
                // Unconfigured symbol somehow delivered — ack to avoid
                // poison-blocking the group on a row we'll never process.
                redis.ack(&msg.stream_key, groups::WINDOW, &msg.id).await;
                continue;
            };

            let sealed_1m = state.win1m.on_trade(trade.ts, trade.px, trade.qty, trade.side);
            state.flow.push(trade.ts, trade.px, trade.qty, trade.side, 1.0);
            state.prices.push(trade.px);

            let flow_delta = (state.flow.buy - state.flow.sell).abs();
            state.dyn_abs_delta = Some(ewma_update(state.dyn_abs_delta, flow_delta, DYN_ABS_DELTA_ALPHA));

            if let Some(bar) = &state.win1m.current {
                let _ = redis
                    .hset(&win_state_key(&cfg, "1m", &msg.symbol), &bar.to_state_fields(now))
                    .await;
                let _ = redis.expire(&win_state_key(&cfg, "1m", &msg.symbol), STATE_TTL_SECS).await;
            }

            if let Some(sealed) = &sealed_1m {
                let _ = redis
                    .xadd(&win_stream_key(&cfg, "1m", &msg.symbol), &sealed.to_fields(), Trim::MaxLenApprox(2_000))
                    .await;

                for tf_name in ["5m", "15m"] {
                    if let Some(tf_window) = state.tf.get_mut(tf_name) {
                        let tf_sealed = tf_window.on_sealed_1m(sealed);
                        if let Some(bar) = &tf_window.current {
                            let _ = redis
                                .hset(&win_state_key(&cfg, tf_name, &msg.symbol), &bar.to_state_fields(now))
                                .await;
                            let _ = redis.expire(&win_state_key(&cfg, tf_name, &msg.symbol), STATE_TTL_SECS).await;
                        }
                        if let Some(tf_sealed) = tf_sealed {
                            let _ = redis
                                .xadd(&win_stream_key(&cfg, tf_name, &msg.symbol), &tf_sealed.to_fields(), Trim::MaxLenApprox(2_000))
                                .await;
                        }
                    }
                }
            }

            let gate = gate_cache.get(&redis, &cfg, &msg.symbol, now).await;
            if let Some(bar) = &state.win1m.current {
                let ctx = DetectorCtx {
                    now,
                    sym: &msg.symbol,
                    win_high: bar.high,
                    win_low: bar.low,
                    win_last: bar.last,
                    win_atr: None,
                    last_prices: &state.prices.as_slice(),
                    buy_notional3s: state.flow.buy,
                    sell_notional3s: state.flow.sell,
                    min_notional3s: gate.min_notional3s,
                    breakout_band_pct: gate.breakout_band_pct,
                    dyn_abs_delta: state.dyn_abs_delta.unwrap_or(0.0),
                    dyn_delta_k: detector_static.dyn_delta_k,
                    liq_k: detector_static.liq_k,
                };

                let candidates = detect_all(&ctx);
                if !candidates.is_empty() {
                    let dyn_cfg = AggregatorDynConfig {
                        min_strength: gate.eff_min0,
                        cooldown_ms: gate.cooldown_ms,
                        dedup_ms: gate.dedup_ms,
                        min_move_bp: gate.min_move_bp,
                        min_move_atr_ratio: gate.min_move_atr_ratio,
                    };

                    if let Some(signal) = aggregator.consume(
                        now,
                        &msg.symbol,
                        candidates,
                        bar.last,
                        None,
                        bar.high,
                        bar.low,
                        state.dyn_abs_delta.unwrap_or(0.0),
                        gate.min_notional3s,
                        &static_cfg,
                        &dyn_cfg,
                    ) {
                        let _ = redis
                            .xadd(&detected_key(&cfg, &msg.symbol), &signal.to_fields(), Trim::MaxLenApprox(5_000))
                            .await;
                    }
                }
            }

            redis.ack(&msg.stream_key, groups::WINDOW, &msg.id).await;
        }
    }
}
