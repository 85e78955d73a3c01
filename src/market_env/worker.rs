// =============================================================================
// Market-Env Updater task — 10s cycle over kline/OI/funding/rate history
// =============================================================================
//
// One task per process, looping on a fixed interval rather than a stream
// read: the dyn-gate only needs to move as fast as the slowest input
// (kline5m/kline15m), so polling avoids keeping five consumer groups alive
// per symbol just to watch for new bars.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::config::AppConfig;
use crate::market_env::{
    downsample_last_per_minute, funding_event_flag, liq_pct, oi_raw_regime, rate_excess, vol_pct,
    DynGate, KlineSample, OiRegimeState, OiSample, DEFAULT_MIN_NOTIONAL3S_BASE,
};
use crate::redis_stream::{RedisStreams, Trim};
use crate::types::{FundingFrame, KlineFrame, OiFrame};

const CYCLE_MS: u64 = 10_000;
const KLINE_LOOKBACK: usize = 48;
const OI_LOOKBACK: usize = 120;
const RATE_RECENT_MS: i64 = 60_000;
const RATE_BASE_MS: i64 = 900_000;

fn kline_key(cfg: &AppConfig, tf: &str, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:kline{tf}"))
}

fn oi_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:oi"))
}

fn funding_state_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("state:funding:{{{sym}}}"))
}

fn detected_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("signal:detected:{{{sym}}}"))
}

fn gate_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("dyn:gate:{{{sym}}}"))
}

fn gate_log_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("dyn:gate:log:{{{sym}}}"))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

async fn load_klines(redis: &RedisStreams, key: &str) -> Vec<KlineSample> {
    match redis.xrevrange_latest(key, KLINE_LOOKBACK).await {
        Ok(rows) => rows
            .into_iter()
            .filter_map(|(_, fields)| KlineFrame::decode(&fields).ok())
            .map(|k| KlineSample { high: k.high, low: k.low, close: k.close, vol: k.vol, vol_ccy_quote: k.vol_ccy_quote })
            .collect(),
        Err(e) => {
            warn!(key, error = %e, "market-env: failed to load klines");
            Vec::new()
        }
    }
}

async fn load_oi_series(redis: &RedisStreams, key: &str) -> Vec<OiSample> {
    match redis.xrevrange_latest(key, OI_LOOKBACK).await {
        Ok(rows) => {
            let raw: Vec<OiSample> = rows
                .into_iter()
                .filter_map(|(_, fields)| OiFrame::decode(&fields).ok())
                .map(|oi| OiSample { ts: oi.ts, value: oi.preferred() })
                .collect();
            downsample_last_per_minute(&raw)
        }
        Err(e) => {
            warn!(key, error = %e, "market-env: failed to load open interest");
            Vec::new()
        }
    }
}

/// Funding lookahead is read from the `state:funding:{sym}` Hash (kept
/// current by the upstream ingress), not the raw `ws:{sym}:funding` stream.
async fn load_funding(redis: &RedisStreams, key: &str) -> Option<FundingFrame> {
    let fields = redis.hgetall(key).await.ok()?;
    if fields.is_empty() {
        return None;
    }
    FundingFrame::decode(&fields).ok()
}

async fn compute_rate_excess(redis: &RedisStreams, key: &str, now: i64) -> f64 {
    let recent = redis.xrange_by_time(key, now - RATE_RECENT_MS, now, None).await.map(|v| v.len() as i64).unwrap_or(0);
    let base = redis.xrange_by_time(key, now - RATE_BASE_MS, now, None).await.map(|v| v.len() as i64).unwrap_or(0);
    rate_excess(recent, RATE_RECENT_MS, base, RATE_BASE_MS)
}

async fn cycle_symbol(redis: &RedisStreams, cfg: &AppConfig, sym: &str, oi_state: &mut OiRegimeState, now: i64) {
    let samples5 = load_klines(redis, &kline_key(cfg, "5m", sym)).await;
    let samples15 = load_klines(redis, &kline_key(cfg, "15m", sym)).await;
    let vp = vol_pct(&samples5, &samples15);
    let lp = liq_pct(&samples5, &samples15);

    let oi_series = load_oi_series(redis, &oi_key(cfg, sym)).await;
    // A regime reading is only trusted in a liquid, non-quiet market; below
    // either floor it's forced to neutral, which also resets the
    // persistence filter (any raw=0 resets).
    let raw_regime = if vp < 0.4 || lp < 0.4 { 0 } else { oi_raw_regime(&oi_series) };
    let regime = oi_state.update(raw_regime, now);

    let funding = load_funding(redis, &funding_state_key(cfg, sym)).await;
    let event_flag = funding_event_flag(funding.as_ref().and_then(|f| f.next_funding_time), now);

    let rate_exc = compute_rate_excess(redis, &detected_key(cfg, sym), now).await;

    let gate = DynGate::compute(vp, lp, rate_exc, event_flag, regime, DEFAULT_MIN_NOTIONAL3S_BASE, now);

    if let Err(e) = redis.hset(&gate_key(cfg, sym), &gate.to_fields()).await {
        warn!(sym, error = %e, "market-env: failed to write dyn gate");
        return;
    }

    let _ = redis.xadd(&gate_log_key(cfg, sym), &gate.to_fields(), Trim::MaxLenApprox(2_000)).await;
}

/// Run the Market-Env Updater until `running` is cleared.
pub async fn run(redis: RedisStreams, cfg: Arc<AppConfig>, running: Arc<AtomicBool>) {
    let mut oi_states: HashMap<String, OiRegimeState> = cfg.symbols.iter().map(|s| (s.clone(), OiRegimeState::default())).collect();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(CYCLE_MS));

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let now = now_ms();
        for sym in &cfg.symbols {
            let state = oi_states.entry(sym.clone()).or_default();
            cycle_symbol(&redis, &cfg, sym, state, now).await;
        }
    }
}
