// =============================================================================
// Signal Evaluator tasks — intake loop, resolve loop, price resolver
// =============================================================================
//
// Two cooperative tasks share one pending-job table behind a `parking_lot`
// lock: the intake loop only ever inserts, the resolve loop only ever
// removes, so contention is brief and one-directional.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::{groups, AppConfig};
use crate::evaluator::{ceil_to_next_minute, EvalResult, PendingJob};
use crate::redis_stream::{GroupStart, RedisStreams, Trim};
use crate::types::{BookFrame, KlineFrame, TradeEvent};

const READ_COUNT: usize = 200;
const READ_BLOCK_MS: u64 = 200;
const RESOLVE_TICK_MS: u64 = 1_000;
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIM_MIN_IDLE: Duration = Duration::from_secs(30);

type JobKey = (String, i64, String);
type JobTable = Arc<RwLock<HashMap<JobKey, PendingJob>>>;

fn final_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("signal:final:{{{sym}}}"))
}

fn done_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("eval:done:{{{sym}}}"))
}

fn book_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:book"))
}

fn trades_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:trades"))
}

fn win1m_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("win:1m:{{{sym}}}"))
}

fn kline1m_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("ws:{{{sym}}}:kline1m"))
}

fn bf_kline1m_key(cfg: &AppConfig, sym: &str) -> String {
    cfg.key(format!("bf:{{{sym}}}:kline1m"))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One candidate reading from a price source, before distance-to-target
/// ranking.
struct PriceHit {
    px: f64,
    ts: i64,
}

async fn closest_in_window(rows: Vec<(String, crate::types::StreamFields)>, target: i64, window_ms: i64, extract: impl Fn(&crate::types::StreamFields) -> Option<(f64, i64)>) -> Option<PriceHit> {
    rows.iter()
        .filter_map(|(_, fields)| extract(fields))
        .filter(|(_, ts)| (ts - target).abs() <= window_ms)
        .min_by_key(|(_, ts)| (ts - target).abs())
        .map(|(px, ts)| PriceHit { px, ts })
}

/// Search every configured price source, in preference order, for the
/// reading closest to `target_ts` within `±window_ms`.
async fn resolve_price_at(redis: &RedisStreams, cfg: &AppConfig, sym: &str, target_ts: i64, window_ms: i64) -> Option<(f64, i64, String)> {
    for source in &cfg.eval.price_pref {
        let hit = match source.as_str() {
            "mid" => {
                let rows = redis.xrange_by_time(&book_key(cfg, sym), target_ts - window_ms, target_ts + window_ms, None).await.ok()?;
                closest_in_window(rows, target_ts, window_ms, |f| BookFrame::decode(f).ok().and_then(|b| b.mid().map(|m| (m, b.ts)))).await
            }
            "last" => {
                let rows = redis.xrange_by_time(&trades_key(cfg, sym), target_ts - window_ms, target_ts + window_ms, None).await.ok()?;
                closest_in_window(rows, target_ts, window_ms, |f| TradeEvent::decode(f).ok().map(|t| (t.px, t.ts))).await
            }
            "win:1m" => {
                let rows = redis.xrange_by_time(&win1m_key(cfg, sym), target_ts - window_ms, target_ts + window_ms, None).await.ok()?;
                closest_in_window(rows, target_ts, window_ms, |f| {
                    let close = f.get("close")?.parse::<f64>().ok()?;
                    let ts = f.get("ts")?.parse::<i64>().ok()?;
                    Some((close, ts))
                })
                .await
            }
            "ws:kline1m" => {
                let rows = redis.xrange_by_time(&kline1m_key(cfg, sym), target_ts - window_ms, target_ts + window_ms, None).await.ok()?;
                closest_in_window(rows, target_ts, window_ms, |f| KlineFrame::decode(f).ok().map(|k| (k.close, k.ts))).await
            }
            "bf:kline1m" => {
                let rows = redis.xrange_by_time(&bf_kline1m_key(cfg, sym), target_ts - window_ms, target_ts + window_ms, None).await.ok()?;
                closest_in_window(rows, target_ts, window_ms, |f| KlineFrame::decode(f).ok().map(|k| (k.close, k.ts))).await
            }
            other => {
                debug!(source = other, "evaluator: unknown price source in EVAL_PRICE_PREF, skipping");
                None
            }
        };

        if let Some(hit) = hit {
            return Some((hit.px, hit.ts, source.clone()));
        }
    }
    None
}

/// Intake loop: consumes `signal:final:{sym}`, resolves `p0`, and schedules
/// one `PendingJob` per configured horizon.
pub async fn run_intake(redis: RedisStreams, cfg: Arc<AppConfig>, running: Arc<AtomicBool>, jobs: JobTable) {
    if cfg.symbols.is_empty() {
        warn!("evaluator intake: empty symbol list, stopping");
        return;
    }

    let keys: Vec<String> = cfg.symbols.iter().map(|s| final_key(&cfg, s)).collect();
    for key in &keys {
        if let Err(e) = redis.ensure_group(key, groups::SIGNAL_EVAL, GroupStart::New).await {
            warn!(key, error = %e, "evaluator intake: failed to ensure consumer group, stopping");
            return;
        }
    }

    let consumer = format!("eval-intake#{}", std::process::id());
    let mut last_reclaim = tokio::time::Instant::now();

    while running.load(Ordering::Relaxed) {
        let batch = redis
            .read_group(&keys, groups::SIGNAL_EVAL, &consumer, READ_COUNT, Duration::from_millis(READ_BLOCK_MS))
            .await;
        let mut entries = batch.unwrap_or_default();

        if last_reclaim.elapsed() >= RECLAIM_INTERVAL {
            last_reclaim = tokio::time::Instant::now();
            for key in &keys {
                match redis.xautoclaim(key, groups::SIGNAL_EVAL, &consumer, RECLAIM_MIN_IDLE).await {
                    Ok(reclaimed) => {
                        for (id, fields) in reclaimed {
                            entries.push(crate::redis_stream::StreamEntry { stream_key: key.clone(), id, fields });
                        }
                    }
                    Err(e) => warn!(key, error = %e, "evaluator intake: xautoclaim failed"),
                }
            }
        }

        if entries.is_empty() {
            continue;
        }

        let now = now_ms();
        let normalized = redis.normalize_batch(&entries, now);

        for msg in normalized {
            let final_fields = msg.fields.clone();
            let signal = match crate::types::DetectedSignal::decode(&final_fields, &msg.symbol) {
                Ok(s) => s,
                Err(e) => {
                    debug!(symbol = %msg.symbol, error = %e, "evaluator intake: dropping malformed final signal (ack+skip)");
                    redis.ack(&msg.stream_key, groups::SIGNAL_EVAL, &msg.id).await;
                    continue;
                }
            };

            let ref_px = final_fields.get("refPx").and_then(|v| v.parse::<f64>().ok()).filter(|px| *px > 0.0);
            let ref_px_stale = final_fields.get("refPx_stale").map(|v| v == "true").unwrap_or(true);
            let ref_px_ts = final_fields.get("refPx_ts").and_then(|v| v.parse::<i64>().ok());
            let ref_px_usable = ref_px.filter(|_| {
                !ref_px_stale && ref_px_ts.map(|ts| (ts - signal.ts).abs() <= cfg.eval.px_search_ms).unwrap_or(false)
            });
            let p0 = match ref_px_usable {
                Some(px) => px,
                None => match resolve_price_at(&redis, &cfg, &msg.symbol, signal.ts, cfg.eval.px_search_ms).await {
                    Some((px, _, _)) => px,
                    None => {
                        debug!(symbol = %msg.symbol, "evaluator intake: no p0 resolvable, dropping job scheduling");
                        redis.ack(&msg.stream_key, groups::SIGNAL_EVAL, &msg.id).await;
                        continue;
                    }
                },
            };

            for horizon in &cfg.eval.horizons {
                let due_at = ceil_to_next_minute(signal.ts + horizon.ms);
                let job = PendingJob {
                    sym: msg.symbol.clone(),
                    dir: signal.dir,
                    strategy_id: signal.strategy_id.clone(),
                    evidence_src: signal.evidence.src.clone(),
                    t0: signal.ts,
                    p0,
                    horizon_name: horizon.name.to_string(),
                    horizon_ms: horizon.ms,
                    due_at,
                    retry_count: 0,
                };
                let key: JobKey = (msg.symbol.clone(), signal.ts, horizon.name.to_string());
                jobs.write().insert(key, job);
            }

            redis.ack(&msg.stream_key, groups::SIGNAL_EVAL, &msg.id).await;
        }
    }
}

/// Resolve loop: every second, resolves `p1` for any job whose `dueAt` has
/// passed, scores it, and appends `eval:done:{sym}`.
pub async fn run_resolve(redis: RedisStreams, cfg: Arc<AppConfig>, running: Arc<AtomicBool>, jobs: JobTable) {
    let mut ticker = tokio::time::interval(Duration::from_millis(RESOLVE_TICK_MS));

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let now = now_ms();

        let due: Vec<(JobKey, PendingJob)> = jobs
            .read()
            .iter()
            .filter(|(_, job)| job.due_at <= now)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, job) in due {
            match resolve_price_at(&redis, &cfg, &job.sym, job.due_at, cfg.eval.px_search_ms).await {
                Some((p1, t1, source)) => {
                    let result = EvalResult::score(&job, t1, p1, &source, &cfg.eval);
                    if let Err(e) = redis.xadd(&done_key(&cfg, &job.sym), &result.to_fields(), Trim::MaxLenApprox(5_000)).await {
                        warn!(sym = %job.sym, error = %e, "evaluator resolve: failed to publish eval result");
                    }
                    jobs.write().remove(&key);
                }
                None => {
                    let mut retry = job.clone();
                    retry.retry_count += 1;
                    if retry.retry_count > cfg.eval.max_retry {
                        let result = EvalResult::miss(&retry, now, &cfg.eval);
                        let _ = redis.xadd(&done_key(&cfg, &retry.sym), &result.to_fields(), Trim::MaxLenApprox(5_000)).await;
                        jobs.write().remove(&key);
                    } else {
                        jobs.write().insert(key, retry);
                    }
                }
            }
        }
    }
}
