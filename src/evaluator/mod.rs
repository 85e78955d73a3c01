// =============================================================================
// Signal Evaluator — forward-return scoring for emitted signals
// =============================================================================
//
// Pure job bookkeeping + price resolver logic. The owning tasks
// (`worker.rs`'s intake and resolve loops) drive these types from two
// independent consumer/interval loops sharing one pending-job map behind an
// `Arc<RwLock<HashMap<...>>>`.

pub mod worker;

use crate::config::EvalConfig;
use crate::types::Dir;

/// One scheduled forward-return measurement for a single (signal, horizon)
/// pair.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub sym: String,
    pub dir: Dir,
    pub strategy_id: String,
    pub evidence_src: String,
    pub t0: i64,
    pub p0: f64,
    pub horizon_name: String,
    pub horizon_ms: i64,
    pub due_at: i64,
    pub retry_count: u32,
}

/// Round a timestamp up to the next whole-minute boundary:
/// `dueAt = ceilToNextMinute(t0 + horizonMs)`.
pub fn ceil_to_next_minute(ts: i64) -> i64 {
    let rem = ts.rem_euclid(60_000);
    if rem == 0 {
        ts
    } else {
        ts - rem + 60_000
    }
}

/// The outcome of one resolved job.
#[derive(Debug, Clone)]
pub struct EvalResult {
    pub sym: String,
    pub dir: Dir,
    pub strategy_id: String,
    pub evidence_src: String,
    pub horizon_name: String,
    pub t0: i64,
    pub p0: f64,
    pub t1: i64,
    pub p1: f64,
    pub used_px_source: String,
    /// `max(0, usedPx_ts - dueAt)`: how late the resolved price landed
    /// relative to the horizon's due time.
    pub price_lag_ms: i64,
    pub raw_bp: f64,
    pub net_bp: f64,
    pub threshold_bp: f64,
    pub neutral_band_bp: f64,
    pub success: bool,
    pub neutral: bool,
    pub miss_px: bool,
    pub retry: u32,
}

impl EvalResult {
    /// Score a resolved (p0, p1) pair against the evaluator's success/neutral
    /// bands.
    pub fn score(job: &PendingJob, t1: i64, p1: f64, used_px_source: &str, cfg: &EvalConfig) -> Self {
        let raw_bp = match job.dir {
            Dir::Buy if job.p0 != 0.0 => (p1 / job.p0 - 1.0) * 1e4,
            Dir::Sell if p1 != 0.0 => (job.p0 / p1 - 1.0) * 1e4,
            _ => 0.0,
        };
        let net_bp = raw_bp - cfg.fee_bp;
        let neutral = net_bp.abs() <= cfg.neutral_band_bp;
        let success = !neutral && net_bp >= cfg.success_bp;

        Self {
            sym: job.sym.clone(),
            dir: job.dir,
            strategy_id: job.strategy_id.clone(),
            evidence_src: job.evidence_src.clone(),
            horizon_name: job.horizon_name.clone(),
            t0: job.t0,
            p0: job.p0,
            t1,
            p1,
            used_px_source: used_px_source.to_string(),
            price_lag_ms: (t1 - job.due_at).max(0),
            raw_bp,
            net_bp,
            threshold_bp: cfg.success_bp,
            neutral_band_bp: cfg.neutral_band_bp,
            success,
            neutral,
            miss_px: false,
            retry: job.retry_count,
        }
    }

    /// Build a terminal "price never resolved" result after exhausting
    /// retries.
    pub fn miss(job: &PendingJob, now: i64, cfg: &EvalConfig) -> Self {
        Self {
            sym: job.sym.clone(),
            dir: job.dir,
            strategy_id: job.strategy_id.clone(),
            evidence_src: job.evidence_src.clone(),
            horizon_name: job.horizon_name.clone(),
            t0: job.t0,
            p0: job.p0,
            t1: now,
            p1: job.p0,
            used_px_source: String::new(),
            price_lag_ms: 0,
            raw_bp: 0.0,
            net_bp: 0.0,
            threshold_bp: cfg.success_bp,
            neutral_band_bp: cfg.neutral_band_bp,
            success: false,
            neutral: true,
            miss_px: true,
            retry: job.retry_count,
        }
    }

    pub fn to_fields(&self) -> crate::types::StreamFields {
        let mut f = crate::types::StreamFields::new();
        f.insert("sym".into(), self.sym.clone());
        f.insert("dir".into(), self.dir.to_string());
        f.insert("strategyId".into(), self.strategy_id.clone());
        f.insert("evidence.src".into(), self.evidence_src.clone());
        f.insert("horizon".into(), self.horizon_name.clone());
        f.insert("t0".into(), self.t0.to_string());
        f.insert("p0".into(), self.p0.to_string());
        f.insert("t1".into(), self.t1.to_string());
        f.insert("p1".into(), self.p1.to_string());
        f.insert("usedPx_source".into(), self.used_px_source.clone());
        f.insert("priceLagMs".into(), self.price_lag_ms.to_string());
        f.insert("rawBp".into(), self.raw_bp.to_string());
        f.insert("netBp".into(), self.net_bp.to_string());
        f.insert("thresholdBp".into(), self.threshold_bp.to_string());
        f.insert("neutralBandBp".into(), self.neutral_band_bp.to_string());
        f.insert("success".into(), if self.success { "1" } else { "0" }.to_string());
        f.insert("neutral".into(), if self.neutral { "1" } else { "0" }.to_string());
        f.insert("missPx".into(), if self.miss_px { "1" } else { "0" }.to_string());
        f.insert("retry".into(), self.retry.to_string());
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PendingJob {
        PendingJob {
            sym: "BTC-USDT-SWAP".to_string(),
            dir: Dir::Buy,
            strategy_id: "intra.v1".to_string(),
            evidence_src: "breakout".to_string(),
            t0: 0,
            p0: 100.0,
            horizon_name: "5m".to_string(),
            horizon_ms: 300_000,
            due_at: 300_000,
            retry_count: 0,
        }
    }

    #[test]
    fn ceil_to_next_minute_rounds_up() {
        assert_eq!(ceil_to_next_minute(0), 0);
        assert_eq!(ceil_to_next_minute(1), 60_000);
        assert_eq!(ceil_to_next_minute(59_999), 60_000);
        assert_eq!(ceil_to_next_minute(60_000), 60_000);
    }

    #[test]
    fn score_buy_success_on_sufficient_upward_move() {
        let cfg = EvalConfig::default();
        let j = job();
        let res = EvalResult::score(&j, 301_000, 100.1, "mid", &cfg);
        assert!(res.success);
        assert!(!res.neutral);
        assert_eq!(res.price_lag_ms, 1_000);
    }

    #[test]
    fn score_neutral_within_band() {
        let cfg = EvalConfig::default();
        let j = job();
        let res = EvalResult::score(&j, 300_000, 100.001, "mid", &cfg);
        assert!(res.neutral);
        assert!(!res.success);
    }

    #[test]
    fn score_sell_inverts_direction() {
        let cfg = EvalConfig::default();
        let mut j = job();
        j.dir = Dir::Sell;
        let res = EvalResult::score(&j, 300_000, 99.9, "last", &cfg);
        assert!(res.success);
    }

    #[test]
    fn price_lag_never_negative_when_price_precedes_due_time() {
        let cfg = EvalConfig::default();
        let j = job();
        let res = EvalResult::score(&j, 299_500, 100.0, "mid", &cfg);
        assert_eq!(res.price_lag_ms, 0);
    }

    #[test]
    fn miss_is_neutral_and_flagged() {
        let cfg = EvalConfig::default();
        let j = job();
        let res = EvalResult::miss(&j, 999_999, &cfg);
        assert!(res.miss_px);
        assert!(res.neutral);
        assert!(!res.success);
    }
}
