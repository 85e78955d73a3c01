// =============================================================================
// Intra-bar Detectors — D1 Aggressive Flow, D2 Delta Z-like, D3 Breakout
// =============================================================================
//
// Three pure functions on a shared context: no I/O, fully unit-testable with
// synthetic contexts. Aggregation across the three candidates lives in
// `crate::aggregator`.

use crate::numeric::{clip01, sign};
use crate::types::Dir;

/// Detector-level tunables that are not part of the dyn-gate Hash: `dynDeltaK`
/// and `liqK` ride along on `DetectorCtx` but the gate mapping never
/// recomputes them, so they stay static per-process constants instead.
#[derive(Debug, Clone, Copy)]
pub struct DetectorStaticConfig {
    pub dyn_delta_k: f64,
    pub liq_k: f64,
}

impl Default for DetectorStaticConfig {
    fn default() -> Self {
        Self { dyn_delta_k: 1.5, liq_k: 1.0 }
    }
}

/// Read-only snapshot of everything a detector needs for one symbol at one
/// tick.
pub struct DetectorCtx<'a> {
    pub now: i64,
    pub sym: &'a str,
    /// Live (in-flight) 1m bar high/low/last, used by the breakout detector.
    pub win_high: f64,
    pub win_low: f64,
    pub win_last: f64,
    pub win_atr: Option<f64>,
    pub last_prices: &'a [f64],
    pub buy_notional3s: f64,
    pub sell_notional3s: f64,
    pub min_notional3s: f64,
    pub breakout_band_pct: f64,
    pub dyn_abs_delta: f64,
    pub dyn_delta_k: f64,
    pub liq_k: f64,
}

/// Evidence tag naming which detector produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Flow,
    Delta,
    Breakout,
}

impl Source {
    /// Stable rank used by the aggregator's deterministic ordering:
    /// `breakout=3 > delta=2 > flow=1`.
    pub fn rank(self) -> u8 {
        match self {
            Source::Breakout => 3,
            Source::Delta => 2,
            Source::Flow => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Flow => "flow",
            Source::Delta => "delta",
            Source::Breakout => "breakout",
        }
    }
}

/// One detector's raw output before aggregation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub ts: i64,
    pub dir: Dir,
    pub strength: f64,
    pub src: Source,
    /// z-like statistic, used by the aggregator's dedup `approxKey` and
    /// surfaced as `evidence.zLike_max`.
    pub z_like: f64,
    /// `buyShare` at generation time, surfaced as `evidence.buyShare3s_max`
    /// (flow detector only meaningfully sets this; others default to 0.5).
    pub buy_share: f64,
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// D1 — Aggressive Flow: fires when one side of the 3s notional window
/// dominates the other by a wide share.
pub fn detect_flow(ctx: &DetectorCtx) -> Option<Candidate> {
    let buy = ctx.buy_notional3s;
    let sell = ctx.sell_notional3s;
    let sum = buy + sell;
    let liq_th = ctx.min_notional3s.max(ctx.liq_k * ctx.dyn_abs_delta);
    if sum <= liq_th {
        return None;
    }

    let buy_share = if sum > 0.0 { buy / sum } else { 0.5 };

    let dir = if buy_share >= 0.8 {
        Dir::Buy
    } else if buy_share <= 0.2 {
        Dir::Sell
    } else {
        return None;
    };

    let share_strength = match dir {
        Dir::Buy => clip01((buy_share - 0.75) / 0.25),
        Dir::Sell => clip01((0.25 - buy_share) / 0.25),
    };

    let denom = 3.0 * ctx.min_notional3s.max(ctx.dyn_abs_delta);
    let signif = if denom > 0.0 { clip01((buy - sell).abs() / denom) } else { 0.0 };

    let strength = clip01(0.6 * share_strength + 0.4 * signif);

    Some(Candidate {
        ts: ctx.now,
        dir,
        strength: round3(strength),
        src: Source::Flow,
        z_like: signif,
        buy_share,
    })
}

/// D2 — Delta Z-like: fires when the buy/sell notional imbalance clears a
/// dynamically scaled threshold.
pub fn detect_delta(ctx: &DetectorCtx) -> Option<Candidate> {
    let buy = ctx.buy_notional3s;
    let sell = ctx.sell_notional3s;
    let sum = buy + sell;

    let sum_floor = (0.5 * ctx.min_notional3s).max(0.5 * ctx.liq_k * ctx.dyn_abs_delta);
    if sum < sum_floor {
        return None;
    }

    let dyn_th = ctx.min_notional3s.max(ctx.dyn_abs_delta * ctx.dyn_delta_k);
    let delta = buy - sell;
    if delta.abs() <= dyn_th {
        return None;
    }

    let strength = if dyn_th > 0.0 {
        clip01(delta.abs() / (4.0 * dyn_th))
    } else {
        0.0
    };
    let dir = if sign(delta) >= 0.0 { Dir::Buy } else { Dir::Sell };
    let buy_share = if sum > 0.0 { buy / sum } else { 0.5 };

    Some(Candidate {
        ts: ctx.now,
        dir,
        strength: round3(strength),
        src: Source::Delta,
        z_like: if dyn_th > 0.0 { delta.abs() / dyn_th } else { 0.0 },
        buy_share,
    })
}

/// D3 — Breakout: fires when price clears the live bar's high/low band by a
/// margin, confirmed by price slope or recent volume.
pub fn detect_breakout(ctx: &DetectorCtx) -> Option<Candidate> {
    if ctx.last_prices.len() < 3 {
        return None;
    }

    let band = ctx.win_high - ctx.win_low;
    if band <= 0.0 {
        return None;
    }
    let pct = ctx.breakout_band_pct.clamp(0.0, 0.2);
    let eps = band * pct;

    let n = ctx.last_prices.len();
    let slope = (ctx.last_prices[n - 1] - ctx.last_prices[0]) / (n as f64 - 1.0);
    let sum3s = ctx.buy_notional3s + ctx.sell_notional3s;
    let vol_confirm = sum3s >= 0.5 * ctx.dyn_abs_delta;

    let last = ctx.win_last;

    if last >= ctx.win_high + eps && (slope > 0.0 || vol_confirm) {
        let dist = (last - (ctx.win_high + eps)) / band;
        let strength = clip01(0.55 + (2.0 * dist).min(0.35) + if slope > 0.0 { 0.1 } else { 0.0 });
        return Some(Candidate {
            ts: ctx.now,
            dir: Dir::Buy,
            strength: round3(strength),
            src: Source::Breakout,
            z_like: dist,
            buy_share: 0.5,
        });
    }

    if last <= ctx.win_low - eps && (slope < 0.0 || vol_confirm) {
        let dist = ((ctx.win_low - eps) - last) / band;
        let strength = clip01(0.55 + (2.0 * dist).min(0.35) + if slope < 0.0 { 0.1 } else { 0.0 });
        return Some(Candidate {
            ts: ctx.now,
            dir: Dir::Sell,
            strength: round3(strength),
            src: Source::Breakout,
            z_like: dist,
            buy_share: 0.5,
        });
    }

    None
}

/// Run all three detectors and collect whatever candidates survive.
pub fn detect_all(ctx: &DetectorCtx) -> Vec<Candidate> {
    [detect_flow(ctx), detect_delta(ctx), detect_breakout(ctx)]
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx() -> DetectorCtx<'static> {
        DetectorCtx {
            now: 1_000,
            sym: "BTC-USDT-SWAP",
            win_high: 110.0,
            win_low: 90.0,
            win_last: 100.0,
            win_atr: None,
            last_prices: &[],
            buy_notional3s: 0.0,
            sell_notional3s: 0.0,
            min_notional3s: 2_000.0,
            breakout_band_pct: 0.02,
            dyn_abs_delta: 1_000.0,
            dyn_delta_k: 1.5,
            liq_k: 1.0,
        }
    }

    #[test]
    fn flow_detector_none_below_liquidity_threshold() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 100.0;
        ctx.sell_notional3s = 50.0;
        assert!(detect_flow(&ctx).is_none());
    }

    #[test]
    fn flow_detector_buy_above_share_threshold() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 9_000.0;
        ctx.sell_notional3s = 1_000.0;
        let c = detect_flow(&ctx).unwrap();
        assert_eq!(c.dir, Dir::Buy);
        assert!(c.strength > 0.0 && c.strength <= 1.0);
    }

    #[test]
    fn flow_detector_sell_below_share_threshold() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 1_000.0;
        ctx.sell_notional3s = 9_000.0;
        let c = detect_flow(&ctx).unwrap();
        assert_eq!(c.dir, Dir::Sell);
    }

    #[test]
    fn flow_detector_none_in_balanced_middle() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 5_500.0;
        ctx.sell_notional3s = 4_500.0;
        assert!(detect_flow(&ctx).is_none());
    }

    #[test]
    fn delta_detector_requires_minimum_sum() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 100.0;
        ctx.sell_notional3s = 0.0;
        assert!(detect_delta(&ctx).is_none());
    }

    #[test]
    fn delta_detector_fires_on_large_imbalance() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 10_000.0;
        ctx.sell_notional3s = 1_000.0;
        let c = detect_delta(&ctx).unwrap();
        assert_eq!(c.dir, Dir::Buy);
    }

    #[test]
    fn delta_detector_none_under_dyn_threshold() {
        let mut ctx = base_ctx();
        ctx.buy_notional3s = 2_100.0;
        ctx.sell_notional3s = 2_000.0;
        assert!(detect_delta(&ctx).is_none());
    }

    #[test]
    fn breakout_requires_three_price_history_points() {
        let mut ctx = base_ctx();
        ctx.last_prices = &[100.0, 101.0];
        ctx.win_last = 120.0;
        assert!(detect_breakout(&ctx).is_none());
    }

    #[test]
    fn breakout_fires_upward_with_positive_slope() {
        let mut ctx = base_ctx();
        ctx.last_prices = &[95.0, 100.0, 112.0];
        ctx.win_last = 112.5;
        let c = detect_breakout(&ctx).unwrap();
        assert_eq!(c.dir, Dir::Buy);
    }

    #[test]
    fn breakout_fires_downward_with_negative_slope() {
        let mut ctx = base_ctx();
        ctx.last_prices = &[105.0, 100.0, 88.0];
        ctx.win_last = 87.0;
        let c = detect_breakout(&ctx).unwrap();
        assert_eq!(c.dir, Dir::Sell);
    }

    #[test]
    fn breakout_none_inside_band() {
        let mut ctx = base_ctx();
        ctx.last_prices = &[99.0, 100.0, 101.0];
        ctx.win_last = 105.0;
        assert!(detect_breakout(&ctx).is_none());
    }

    #[test]
    fn source_rank_orders_breakout_highest() {
        assert!(Source::Breakout.rank() > Source::Delta.rank());
        assert!(Source::Delta.rank() > Source::Flow.rank());
    }

    #[test]
    fn detect_all_collects_only_firing_detectors() {
        let ctx = base_ctx();
        assert!(detect_all(&ctx).is_empty());
    }
}
