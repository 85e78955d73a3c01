// =============================================================================
// Market-Env Updater — volatility/liquidity percentiles, OI regime, dyn-gate
// =============================================================================
//
// Pure computation, driven by the owning task (`worker.rs`), which reads
// kline/OI/funding/signal-rate history from Redis every 10s per symbol.
// Everything here takes plain slices and returns plain values so the
// percentile/regime/mapping math is unit-testable without touching Redis.

pub mod worker;

use std::collections::HashMap;

use crate::numeric::{clip, clip01, mad, median, percentile_rank_last, round3, round4};
use crate::types::StreamFields;

/// One kline sample used for TR-volatility + liquidity percentile ranking.
#[derive(Debug, Clone, Copy)]
pub struct KlineSample {
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub vol_ccy_quote: Option<f64>,
}

/// True range (Wilder decomposition) normalized to basis points of close,
/// one value per bar after the first (needs a previous close).
fn tr_bp_series(samples: &[KlineSample]) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len().saturating_sub(1));
    for i in 1..samples.len() {
        let prev_close = samples[i - 1].close;
        let hl = samples[i].high - samples[i].low;
        let hc = (samples[i].high - prev_close).abs();
        let lc = (samples[i].low - prev_close).abs();
        let tr = hl.max(hc).max(lc);
        if samples[i].close > 0.0 {
            out.push(tr / samples[i].close * 1e4);
        }
    }
    out
}

fn liquidity_series(samples: &[KlineSample]) -> Vec<f64> {
    samples
        .iter()
        .map(|s| s.vol_ccy_quote.unwrap_or(s.vol * s.close))
        .collect()
}

/// `volPct = clip01(max(vol5.pct, vol15.pct))`.
pub fn vol_pct(samples5: &[KlineSample], samples15: &[KlineSample]) -> f64 {
    let p5 = percentile_rank_last(&tr_bp_series(samples5));
    let p15 = percentile_rank_last(&tr_bp_series(samples15));
    clip01(p5.max(p15))
}

/// `liqPct = clip01(max(liq5.pct, liq15.pct))`.
pub fn liq_pct(samples5: &[KlineSample], samples15: &[KlineSample]) -> f64 {
    let p5 = percentile_rank_last(&liquidity_series(samples5));
    let p15 = percentile_rank_last(&liquidity_series(samples15));
    clip01(p5.max(p15))
}

/// One open-interest reading at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct OiSample {
    pub ts: i64,
    pub value: f64,
}

/// Downsample to "last sample per minute bucket".
pub fn downsample_last_per_minute(samples: &[OiSample]) -> Vec<OiSample> {
    let mut by_bucket: HashMap<i64, OiSample> = HashMap::new();
    for &s in samples {
        let bucket = s.ts.div_euclid(60_000);
        by_bucket
            .entry(bucket)
            .and_modify(|existing| {
                if s.ts >= existing.ts {
                    *existing = s;
                }
            })
            .or_insert(s);
    }
    let mut out: Vec<OiSample> = by_bucket.into_values().collect();
    out.sort_by_key(|s| s.ts);
    out
}

/// Raw OI regime classification in `{-1, 0, +1}`, before the persistence
/// filter.
pub fn oi_raw_regime(series: &[OiSample]) -> i8 {
    if series.len() < 4 {
        return 0;
    }
    let last_ts = series.last().unwrap().ts;
    let window_a: Vec<f64> = series
        .iter()
        .filter(|s| s.ts > last_ts - 15 * 60_000)
        .map(|s| s.value)
        .collect();
    let window_b: Vec<f64> = series
        .iter()
        .filter(|s| s.ts <= last_ts - 15 * 60_000 && s.ts > last_ts - 30 * 60_000)
        .map(|s| s.value)
        .collect();
    if window_a.is_empty() || window_b.is_empty() {
        return 0;
    }

    let mean_a = window_a.iter().sum::<f64>() / window_a.len() as f64;
    let mean_b = window_b.iter().sum::<f64>() / window_b.len() as f64;
    let values: Vec<f64> = series.iter().map(|s| s.value).collect();
    let med = median(&values);
    let pct = (mean_a - mean_b) / med.max(1.0);

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.is_empty() {
        return 0;
    }
    let diff_med = median(&diffs);
    let diff_mad = mad(&diffs, diff_med);
    let last_diff = *diffs.last().unwrap();
    let z_like = last_diff / (1.4826 * diff_mad + 1e-9);

    if pct >= 0.012 && z_like >= 2.0 {
        1
    } else if pct <= -0.012 && z_like <= -2.0 {
        -1
    } else {
        0
    }
}

/// 10-minute persistence filter for the OI regime: a raw regime must hold
/// its sign for >= this long before it surfaces.
pub const OI_REGIME_PERSIST_MS: i64 = 10 * 60_000;

/// Per-symbol wall-clock tracker for the OI regime persistence filter.
#[derive(Debug, Clone, Default)]
pub struct OiRegimeState {
    sign: i8,
    since_ts: i64,
    surfaced: i8,
}

impl OiRegimeState {
    /// Feed one raw regime reading; returns the surfaced (persistence
    /// filtered) regime.
    pub fn update(&mut self, raw: i8, now_ms: i64) -> i8 {
        if raw == 0 {
            self.sign = 0;
            self.since_ts = now_ms;
            self.surfaced = 0;
            return 0;
        }

        if raw != self.sign {
            self.sign = raw;
            self.since_ts = now_ms;
            self.surfaced = 0;
            return 0;
        }

        if now_ms - self.since_ts >= OI_REGIME_PERSIST_MS {
            self.surfaced = raw;
        }
        self.surfaced
    }
}

/// `eventFlag=1` iff funding is due within the next 10 minutes.
pub fn funding_event_flag(next_funding_time: Option<i64>, now_ms: i64) -> bool {
    match next_funding_time {
        Some(t) => {
            let delta = t - now_ms;
            (0..=10 * 60_000).contains(&delta)
        }
        None => false,
    }
}

/// Signal-rate excess over baseline: rates are per second;
/// `rateExc = max(0, recent_rate/base_rate - 1)`, or `1` when the baseline
/// is ~zero but recent activity exists.
pub fn rate_excess(recent_count: i64, recent_window_ms: i64, base_count: i64, base_window_ms: i64) -> f64 {
    let recent_rate = recent_count as f64 / (recent_window_ms as f64 / 1000.0);
    let base_rate = base_count as f64 / (base_window_ms as f64 / 1000.0);
    if base_rate < 1e-9 {
        return if recent_count > 0 { 1.0 } else { 0.0 };
    }
    (recent_rate / base_rate - 1.0).max(0.0)
}

/// The full dyn-gate snapshot written to `dyn:gate:{sym}` and read back by
/// the detector, router, and evaluator.
#[derive(Debug, Clone, Copy)]
pub struct DynGate {
    pub eff_min0: f64,
    pub min_notional3s: f64,
    pub min_move_bp: f64,
    pub min_move_atr_ratio: f64,
    pub cooldown_ms: i64,
    pub dedup_ms: i64,
    pub breakout_band_pct: f64,
    pub vol_pct: f64,
    pub liq_pct: f64,
    pub rate_exc: f64,
    pub event_flag: bool,
    pub oi_regime: i8,
    pub updated_at: i64,
}

/// Gate defaults, used when a symbol has no market-env cycle yet.
pub const DEFAULT_MIN_NOTIONAL3S_BASE: f64 = 2_000.0;

impl DynGate {
    /// Map the market-regime readings to gate parameters ("v1.1" mapping).
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        vol_pct: f64,
        liq_pct: f64,
        rate_exc: f64,
        event_flag: bool,
        oi_regime: i8,
        base_notional: f64,
        now_ms: i64,
    ) -> Self {
        let base_min = 0.65;
        let eff_min0 = clip(
            base_min
                + 0.05 * if vol_pct > 0.8 { 1.0 } else { 0.0 }
                + 0.05 * rate_exc.min(1.0)
                + 0.08 * if event_flag { 1.0 } else { 0.0 }
                + 0.02 * if oi_regime != 0 { 1.0 } else { 0.0 },
            0.6,
            0.78,
        );

        let min_notional3s = (base_notional * (0.9 + 0.35 * liq_pct)).round().max(base_notional);
        let min_move_bp = (2.0 + 4.0 * vol_pct).round();
        let min_move_atr_ratio = round3(0.15 + 0.2 * vol_pct);
        let cooldown_ms = (6_000.0 * (1.0 + 0.6 * rate_exc.min(1.0) + 0.6 * if event_flag { 1.0 } else { 0.0 })).round() as i64;
        let breakout_band_pct = round4((0.02 * (1.0 + 0.5 * vol_pct)).min(0.05));

        Self {
            eff_min0,
            min_notional3s,
            min_move_bp,
            min_move_atr_ratio,
            cooldown_ms,
            // No explicit dedupMs formula is given; tying it to cooldownMs
            // keeps dedup at least as sticky as the cooldown it complements
            // (see DESIGN.md open-question log).
            dedup_ms: cooldown_ms,
            breakout_band_pct,
            vol_pct,
            liq_pct,
            rate_exc,
            event_flag,
            oi_regime,
            updated_at: now_ms,
        }
    }

    pub fn to_fields(&self) -> StreamFields {
        let mut f = StreamFields::new();
        f.insert("effMin0".into(), self.eff_min0.to_string());
        f.insert("minNotional3s".into(), self.min_notional3s.to_string());
        f.insert("minMoveBp".into(), self.min_move_bp.to_string());
        f.insert("minMoveAtrRatio".into(), self.min_move_atr_ratio.to_string());
        f.insert("cooldownMs".into(), self.cooldown_ms.to_string());
        f.insert("dedupMs".into(), self.dedup_ms.to_string());
        f.insert("breakoutBandPct".into(), self.breakout_band_pct.to_string());
        f.insert("volPct".into(), self.vol_pct.to_string());
        f.insert("liqPct".into(), self.liq_pct.to_string());
        f.insert("rateExc".into(), self.rate_exc.to_string());
        f.insert("eventFlag".into(), if self.event_flag { "1" } else { "0" }.to_string());
        f.insert("oiRegime".into(), self.oi_regime.to_string());
        f.insert("updated_at".into(), self.updated_at.to_string());
        f.insert("version".into(), "v1.1".to_string());
        f
    }

    pub fn from_fields(f: &StreamFields) -> Option<Self> {
        let get = |k: &str| f.get(k).and_then(|v| v.parse::<f64>().ok());
        Some(Self {
            eff_min0: get("effMin0")?,
            min_notional3s: get("minNotional3s")?,
            min_move_bp: get("minMoveBp")?,
            min_move_atr_ratio: get("minMoveAtrRatio")?,
            cooldown_ms: get("cooldownMs")? as i64,
            dedup_ms: get("dedupMs").unwrap_or_else(|| get("cooldownMs").unwrap_or(6_000.0)) as i64,
            breakout_band_pct: get("breakoutBandPct").unwrap_or(0.02),
            vol_pct: get("volPct").unwrap_or(0.0),
            liq_pct: get("liqPct").unwrap_or(0.0),
            rate_exc: get("rateExc").unwrap_or(0.0),
            event_flag: f.get("eventFlag").map(|v| v == "1").unwrap_or(false),
            oi_regime: f.get("oiRegime").and_then(|v| v.parse::<i8>().ok()).unwrap_or(0),
            updated_at: get("updated_at").unwrap_or(0.0) as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(h: f64, l: f64, c: f64, vol: f64) -> KlineSample {
        KlineSample { high: h, low: l, close: c, vol, vol_ccy_quote: None }
    }

    #[test]
    fn vol_pct_of_flat_series_is_bounded() {
        let series: Vec<KlineSample> = (0..10).map(|_| sample(101.0, 99.0, 100.0, 10.0)).collect();
        let v = vol_pct(&series, &series);
        assert!((0.0..=1.0).contains(&v));
    }

    #[test]
    fn vol_pct_highest_when_last_bar_is_most_volatile() {
        let mut series: Vec<KlineSample> = (0..10).map(|_| sample(101.0, 99.0, 100.0, 10.0)).collect();
        series.push(sample(130.0, 70.0, 100.0, 10.0));
        let v = vol_pct(&series, &series);
        assert_eq!(v, 1.0);
    }

    #[test]
    fn downsample_keeps_latest_sample_per_minute() {
        let samples = vec![
            OiSample { ts: 1_000, value: 10.0 },
            OiSample { ts: 50_000, value: 20.0 },
            OiSample { ts: 61_000, value: 30.0 },
        ];
        let out = downsample_last_per_minute(&samples);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, 20.0);
        assert_eq!(out[1].value, 30.0);
    }

    #[test]
    fn oi_raw_regime_detects_sustained_rise() {
        let mut series = Vec::new();
        for i in 0..30 {
            series.push(OiSample { ts: i * 60_000, value: 1000.0 });
        }
        for i in 30..45 {
            series.push(OiSample { ts: i * 60_000, value: 1000.0 + (i - 29) as f64 * 50.0 });
        }
        let raw = oi_raw_regime(&series);
        assert_eq!(raw, 1);
    }

    #[test]
    fn oi_raw_regime_neutral_on_flat_series() {
        let series: Vec<OiSample> = (0..45).map(|i| OiSample { ts: i * 60_000, value: 1000.0 }).collect();
        assert_eq!(oi_raw_regime(&series), 0);
    }

    #[test]
    fn oi_regime_persistence_requires_ten_minutes() {
        let mut state = OiRegimeState::default();
        assert_eq!(state.update(1, 0), 0);
        assert_eq!(state.update(1, 5 * 60_000), 0);
        assert_eq!(state.update(1, 10 * 60_000), 1);
    }

    #[test]
    fn oi_regime_direction_change_resets_persistence() {
        let mut state = OiRegimeState::default();
        state.update(1, 0);
        assert_eq!(state.update(1, 10 * 60_000), 1);
        assert_eq!(state.update(-1, 10 * 60_000 + 1), 0);
        assert_eq!(state.update(-1, 20 * 60_000 + 2), 1);
    }

    #[test]
    fn oi_regime_raw_zero_resets_immediately() {
        let mut state = OiRegimeState::default();
        state.update(1, 0);
        assert_eq!(state.update(1, 10 * 60_000), 1);
        assert_eq!(state.update(0, 10 * 60_000 + 1), 0);
    }

    #[test]
    fn funding_event_flag_within_window() {
        assert!(funding_event_flag(Some(1_000_000 + 5 * 60_000), 1_000_000));
        assert!(!funding_event_flag(Some(1_000_000 + 20 * 60_000), 1_000_000));
        assert!(!funding_event_flag(None, 1_000_000));
    }

    #[test]
    fn rate_excess_zero_when_equal_rates() {
        assert_eq!(rate_excess(1, 60_000, 15, 900_000), 0.0);
    }

    #[test]
    fn rate_excess_one_when_base_is_zero_but_recent_fires() {
        assert_eq!(rate_excess(3, 60_000, 0, 900_000), 1.0);
    }

    #[test]
    fn rate_excess_zero_when_both_zero() {
        assert_eq!(rate_excess(0, 60_000, 0, 900_000), 0.0);
    }

    #[test]
    fn dyn_gate_mapping_respects_documented_bounds() {
        let gate = DynGate::compute(0.9, 0.5, 0.2, true, 1, 2_000.0, 1_000);
        assert!(gate.eff_min0 >= 0.6 && gate.eff_min0 <= 0.78);
        assert!(gate.min_notional3s >= 2_000.0);
        assert!(gate.breakout_band_pct <= 0.05);
    }

    #[test]
    fn dyn_gate_roundtrips_through_fields() {
        let gate = DynGate::compute(0.3, 0.4, 0.1, false, 0, 2_000.0, 5_000);
        let fields = gate.to_fields();
        let back = DynGate::from_fields(&fields).unwrap();
        assert_eq!(back.updated_at, 5_000);
        assert!((back.eff_min0 - gate.eff_min0).abs() < 1e-9);
    }
}
