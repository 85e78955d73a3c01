// =============================================================================
// Aggregator — consolidates D1/D2/D3 candidates into at-most-one signal
// =============================================================================
//
// Stateful struct owned by the Window Worker task: one instance per process,
// holding per-(symbol, dir) cooldown/dedup history. No I/O — `consume()` is a
// pure state transition over in-memory maps, owned exclusively by the worker
// that drives it so no internal locking is needed.

use std::collections::HashMap;

use serde::Serialize;

use crate::detector::Candidate;
use crate::numeric::{clip01, fnv1a, round_to};
use crate::types::{DetectedSignal, Dir, Evidence};

/// Static (non-dyn-gate) aggregator tunables.
#[derive(Debug, Clone)]
pub struct AggregatorStaticConfig {
    pub symmetry_strength_eps: f64,
    pub consensus_k: f64,
    pub consensus_k_hi_vol_discount: f64,
    pub min_strength_floor: f64,
}

impl Default for AggregatorStaticConfig {
    fn default() -> Self {
        Self {
            symmetry_strength_eps: 0.05,
            consensus_k: 0.05,
            consensus_k_hi_vol_discount: 0.5,
            min_strength_floor: 0.5,
        }
    }
}

/// Dyn-gate-driven aggregator tunables, refreshed every market-env cycle;
/// the aggregator just reads the latest snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorDynConfig {
    pub min_strength: f64,
    pub cooldown_ms: i64,
    pub dedup_ms: i64,
    pub min_move_bp: f64,
    pub min_move_atr_ratio: f64,
}

impl Default for AggregatorDynConfig {
    fn default() -> Self {
        Self {
            min_strength: 0.65,
            cooldown_ms: 6_000,
            dedup_ms: 6_000,
            min_move_bp: 2.0,
            min_move_atr_ratio: 0.15,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EmitState {
    last_emit_ts: Option<i64>,
    last_emit_px: Option<f64>,
    last_sig_key: Option<String>,
}

/// Per-symbol aggregator state (cooldown/dedup history by direction).
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    state: HashMap<(String, Dir), EmitState>,
    /// Per-(symbol, dir, reason) drop counts — the in-process data a metrics
    /// exporter would read (exporting itself is out of scope); surfaced here
    /// so the cooldown/dedup/min-move invariants in spec §8 are observable.
    drops: HashMap<(String, Dir, &'static str), u64>,
}

#[derive(Serialize)]
struct CandidateFingerprint {
    dir: &'static str,
    src: &'static str,
    strength: f64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_drop(&mut self, sym: &str, dir: Dir, reason: &'static str) {
        *self.drops.entry((sym.to_string(), dir, reason)).or_insert(0) += 1;
    }

    /// Drop count for a given (symbol, dir, reason), e.g. `("BTC-USDT-SWAP",
    /// Dir::Buy, "cooldown")`. Reasons: `consensus`, `symmetry`, `cooldown`,
    /// `min_move`, `dedup`.
    pub fn drop_count(&self, sym: &str, dir: Dir, reason: &str) -> u64 {
        self.drops
            .iter()
            .find(|((s, d, r), _)| s == sym && *d == dir && *r == reason)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Run the full consolidation pipeline for one symbol's tick, given the
    /// three detectors' raw candidates.
    #[allow(clippy::too_many_arguments)]
    pub fn consume(
        &mut self,
        now: i64,
        sym: &str,
        mut candidates: Vec<Candidate>,
        win_last: f64,
        win_atr: Option<f64>,
        win_high: f64,
        win_low: f64,
        dyn_abs_delta: f64,
        min_notional3s: f64,
        static_cfg: &AggregatorStaticConfig,
        dyn_cfg: &AggregatorDynConfig,
    ) -> Option<DetectedSignal> {
        // 1. Generate / discard nulls.
        if candidates.is_empty() {
            return None;
        }

        // 2. Stable ordering: source rank desc, then dir (buy first), then
        // strength desc.
        candidates.sort_by(|a, b| {
            b.src
                .rank()
                .cmp(&a.src.rank())
                .then_with(|| dir_rank(a.dir).cmp(&dir_rank(b.dir)))
                .then(b.strength.partial_cmp(&a.strength).unwrap_or(std::cmp::Ordering::Equal))
        });

        // 3. Consensus gate. High-vol regimes discount `consensus_k` so a
        // crowded tick doesn't over-penalize strength requirements.
        let k_eff = if dyn_abs_delta > 1.5 * min_notional3s {
            static_cfg.consensus_k * static_cfg.consensus_k_hi_vol_discount
        } else {
            static_cfg.consensus_k
        };
        let survivors = consensus_filter(&candidates, static_cfg, dyn_cfg.min_strength, k_eff);
        if survivors.is_empty() {
            for dir in [Dir::Buy, Dir::Sell] {
                if candidates.iter().any(|c| c.dir == dir) {
                    self.bump_drop(sym, dir, "consensus");
                }
            }
            return None;
        }

        // 4. Symmetry gate — counted over survivors of the consensus gate,
        // not the raw candidate list.
        let buy: Vec<&Candidate> = survivors.iter().copied().filter(|c| c.dir == Dir::Buy).collect();
        let sell: Vec<&Candidate> = survivors.iter().copied().filter(|c| c.dir == Dir::Sell).collect();
        if buy.len() == sell.len() && !buy.is_empty() {
            let buy_max = buy.iter().map(|c| c.strength).fold(f64::MIN, f64::max);
            let sell_max = sell.iter().map(|c| c.strength).fold(f64::MIN, f64::max);
            if (buy_max - sell_max).abs() < static_cfg.symmetry_strength_eps {
                self.bump_drop(sym, Dir::Buy, "symmetry");
                self.bump_drop(sym, Dir::Sell, "symmetry");
                return None;
            }
        }

        // 5. Choose highest strength; ties by source rank.
        let chosen = survivors
            .iter()
            .max_by(|a, b| {
                a.strength
                    .partial_cmp(&b.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.src.rank().cmp(&b.src.rank()))
            })
            .copied()?;

        let key = (sym.to_string(), chosen.dir);
        let entry = self.state.entry(key.clone()).or_default();

        // 6. Cooldown.
        if let Some(last_ts) = entry.last_emit_ts {
            if now - last_ts < dyn_cfg.cooldown_ms {
                self.bump_drop(sym, chosen.dir, "cooldown");
                return None;
            }
        }

        // 7. Min-move.
        if let Some(prev_px) = entry.last_emit_px {
            if prev_px.is_finite() && win_last != 0.0 {
                let move_bp = (win_last - prev_px).abs() / win_last * 1e4;
                let atr = win_atr.filter(|v| v.is_finite()).unwrap_or((win_high - win_low) * 2.0 / 3.0);
                let move_atr_ratio = if atr > 0.0 { (win_last - prev_px).abs() / atr } else { 0.0 };
                if move_bp < dyn_cfg.min_move_bp || move_atr_ratio < dyn_cfg.min_move_atr_ratio {
                    self.bump_drop(sym, chosen.dir, "min_move");
                    return None;
                }
            }
        }

        // 8. Dedup.
        let approx_key = build_approx_key(sym, chosen);
        if let Some(prev_key) = &entry.last_sig_key {
            if prev_key == &approx_key {
                if let Some(last_ts) = entry.last_emit_ts {
                    if now - last_ts < dyn_cfg.dedup_ms {
                        self.bump_drop(sym, chosen.dir, "dedup");
                        return None;
                    }
                }
            }
        }

        // 9. Record state + build the signal.
        entry.last_emit_ts = Some(now);
        entry.last_emit_px = Some(win_last);
        entry.last_sig_key = Some(approx_key.clone());

        let z_like_max = survivors.iter().map(|c| c.z_like).fold(f64::MIN, f64::max);
        let buy_share_max = survivors.iter().map(|c| c.buy_share).fold(f64::MIN, f64::max);
        let candidates_hash = format!("{:08x}", fnv1a_of(&candidates));

        Some(DetectedSignal {
            ts: now,
            sym: sym.to_string(),
            dir: chosen.dir,
            strength: chosen.strength,
            evidence: Evidence {
                src: chosen.src.as_str().to_string(),
                candidates_hash: Some(candidates_hash),
                z_like_max: Some(z_like_max),
                buy_share3s_max: Some(buy_share_max),
            },
            approx_key,
            strategy_id: "intra.v1".to_string(),
            ttl_ms: dyn_cfg.cooldown_ms.max(3_000),
        })
    }
}

fn dir_rank(d: Dir) -> u8 {
    match d {
        Dir::Buy => 0,
        Dir::Sell => 1,
    }
}

fn consensus_filter<'a>(
    candidates: &'a [Candidate],
    static_cfg: &AggregatorStaticConfig,
    min_strength: f64,
    k_eff: f64,
) -> Vec<&'a Candidate> {
    let mut by_dir: HashMap<Dir, Vec<&Candidate>> = HashMap::new();
    for c in candidates {
        by_dir.entry(c.dir).or_default().push(c);
    }

    let mut out = Vec::new();
    for (_, group) in by_dir {
        let n = group.len();
        let eff_min = (min_strength - k_eff * (n as f64 - 1.0)).max(static_cfg.min_strength_floor);
        for c in group {
            if c.strength >= eff_min {
                out.push(c);
            }
        }
    }
    out
}

fn build_approx_key(sym: &str, c: &Candidate) -> String {
    format!(
        "{sym}|{dir}|{src}|{strength}|z:{z}|sh:{sh}",
        dir = c.dir,
        src = c.src.as_str(),
        strength = (c.strength * 100.0).round() as i64,
        z = round_to(c.z_like, 0.05),
        sh = round_to(clip01(c.buy_share), 0.02),
    )
}

fn fnv1a_of(candidates: &[Candidate]) -> u32 {
    let fp: Vec<CandidateFingerprint> = candidates
        .iter()
        .map(|c| CandidateFingerprint {
            dir: if c.dir == Dir::Buy { "buy" } else { "sell" },
            src: c.src.as_str(),
            strength: c.strength,
        })
        .collect();
    let json = serde_json::to_vec(&fp).unwrap_or_default();
    fnv1a(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Source;

    fn candidate(dir: Dir, src: Source, strength: f64) -> Candidate {
        Candidate { ts: 1_000, dir, strength, src, z_like: 1.0, buy_share: 0.9 }
    }

    #[test]
    fn emits_on_strong_single_candidate() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.65, ..Default::default() };
        let candidates = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        let out = agg.consume(1_000, "BTC-USDT-SWAP", candidates, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(out.is_some());
    }

    #[test]
    fn cooldown_blocks_second_emission_within_window() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.65, cooldown_ms: 6_000, ..Default::default() };

        let c1 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        let first = agg.consume(0, "BTC-USDT-SWAP", c1, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(first.is_some());

        let c2 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        let second = agg.consume(3_000, "BTC-USDT-SWAP", c2, 140.0, None, 150.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(second.is_none());
    }

    #[test]
    fn cooldown_releases_after_full_window() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.65, cooldown_ms: 6_000, min_move_bp: 0.0, min_move_atr_ratio: 0.0, ..Default::default() };

        let c1 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        agg.consume(0, "BTC-USDT-SWAP", c1, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);

        let c2 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        let second = agg.consume(6_001, "BTC-USDT-SWAP", c2, 140.0, None, 150.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(second.is_some());
    }

    #[test]
    fn symmetry_gate_suppresses_balanced_opposite_candidates() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.5, ..Default::default() };
        let candidates = vec![
            candidate(Dir::Buy, Source::Flow, 0.7),
            candidate(Dir::Sell, Source::Flow, 0.71),
        ];
        let out = agg.consume(0, "BTC-USDT-SWAP", candidates, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(out.is_none());
    }

    #[test]
    fn min_move_blocks_insufficient_price_change() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.5, cooldown_ms: 0, min_move_bp: 50.0, min_move_atr_ratio: 5.0, ..Default::default() };

        let c1 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        agg.consume(0, "BTC-USDT-SWAP", c1, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);

        let c2 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        let second = agg.consume(100, "BTC-USDT-SWAP", c2, 100.01, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(second.is_none());
    }

    #[test]
    fn cooldown_drop_is_counted_per_symbol_and_dir() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.65, cooldown_ms: 6_000, ..Default::default() };

        let c1 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        agg.consume(0, "BTC-USDT-SWAP", c1, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert_eq!(agg.drop_count("BTC-USDT-SWAP", Dir::Buy, "cooldown"), 0);

        let c2 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        agg.consume(3_000, "BTC-USDT-SWAP", c2, 140.0, None, 150.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert_eq!(agg.drop_count("BTC-USDT-SWAP", Dir::Buy, "cooldown"), 1);
        assert_eq!(agg.drop_count("BTC-USDT-SWAP", Dir::Sell, "cooldown"), 0);
    }

    #[test]
    fn symmetry_drop_is_counted_for_both_directions() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.5, ..Default::default() };
        let candidates = vec![
            candidate(Dir::Buy, Source::Flow, 0.7),
            candidate(Dir::Sell, Source::Flow, 0.71),
        ];
        agg.consume(0, "BTC-USDT-SWAP", candidates, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert_eq!(agg.drop_count("BTC-USDT-SWAP", Dir::Buy, "symmetry"), 1);
        assert_eq!(agg.drop_count("BTC-USDT-SWAP", Dir::Sell, "symmetry"), 1);
    }

    #[test]
    fn independent_symbols_do_not_share_cooldown_state() {
        let mut agg = Aggregator::new();
        let static_cfg = AggregatorStaticConfig::default();
        let dyn_cfg = AggregatorDynConfig { min_strength: 0.65, ..Default::default() };

        let c1 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        agg.consume(0, "BTC-USDT-SWAP", c1, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);

        let c2 = vec![candidate(Dir::Buy, Source::Breakout, 0.9)];
        let out = agg.consume(0, "ETH-USDT-SWAP", c2, 100.0, None, 110.0, 90.0, 500.0, 2_000.0, &static_cfg, &dyn_cfg);
        assert!(out.is_some());
    }
}
