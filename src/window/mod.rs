// =============================================================================
// Window Worker — trade stream → closed 1m/5m/15m bars + 3s notional flow
// =============================================================================
//
// Pure state and transition logic for the Window Worker. The owning task
// (`worker.rs`) drives these types from a Redis consumer-group read;
// everything here is plain data + functions so the sealing/roll-up rules can
// be unit tested without touching Redis.

pub mod worker;

use std::collections::VecDeque;

use crate::types::{Dir, StreamFields};

/// Length of the bounded price-history ring fed to the breakout detector.
pub const PRICE_HISTORY_LEN: usize = 50;
/// Width of the sliding notional-flow window.
pub const FLOW3S_WINDOW_MS: i64 = 3_000;
/// EWMA smoothing factor for `dynAbsDelta`.
pub const DYN_ABS_DELTA_ALPHA: f64 = 0.01;

/// One bar's OHLCV + VWAP accumulators, shared shape for both the in-flight
/// 1m bucket and any rolled-up 5m/15m bucket.
#[derive(Debug, Clone)]
pub struct Bar {
    pub start_ts: i64,
    pub close_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub vol: f64,
    pub vbuy: f64,
    pub vsell: f64,
    pub vwap_num: f64,
    pub vwap_den: f64,
    pub tick_n: u64,
}

impl Bar {
    /// Start a new bar seeded from the first tick of the bucket.
    pub fn open_at(start_ts: i64, close_ts: i64, px: f64) -> Self {
        Self {
            start_ts,
            close_ts,
            open: px,
            high: px,
            low: px,
            last: px,
            vol: 0.0,
            vbuy: 0.0,
            vsell: 0.0,
            vwap_num: 0.0,
            vwap_den: 0.0,
            tick_n: 0,
        }
    }

    /// Apply one trade to this bar.
    pub fn apply_trade(&mut self, px: f64, qty: f64, side: Dir) {
        self.last = px;
        if px > self.high {
            self.high = px;
        }
        if px < self.low {
            self.low = px;
        }
        if qty.is_finite() {
            self.vol += qty;
            match side {
                Dir::Buy => self.vbuy += qty,
                Dir::Sell => self.vsell += qty,
            }
            self.vwap_num += px * qty;
            self.vwap_den += qty;
        }
        self.tick_n += 1;
    }

    /// VWAP falls back to `last` when no volume has traded.
    pub fn vwap(&self) -> f64 {
        if self.vwap_den > 0.0 {
            self.vwap_num / self.vwap_den
        } else {
            self.last
        }
    }

    /// Average true range approximation used when a real ATR series is
    /// unavailable: `2/3*(high-low)`.
    pub fn atr_approx(&self) -> f64 {
        (self.high - self.low) * 2.0 / 3.0
    }

    /// Field map for the in-progress `win:state:{tf}:{sym}` Hash: every
    /// accumulator field plus `updatedTs`.
    pub fn to_state_fields(&self, updated_ts: i64) -> StreamFields {
        let mut f = StreamFields::new();
        f.insert("open".into(), self.open.to_string());
        f.insert("high".into(), self.high.to_string());
        f.insert("low".into(), self.low.to_string());
        f.insert("last".into(), self.last.to_string());
        f.insert("vol".into(), self.vol.to_string());
        f.insert("vbuy".into(), self.vbuy.to_string());
        f.insert("vsell".into(), self.vsell.to_string());
        f.insert("vwapNum".into(), self.vwap_num.to_string());
        f.insert("vwapDen".into(), self.vwap_den.to_string());
        f.insert("tickN".into(), self.tick_n.to_string());
        f.insert("updatedTs".into(), updated_ts.to_string());
        f
    }
}

/// A sealed bar, plus the `gap` flag recording whether the prior bucket was
/// skipped entirely: `gap=1` iff `closeTs-prevCloseTs>period`.
#[derive(Debug, Clone)]
pub struct SealedBar {
    pub bar: Bar,
    pub gap: bool,
}

impl SealedBar {
    pub fn vwap(&self) -> f64 {
        self.bar.vwap()
    }

    /// Field map for a `win:1m:{sym}` / `win:{tf}:{sym}` stream row.
    pub fn to_fields(&self) -> StreamFields {
        let mut f = StreamFields::new();
        f.insert("ts".into(), self.bar.close_ts.to_string());
        f.insert("open".into(), self.bar.open.to_string());
        f.insert("high".into(), self.bar.high.to_string());
        f.insert("low".into(), self.bar.low.to_string());
        f.insert("close".into(), self.bar.last.to_string());
        f.insert("vol".into(), self.bar.vol.to_string());
        f.insert("vbuy".into(), self.bar.vbuy.to_string());
        f.insert("vsell".into(), self.bar.vsell.to_string());
        f.insert("vwap".into(), self.vwap().to_string());
        f.insert("tickN".into(), self.bar.tick_n.to_string());
        f.insert("gap".into(), if self.gap { "1" } else { "0" }.to_string());
        f
    }
}

/// Trade accumulator + rollup state for one symbol's 1m bucket.
#[derive(Debug, Clone)]
pub struct Win1m {
    pub current: Option<Bar>,
    pub prev_close_ts: Option<i64>,
}

impl Default for Win1m {
    fn default() -> Self {
        Self { current: None, prev_close_ts: None }
    }
}

/// Floor `ts` to the close of the minute bucket that contains it.
pub fn bucket_close_ts(ts: i64) -> i64 {
    (ts.div_euclid(60_000)) * 60_000 + 60_000
}

impl Win1m {
    /// Apply one trade, sealing the previous bucket if `ts` falls into a new
    /// one. Returns the sealed bar when a seal occurred.
    pub fn on_trade(&mut self, ts: i64, px: f64, qty: f64, side: Dir) -> Option<SealedBar> {
        let close_ts = bucket_close_ts(ts);
        let mut sealed = None;

        let needs_new_bucket = match &self.current {
            Some(bar) => bar.close_ts != close_ts,
            None => true,
        };

        if needs_new_bucket {
            if let Some(old) = self.current.take() {
                let gap = close_ts - old.close_ts > 60_000;
                self.prev_close_ts = Some(old.close_ts);
                sealed = Some(SealedBar { bar: old, gap });
            }
            let start_ts = close_ts - 60_000;
            self.current = Some(Bar::open_at(start_ts, close_ts, px));
        }

        if let Some(bar) = self.current.as_mut() {
            bar.apply_trade(px, qty, side);
        }

        sealed
    }
}

/// Higher-timeframe (5m/15m) rollup bucket, accumulated from sealed 1m bars.
#[derive(Debug, Clone)]
pub struct TfWindow {
    pub tf_ms: i64,
    pub current: Option<Bar>,
    pub prev_close_ts: Option<i64>,
}

impl TfWindow {
    pub fn new(tf_ms: i64) -> Self {
        Self { tf_ms, current: None, prev_close_ts: None }
    }

    fn tf_close_for(&self, m1_close_ts: i64) -> i64 {
        ((m1_close_ts - 1).div_euclid(self.tf_ms)) * self.tf_ms + self.tf_ms
    }

    /// Fold a sealed 1m bar into this higher timeframe. Returns a sealed TF
    /// bar if the running TF bucket closed in the process.
    pub fn on_sealed_1m(&mut self, m1: &SealedBar) -> Option<SealedBar> {
        let tf_close = self.tf_close_for(m1.bar.close_ts);
        let mut sealed = None;

        let needs_new_bucket = match &self.current {
            Some(bar) => bar.close_ts != tf_close,
            None => true,
        };

        if needs_new_bucket {
            if let Some(old) = self.current.take() {
                let gap = tf_close - old.close_ts > self.tf_ms;
                self.prev_close_ts = Some(old.close_ts);
                sealed = Some(SealedBar { bar: old, gap });
            }
            let start_ts = tf_close - self.tf_ms;
            self.current = Some(Bar::open_at(start_ts, tf_close, m1.bar.open));
        }

        if let Some(bar) = self.current.as_mut() {
            bar.last = m1.bar.last;
            if m1.bar.high > bar.high {
                bar.high = m1.bar.high;
            }
            if m1.bar.low < bar.low {
                bar.low = m1.bar.low;
            }
            bar.vol += m1.bar.vol;
            bar.vbuy += m1.bar.vbuy;
            bar.vsell += m1.bar.vsell;
            bar.tick_n += m1.bar.tick_n;
            bar.vwap_num += m1.bar.vwap_num;
            bar.vwap_den += m1.bar.vwap_den;
        }

        sealed
    }
}

/// One entry in the 3-second notional-flow ring.
#[derive(Debug, Clone, Copy)]
struct FlowEntry {
    ts: i64,
    buy: f64,
    sell: f64,
}

/// 3-second sliding sum of buy/sell notional, per symbol.
#[derive(Debug, Clone, Default)]
pub struct Flow3s {
    buf: VecDeque<FlowEntry>,
    pub buy: f64,
    pub sell: f64,
    pub max_ts: i64,
}

impl Flow3s {
    /// Push one trade's notional, evicting anything older than 3s relative to
    /// the highest timestamp ever seen. Trades that arrive already stale
    /// relative to `max_ts` are dropped under a strict late-arrival policy —
    /// they are never inserted.
    pub fn push(&mut self, ts: i64, px: f64, qty: f64, side: Dir, contract_multiplier: f64) {
        self.max_ts = self.max_ts.max(ts);
        if ts < self.max_ts - FLOW3S_WINDOW_MS {
            return;
        }

        let notional = qty * px * contract_multiplier;
        let (buy, sell) = match side {
            Dir::Buy => (notional, 0.0),
            Dir::Sell => (0.0, notional),
        };
        self.buy += buy;
        self.sell += sell;
        self.buf.push_back(FlowEntry { ts, buy, sell });

        while let Some(front) = self.buf.front() {
            if front.ts < self.max_ts - FLOW3S_WINDOW_MS {
                let front = self.buf.pop_front().unwrap();
                self.buy -= front.buy;
                self.sell -= front.sell;
            } else {
                break;
            }
        }
    }

    pub fn span_ms(&self) -> i64 {
        match (self.buf.front(), self.buf.back()) {
            (Some(a), Some(b)) => b.ts - a.ts,
            _ => 0,
        }
    }
}

/// Bounded ring of recent trade prices, used by the breakout detector's
/// slope calculation.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    buf: VecDeque<f64>,
}

impl PriceHistory {
    pub fn push(&mut self, px: f64) {
        self.buf.push_back(px);
        while self.buf.len() > PRICE_HISTORY_LEN {
            self.buf.pop_front();
        }
    }

    pub fn as_slice(&self) -> Vec<f64> {
        self.buf.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_close_ts_floors_to_next_minute_boundary() {
        assert_eq!(bucket_close_ts(59_500), 60_000);
        assert_eq!(bucket_close_ts(60_000), 120_000);
        assert_eq!(bucket_close_ts(60_500), 120_000);
    }

    #[test]
    fn bar_sealing_and_vwap_scenario() {
        let mut win = Win1m::default();
        assert!(win.on_trade(59_500, 100.0, 1.0, Dir::Buy).is_none());
        assert!(win.on_trade(59_800, 105.0, 2.0, Dir::Sell).is_none());
        let sealed = win.on_trade(60_500, 107.0, 1.0, Dir::Buy).unwrap();

        assert_eq!(sealed.bar.close_ts, 60_000);
        assert_eq!(sealed.bar.open, 100.0);
        assert_eq!(sealed.bar.high, 105.0);
        assert_eq!(sealed.bar.low, 100.0);
        assert_eq!(sealed.bar.last, 105.0);
        assert_eq!(sealed.bar.vol, 3.0);
        assert_eq!(sealed.bar.vbuy, 1.0);
        assert_eq!(sealed.bar.vsell, 2.0);
        assert_eq!(sealed.bar.tick_n, 2);
        assert!(!sealed.gap);
        assert!((sealed.vwap() - 103.333_333_333).abs() < 1e-6);

        let cur = win.current.as_ref().unwrap();
        assert_eq!(cur.open, 107.0);
        assert_eq!(cur.high, 107.0);
        assert_eq!(cur.low, 107.0);
        assert_eq!(cur.last, 107.0);
        assert_eq!(cur.tick_n, 1);
    }

    #[test]
    fn bar_closedness_invariant_holds_for_mixed_ticks() {
        let mut win = Win1m::default();
        win.on_trade(1_000, 100.0, 1.0, Dir::Buy);
        win.on_trade(2_000, 90.0, 1.0, Dir::Sell);
        let sealed = win.on_trade(61_000, 95.0, 1.0, Dir::Buy).unwrap();
        assert!(sealed.bar.high >= sealed.bar.open);
        assert!(sealed.bar.high >= sealed.bar.last);
        assert!(sealed.bar.low <= sealed.bar.open);
        assert!(sealed.bar.low <= sealed.bar.last);
    }

    #[test]
    fn gap_flag_set_when_bucket_skipped() {
        let mut win = Win1m::default();
        win.on_trade(1_000, 100.0, 1.0, Dir::Buy);
        // Skip straight to the bucket after next (closeTs jumps by >60000).
        let sealed = win.on_trade(130_000, 101.0, 1.0, Dir::Buy).unwrap();
        assert!(sealed.gap);
    }

    #[test]
    fn vwap_falls_back_to_last_when_no_volume() {
        let mut win = Win1m::default();
        win.on_trade(1_000, 100.0, 0.0, Dir::Buy);
        let sealed = win.on_trade(61_000, 105.0, 0.0, Dir::Buy).unwrap();
        assert_eq!(sealed.vwap(), sealed.bar.last);
    }

    #[test]
    fn rollup_conservation_over_five_one_minute_bars() {
        let mut tf = TfWindow::new(300_000);
        let mut last_sealed = None;
        for i in 0..5 {
            let start = i * 60_000;
            let bar = Bar {
                start_ts: start,
                close_ts: start + 60_000,
                open: 100.0 + i as f64,
                high: 110.0 + i as f64,
                low: 90.0 - i as f64,
                last: 101.0 + i as f64,
                vol: 10.0,
                vbuy: 6.0,
                vsell: 4.0,
                vwap_num: 1000.0,
                vwap_den: 10.0,
                tick_n: 3,
            };
            let sealed_1m = SealedBar { bar, gap: false };
            last_sealed = tf.on_sealed_1m(&sealed_1m).or(last_sealed);
        }
        // None of the 5 bars crossed a 5m boundary yet (all within [0,300000)).
        assert!(last_sealed.is_none());
        let cur = tf.current.as_ref().unwrap();
        assert_eq!(cur.vol, 50.0);
        assert_eq!(cur.open, 100.0);
        assert_eq!(cur.last, 105.0);
        assert_eq!(cur.high, 114.0);
        assert_eq!(cur.low, 86.0);
        assert_eq!(cur.tick_n, 15);
    }

    #[test]
    fn flow3s_windowing_invariant() {
        let mut flow = Flow3s::default();
        flow.push(1_000, 100.0, 1.0, Dir::Buy, 1.0);
        flow.push(2_000, 100.0, 1.0, Dir::Sell, 1.0);
        flow.push(4_500, 100.0, 1.0, Dir::Buy, 1.0);
        // 1_000 is now older than max_ts(4500)-3000=1500, so it should've
        // been evicted; 2_000 is within the window.
        assert!(flow.span_ms() <= 3_000);
        assert_eq!(flow.buy, 100.0);
        assert_eq!(flow.sell, 100.0);
    }

    #[test]
    fn flow3s_drops_late_arrivals_without_inserting() {
        let mut flow = Flow3s::default();
        flow.push(10_000, 100.0, 1.0, Dir::Buy, 1.0);
        flow.push(1_000, 100.0, 5.0, Dir::Sell, 1.0); // older than max_ts-3000
        assert_eq!(flow.sell, 0.0);
        assert_eq!(flow.buy, 100.0);
    }

    #[test]
    fn flow3s_single_insertion_per_trade() {
        // Guards against accidental double-counting: one push() call must
        // add notional exactly once.
        let mut flow = Flow3s::default();
        flow.push(1_000, 50.0, 2.0, Dir::Buy, 1.0);
        assert_eq!(flow.buy, 100.0);
        assert_eq!(flow.buf.len(), 1);
    }

    #[test]
    fn price_history_bounded_at_50() {
        let mut hist = PriceHistory::default();
        for i in 0..60 {
            hist.push(i as f64);
        }
        assert_eq!(hist.as_slice().len(), PRICE_HISTORY_LEN);
        assert_eq!(hist.as_slice()[0], 10.0);
    }
}
