// =============================================================================
// Wire types — typed decodes of the Redis Stream field maps
// =============================================================================
//
// Every inbound/outbound stream row travels as a flat `{field: string}` map
// (Redis Streams have no native nested types). Each entity here decodes from
// that map via a `decode` associated function attached to the type it
// produces.
//
// Price and quantity fields parse to `f64` here for arithmetic convenience;
// exactness-sensitive accumulation (Window Worker VWAP sums) uses the same
// `f64` representation throughout, since monetary precision only matters
// where comparisons are made against other decimal-strings on the wire, not
// in percentile/ratio math.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// The flattened `{field: value}` Redis Stream field map for one message.
pub type StreamFields = HashMap<String, String>;

fn field<'a>(fields: &'a StreamFields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(|s| s.as_str())
        .with_context(|| format!("missing field {name}"))
}

fn field_opt<'a>(fields: &'a StreamFields, name: &str) -> Option<&'a str> {
    fields.get(name).map(|s| s.as_str())
}

fn parse_f64(fields: &StreamFields, name: &str) -> Result<f64> {
    let raw = field(fields, name)?;
    let v: f64 = raw
        .parse()
        .with_context(|| format!("failed to parse {name} as f64: {raw}"))?;
    if !v.is_finite() {
        bail!("field {name} is not finite: {raw}");
    }
    Ok(v)
}

fn parse_f64_opt(fields: &StreamFields, name: &str) -> Option<f64> {
    field_opt(fields, name).and_then(|s| s.parse::<f64>().ok()).filter(|v| v.is_finite())
}

fn parse_i64(fields: &StreamFields, name: &str) -> Result<i64> {
    let raw = field(fields, name)?;
    raw.parse::<i64>()
        .with_context(|| format!("failed to parse {name} as i64: {raw}"))
}

fn parse_i64_opt(fields: &StreamFields, name: &str) -> Option<i64> {
    field_opt(fields, name).and_then(|s| s.parse::<i64>().ok())
}

fn parse_bool_flag(fields: &StreamFields, name: &str) -> bool {
    matches!(field_opt(fields, name), Some("1") | Some("true"))
}

/// Trade side / signal direction. Both wire vocabularies are `buy`/`sell`;
/// kept as one type since the distinction (trade side vs. signal direction)
/// is purely contextual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dir {
    Buy,
    Sell,
}

impl std::fmt::Display for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Dir {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => bail!("invalid dir: {other}"),
        }
    }
}

impl Dir {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

// ---------------------------------------------------------------------------
// Trade event — ws:{sym}:trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub ts: i64,
    pub px: f64,
    pub qty: f64,
    pub side: Dir,
    pub trade_id: Option<String>,
    pub taker: Option<bool>,
    pub recv_ts: Option<i64>,
    pub ingest_id: Option<String>,
}

impl TradeEvent {
    /// Decode a raw stream row into a trade event.
    ///
    /// Returns `Err` for malformed rows (missing/non-numeric `ts`, `px`,
    /// `qty`, or `side`) — callers must classify this as `drop:bad_row`
    /// and must not ack (see window/worker.rs).
    pub fn decode(fields: &StreamFields) -> Result<Self> {
        let ts = parse_i64(fields, "ts")?;
        let px = parse_f64(fields, "px")?;
        if px <= 0.0 {
            bail!("px must be > 0, got {px}");
        }
        let qty = parse_f64(fields, "qty")?;
        if qty < 0.0 {
            bail!("qty must be >= 0, got {qty}");
        }
        let side: Dir = field(fields, "side")?.parse()?;

        Ok(Self {
            ts,
            px,
            qty,
            side,
            trade_id: field_opt(fields, "tradeId").map(str::to_string),
            taker: field_opt(fields, "taker").map(|v| v == "1" || v == "true"),
            recv_ts: parse_i64_opt(fields, "recvTs"),
            ingest_id: field_opt(fields, "ingestId").map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// Book frame — ws:{sym}:book
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BookFrame {
    pub ts: i64,
    pub bid1_px: f64,
    pub bid1_sz: f64,
    pub ask1_px: f64,
    pub ask1_sz: f64,
    pub bid_sz10: Option<f64>,
    pub ask_sz10: Option<f64>,
    pub spread: Option<f64>,
    pub snapshot: bool,
    pub action: Option<String>,
}

impl BookFrame {
    pub fn decode(fields: &StreamFields) -> Result<Self> {
        Ok(Self {
            ts: parse_i64(fields, "ts")?,
            bid1_px: parse_f64(fields, "bid1.px")?,
            bid1_sz: parse_f64(fields, "bid1.sz")?,
            ask1_px: parse_f64(fields, "ask1.px")?,
            ask1_sz: parse_f64(fields, "ask1.sz")?,
            bid_sz10: parse_f64_opt(fields, "bidSz10"),
            ask_sz10: parse_f64_opt(fields, "askSz10"),
            spread: parse_f64_opt(fields, "spread"),
            snapshot: parse_bool_flag(fields, "snapshot"),
            action: field_opt(fields, "action").map(str::to_string),
        })
    }

    /// Mid price, only defined when both sides of the top-of-book are valid.
    pub fn mid(&self) -> Option<f64> {
        if self.bid1_px > 0.0 && self.ask1_px > 0.0 {
            Some((self.bid1_px + self.ask1_px) / 2.0)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Kline frame — ws:{sym}:kline{tf}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KlineFrame {
    pub ts: i64,
    pub tf: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub vol_ccy_quote: Option<f64>,
    pub confirm: bool,
}

impl KlineFrame {
    /// Decode a kline row. Accepts both the long (`close`) and short (`c`)
    /// OHLC field spellings.
    pub fn decode(fields: &StreamFields) -> Result<Self> {
        let get = |long: &str, short: &str| -> Result<f64> {
            let raw = field_opt(fields, long)
                .or_else(|| field_opt(fields, short))
                .with_context(|| format!("missing field {long}/{short}"))?;
            raw.parse::<f64>()
                .with_context(|| format!("failed to parse {long}/{short} as f64: {raw}"))
        };

        Ok(Self {
            ts: parse_i64(fields, "ts")?,
            tf: field_opt(fields, "tf")
                .or_else(|| field_opt(fields, "_tf"))
                .unwrap_or("")
                .to_string(),
            open: get("open", "o")?,
            high: get("high", "h")?,
            low: get("low", "l")?,
            close: get("close", "c")?,
            vol: get("vol", "v")?,
            vol_ccy_quote: parse_f64_opt(fields, "volCcyQuote"),
            confirm: parse_bool_flag(fields, "confirm"),
        })
    }
}

// ---------------------------------------------------------------------------
// Open interest / funding frames — ws:{sym}:oi, ws:{sym}:funding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OiFrame {
    pub ts: i64,
    pub oi: f64,
    pub oi_ccy: Option<f64>,
}

impl OiFrame {
    pub fn decode(fields: &StreamFields) -> Result<Self> {
        Ok(Self {
            ts: parse_i64(fields, "ts")?,
            oi: parse_f64(fields, "oi")?,
            oi_ccy: parse_f64_opt(fields, "oiCcy"),
        })
    }

    /// Preferred OI reading: `oiCcy` over `oi`.
    pub fn preferred(&self) -> f64 {
        self.oi_ccy.unwrap_or(self.oi)
    }
}

#[derive(Debug, Clone)]
pub struct FundingFrame {
    pub ts: i64,
    pub rate: f64,
    pub next_funding_time: Option<i64>,
}

impl FundingFrame {
    pub fn decode(fields: &StreamFields) -> Result<Self> {
        Ok(Self {
            ts: parse_i64(fields, "ts")?,
            rate: parse_f64(fields, "rate")?,
            next_funding_time: parse_i64_opt(fields, "nextFundingTime"),
        })
    }
}

// ---------------------------------------------------------------------------
// Detected signal — signal:detected:{sym}
// ---------------------------------------------------------------------------

/// Evidence captured alongside a detected/final signal. Serialized as
/// individual `evidence.*` stream fields rather than a nested JSON blob, to
/// keep every field greppable in `XRANGE` output (the convention already
/// used for `bid1.px` / `ask1.px`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    pub src: String,
    pub candidates_hash: Option<String>,
    pub z_like_max: Option<f64>,
    pub buy_share3s_max: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DetectedSignal {
    pub ts: i64,
    pub sym: String,
    pub dir: Dir,
    pub strength: f64,
    pub evidence: Evidence,
    pub approx_key: String,
    pub strategy_id: String,
    pub ttl_ms: i64,
}

impl DetectedSignal {
    pub fn to_fields(&self) -> StreamFields {
        let mut out = StreamFields::new();
        out.insert("ts".into(), self.ts.to_string());
        out.insert("sym".into(), self.sym.clone());
        out.insert("dir".into(), self.dir.to_string());
        out.insert("strength".into(), format!("{:.3}", self.strength));
        out.insert("evidence.src".into(), self.evidence.src.clone());
        if let Some(h) = &self.evidence.candidates_hash {
            out.insert("evidence.candidates_hash".into(), h.clone());
        }
        if let Some(z) = self.evidence.z_like_max {
            out.insert("evidence.zLike_max".into(), z.to_string());
        }
        if let Some(b) = self.evidence.buy_share3s_max {
            out.insert("evidence.buyShare3s_max".into(), b.to_string());
        }
        out.insert("approx_key".into(), self.approx_key.clone());
        out.insert("strategyId".into(), self.strategy_id.clone());
        out.insert("ttlMs".into(), self.ttl_ms.to_string());
        out.insert("kind".into(), "intra".into());
        out
    }

    pub fn decode(fields: &StreamFields, sym: &str) -> Result<Self> {
        let ts = parse_i64(fields, "ts")?;
        let dir: Dir = field(fields, "dir")?.parse()?;
        let strength = parse_f64(fields, "strength")?;
        let approx_key = field_opt(fields, "approx_key").unwrap_or("").to_string();
        let strategy_id = field_opt(fields, "strategyId")
            .unwrap_or("intra.v1")
            .to_string();
        let ttl_ms = parse_i64_opt(fields, "ttlMs").unwrap_or(3_000);
        let evidence = Evidence {
            src: field_opt(fields, "evidence.src").unwrap_or("unknown").to_string(),
            candidates_hash: field_opt(fields, "evidence.candidates_hash").map(str::to_string),
            z_like_max: parse_f64_opt(fields, "evidence.zLike_max"),
            buy_share3s_max: parse_f64_opt(fields, "evidence.buyShare3s_max"),
        };

        Ok(Self {
            ts,
            sym: sym.to_string(),
            dir,
            strength,
            evidence,
            approx_key,
            strategy_id,
            ttl_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Final signal — signal:final:{sym}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefPxSource {
    Mid,
    Last,
}

impl std::fmt::Display for RefPxSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mid => write!(f, "mid"),
            Self::Last => write!(f, "last"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinalSignal {
    pub detected: DetectedSignal,
    pub ref_px: Option<f64>,
    pub ref_px_source: Option<RefPxSource>,
    pub ref_px_ts: Option<i64>,
    pub ref_px_stale: bool,
}

impl FinalSignal {
    pub fn to_fields(&self) -> StreamFields {
        let mut out = self.detected.to_fields();
        if let Some(px) = self.ref_px {
            out.insert("refPx".into(), px.to_string());
        }
        if let Some(src) = self.ref_px_source {
            out.insert("refPx_source".into(), src.to_string());
        }
        if let Some(ts) = self.ref_px_ts {
            out.insert("refPx_ts".into(), ts.to_string());
        }
        out.insert("refPx_stale".into(), self.ref_px_stale.to_string());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> StreamFields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn trade_event_decodes_valid_row() {
        let f = fields(&[("ts", "1000"), ("px", "100.5"), ("qty", "2"), ("side", "buy")]);
        let t = TradeEvent::decode(&f).unwrap();
        assert_eq!(t.ts, 1000);
        assert_eq!(t.px, 100.5);
        assert_eq!(t.qty, 2.0);
        assert_eq!(t.side, Dir::Buy);
    }

    #[test]
    fn trade_event_rejects_non_positive_price() {
        let f = fields(&[("ts", "1000"), ("px", "0"), ("qty", "2"), ("side", "buy")]);
        assert!(TradeEvent::decode(&f).is_err());
    }

    #[test]
    fn trade_event_rejects_missing_side() {
        let f = fields(&[("ts", "1000"), ("px", "1"), ("qty", "2")]);
        assert!(TradeEvent::decode(&f).is_err());
    }

    #[test]
    fn trade_event_rejects_nan_qty() {
        let f = fields(&[("ts", "1000"), ("px", "1"), ("qty", "nan"), ("side", "buy")]);
        assert!(TradeEvent::decode(&f).is_err());
    }

    #[test]
    fn kline_frame_accepts_both_close_spellings() {
        let long = fields(&[
            ("ts", "60000"),
            ("open", "1"),
            ("high", "2"),
            ("low", "0.5"),
            ("close", "1.5"),
            ("vol", "10"),
        ]);
        let short = fields(&[
            ("ts", "60000"),
            ("o", "1"),
            ("h", "2"),
            ("l", "0.5"),
            ("c", "1.5"),
            ("v", "10"),
        ]);
        assert_eq!(KlineFrame::decode(&long).unwrap().close, 1.5);
        assert_eq!(KlineFrame::decode(&short).unwrap().close, 1.5);
    }

    #[test]
    fn book_frame_mid_requires_both_sides_positive() {
        let f = fields(&[
            ("ts", "1"),
            ("bid1.px", "100"),
            ("bid1.sz", "1"),
            ("ask1.px", "101"),
            ("ask1.sz", "1"),
        ]);
        let b = BookFrame::decode(&f).unwrap();
        assert_eq!(b.mid(), Some(100.5));

        let f2 = fields(&[
            ("ts", "1"),
            ("bid1.px", "0"),
            ("bid1.sz", "1"),
            ("ask1.px", "101"),
            ("ask1.sz", "1"),
        ]);
        let b2 = BookFrame::decode(&f2).unwrap();
        assert_eq!(b2.mid(), None);
    }

    #[test]
    fn oi_frame_prefers_oi_ccy() {
        let f = fields(&[("ts", "1"), ("oi", "10"), ("oiCcy", "1000")]);
        let oi = OiFrame::decode(&f).unwrap();
        assert_eq!(oi.preferred(), 1000.0);

        let f2 = fields(&[("ts", "1"), ("oi", "10")]);
        let oi2 = OiFrame::decode(&f2).unwrap();
        assert_eq!(oi2.preferred(), 10.0);
    }

    #[test]
    fn detected_signal_roundtrips_through_fields() {
        let d = DetectedSignal {
            ts: 123,
            sym: "BTC-USDT-SWAP".to_string(),
            dir: Dir::Buy,
            strength: 0.812,
            evidence: Evidence {
                src: "breakout".to_string(),
                candidates_hash: Some("abc".to_string()),
                z_like_max: Some(1.5),
                buy_share3s_max: Some(0.9),
            },
            approx_key: "sym|buy|breakout|81|z:1.5|sh:0.9".to_string(),
            strategy_id: "intra.v1".to_string(),
            ttl_ms: 6000,
        };
        let fields_out = d.to_fields();
        let decoded = DetectedSignal::decode(&fields_out, "BTC-USDT-SWAP").unwrap();
        assert_eq!(decoded.dir, Dir::Buy);
        assert!((decoded.strength - 0.812).abs() < 1e-6);
        assert_eq!(decoded.evidence.src, "breakout");
    }
}
