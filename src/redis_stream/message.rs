// =============================================================================
// NormalizedMessage — symbol/kind/ts derivation for raw stream entries
// =============================================================================

use crate::types::StreamFields;

use super::StreamEntry;

/// A stream entry with its routing metadata (`symbol`, `kind`, `ts`) already
/// pulled out, so consumers never re-parse the stream key.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub stream_key: String,
    pub id: String,
    pub symbol: String,
    pub kind: String,
    pub ts: i64,
    pub fields: StreamFields,
}

impl NormalizedMessage {
    pub fn from_entry(entry: &StreamEntry, now_ms: i64) -> Self {
        let symbol = extract_symbol(&entry.stream_key);
        let kind = extract_kind(&entry.stream_key, &mut entry.fields.clone());
        let ts = derive_ts(&entry.fields, &entry.id, now_ms);

        Self {
            stream_key: entry.stream_key.clone(),
            id: entry.id.clone(),
            symbol,
            kind,
            ts,
            fields: entry.fields.clone(),
        }
    }
}

/// Pull the `{...}` hash-tag out of a key like `ws:{BTC-USDT-SWAP}:trades`.
fn extract_symbol(key: &str) -> String {
    if let Some(open) = key.find('{') {
        if let Some(close) = key[open..].find('}') {
            return key[open + 1..open + close].to_string();
        }
    }
    String::new()
}

/// Derive `kind` from the final `:`-separated key segment. A `kline{tf}`
/// segment (e.g. `kline5m`) becomes `kind=kline` with `payload._tf=tf`
/// stashed into the caller-owned field map.
fn extract_kind(key: &str, fields: &mut StreamFields) -> String {
    let last = key.rsplit(':').next().unwrap_or("");
    // Strip a trailing `{...}` hash-tag segment if the key ends with it
    // instead of a plain kind (defensive — keys in this system always end
    // with the kind segment, but this keeps the parser robust).
    let last = last.trim_end_matches(|c: char| c == '{' || c == '}');

    if let Some(tf) = last.strip_prefix("kline") {
        if !tf.is_empty() {
            fields.entry("_tf".to_string()).or_insert_with(|| tf.to_string());
        }
        return "kline".to_string();
    }

    last.to_string()
}

/// `ts` derivation priority: `payload.ts` → Redis stream ID time → `now`.
fn derive_ts(fields: &StreamFields, id: &str, now_ms: i64) -> i64 {
    if let Some(ts) = fields.get("ts").and_then(|s| s.parse::<i64>().ok()) {
        return ts;
    }
    if let Some(ms_part) = id.split('-').next() {
        if let Ok(ms) = ms_part.parse::<i64>() {
            return ms;
        }
    }
    now_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, id: &str, fields: &[(&str, &str)]) -> StreamEntry {
        StreamEntry {
            stream_key: key.to_string(),
            id: id.to_string(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn extracts_symbol_from_hash_tag() {
        assert_eq!(extract_symbol("ws:{BTC-USDT-SWAP}:trades"), "BTC-USDT-SWAP");
    }

    #[test]
    fn extracts_symbol_missing_braces_is_empty() {
        assert_eq!(extract_symbol("ws:BTC-USDT-SWAP:trades"), "");
    }

    #[test]
    fn kind_is_final_segment() {
        let e = entry("ws:{BTC-USDT-SWAP}:trades", "1-0", &[]);
        let msg = NormalizedMessage::from_entry(&e, 1000);
        assert_eq!(msg.kind, "trades");
        assert_eq!(msg.symbol, "BTC-USDT-SWAP");
    }

    #[test]
    fn kline_kind_stashes_timeframe() {
        let e = entry("ws:{BTC-USDT-SWAP}:kline5m", "1-0", &[]);
        let msg = NormalizedMessage::from_entry(&e, 1000);
        assert_eq!(msg.kind, "kline");
        assert_eq!(msg.fields.get("_tf").map(String::as_str), Some("5m"));
    }

    #[test]
    fn ts_prefers_payload_ts() {
        let e = entry("ws:{BTC-USDT-SWAP}:trades", "500-0", &[("ts", "999")]);
        let msg = NormalizedMessage::from_entry(&e, 1000);
        assert_eq!(msg.ts, 999);
    }

    #[test]
    fn ts_falls_back_to_id_time() {
        let e = entry("ws:{BTC-USDT-SWAP}:trades", "777-3", &[]);
        let msg = NormalizedMessage::from_entry(&e, 1000);
        assert_eq!(msg.ts, 777);
    }

    #[test]
    fn ts_falls_back_to_now() {
        let e = entry("ws:{BTC-USDT-SWAP}:trades", "not-an-id", &[]);
        let msg = NormalizedMessage::from_entry(&e, 1234);
        assert_eq!(msg.ts, 1234);
    }
}
