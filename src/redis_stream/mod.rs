// =============================================================================
// Stream Primitives — thin, typed operations over the Redis Streams bus
// =============================================================================
//
// Every worker in this crate talks to Redis exclusively through this module:
// one small struct holding a cloneable `redis::aio::ConnectionManager`
// handle, exposing typed async methods, translating library errors into
// `anyhow::Result` with `.context(...)` at each call site.

mod message;

pub use message::NormalizedMessage;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tracing::warn;

use crate::types::StreamFields;

/// One `XREADGROUP`-delivered entry: its stream key, its Redis-assigned ID,
/// and its flattened field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub stream_key: String,
    pub id: String,
    pub fields: StreamFields,
}

/// Trimming strategy for `XADD`. Both variants use Redis's approximate
/// (`~`) trimming so the server doesn't pay for exact-length bookkeeping.
#[derive(Debug, Clone, Copy)]
pub enum Trim {
    MaxLenApprox(usize),
    MinIdMsApprox(i64),
    None,
}

/// Where a consumer group's cursor starts: only-new-messages (`$`) or
/// from-the-beginning (`0`).
#[derive(Debug, Clone, Copy)]
pub enum GroupStart {
    New,
    Beginning,
}

impl GroupStart {
    fn as_redis_id(self) -> &'static str {
        match self {
            Self::New => "$",
            Self::Beginning => "0",
        }
    }
}

/// Typed wrapper around a Redis connection, covering exactly the stream and
/// hash operations this crate's workers need.
#[derive(Clone)]
pub struct RedisStreams {
    conn: ConnectionManager,
}

impl RedisStreams {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("failed to build redis client")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to establish redis connection manager")?;
        Ok(Self { conn })
    }

    /// `XADD key (NOMKSTREAM) (MAXLEN ~ N | MINID ~ ms) * field value ...`
    ///
    /// Fields whose value is `None` are omitted entirely; everything else is
    /// stringified before being sent.
    pub async fn xadd(
        &self,
        key: &str,
        fields: &StreamFields,
        trim: Trim,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);

        match trim {
            Trim::MaxLenApprox(n) => {
                cmd.arg("MAXLEN").arg("~").arg(n);
            }
            Trim::MinIdMsApprox(ms) => {
                cmd.arg("MINID").arg("~").arg(format!("{ms}-0"));
            }
            Trim::None => {}
        }

        cmd.arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XADD failed for key {key}"))?;
        Ok(id)
    }

    /// Idempotently ensure a consumer group exists, starting at `start`.
    /// `BUSYGROUP` (already exists) is treated as success.
    pub async fn ensure_group(&self, key: &str, group: &str, start: GroupStart) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg(start.as_redis_id())
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).with_context(|| format!("XGROUP CREATE failed for {key}/{group}")),
        }
    }

    /// `XREADGROUP GROUP group consumer COUNT count BLOCK blockMs STREAMS keys... >...`
    ///
    /// Returns `None` (not an error) on a timed-out block or a transient read
    /// failure — callers should idle briefly and retry.
    pub async fn read_group(
        &self,
        keys: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Option<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as i64)
            .arg("STREAMS");
        for k in keys {
            cmd.arg(k);
        }
        for _ in keys {
            cmd.arg(">");
        }

        let reply: RedisResult<redis::Value> = cmd.query_async(&mut conn).await;
        match reply {
            Ok(value) => parse_xread_reply(value),
            Err(e) => {
                warn!(error = %e, "XREADGROUP failed, idling");
                None
            }
        }
    }

    /// `XACK key group id`. Errors are logged and swallowed — a failed ack
    /// just means the message reappears on redelivery, which is acceptable
    /// under an at-least-once delivery contract.
    pub async fn ack(&self, key: &str, group: &str, id: &str) {
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = redis::cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, key, id, "XACK failed");
        }
    }

    /// `XRANGE key fromMs-0 toMs-999999 (COUNT n)`.
    pub async fn xrange_by_time(
        &self,
        key: &str,
        from_ms: i64,
        to_ms: i64,
        count: Option<usize>,
    ) -> Result<Vec<(String, StreamFields)>> {
        let mut conn = self.conn.clone();
        let start = format!("{from_ms}-0");
        let end = format!("{to_ms}-999999");
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg(&start).arg(&end);
        if let Some(n) = count {
            cmd.arg("COUNT").arg(n);
        }
        let reply: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XRANGE failed for {key}"))?;
        Ok(parse_range_reply(reply))
    }

    /// `XREVRANGE key + - COUNT n`, returned oldest-first for caller
    /// convenience.
    pub async fn xrevrange_latest(&self, key: &str, n: usize) -> Result<Vec<(String, StreamFields)>> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(n)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XREVRANGE failed for {key}"))?;
        let mut rows = parse_range_reply(reply);
        rows.reverse();
        Ok(rows)
    }

    /// `XLEN key`, used by the market-env signal-rate-excess calculation.
    pub async fn xlen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.xlen(key)
            .await
            .with_context(|| format!("XLEN failed for {key}"))
    }

    /// Page through `XAUTOCLAIM` up to 3 pages, reclaiming entries idle for
    /// at least `min_idle`. Returns the reclaimed `(id, fields)` pairs.
    pub async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<(String, StreamFields)>> {
        let mut conn = self.conn.clone();
        let mut cursor = "0-0".to_string();
        let mut out = Vec::new();

        for _ in 0..3 {
            let reply: redis::Value = redis::cmd("XAUTOCLAIM")
                .arg(key)
                .arg(group)
                .arg(consumer)
                .arg(min_idle.as_millis() as i64)
                .arg(&cursor)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("XAUTOCLAIM failed for {key}/{group}"))?;

            let (next_cursor, entries) = parse_autoclaim_reply(reply);
            out.extend(entries);

            if next_cursor == "0-0" {
                break;
            }
            cursor = next_cursor;
        }

        Ok(out)
    }

    pub async fn hset(&self, key: &str, fields: &StreamFields) -> Result<()> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let _: () = conn
            .hset_multiple(key, &pairs)
            .await
            .with_context(|| format!("HSET failed for {key}"))?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<StreamFields> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .with_context(|| format!("HGETALL failed for {key}"))?;
        Ok(map)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let val: Option<String> = conn
            .hget(key, field)
            .await
            .with_context(|| format!("HGET failed for {key}.{field}"))?;
        Ok(val)
    }

    pub async fn expire(&self, key: &str, secs: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .expire(key, secs)
            .await
            .with_context(|| format!("EXPIRE failed for {key}"))?;
        Ok(())
    }

    /// `SET key value NX PX ttlMs` — atomic create-if-absent with a TTL,
    /// used by the Router's idempotency lock. Returns `true` if the lock was
    /// acquired.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("SET NX PX failed for {key}")),
        }
    }

    /// Normalize a batch of raw stream entries into [`NormalizedMessage`]s:
    /// derive `symbol` from the `{...}` hash-tag, `kind` from the final key
    /// segment, and `ts` by priority `payload.ts → id-time → now`.
    pub fn normalize_batch(&self, entries: &[StreamEntry], now_ms: i64) -> Vec<NormalizedMessage> {
        entries
            .iter()
            .map(|e| NormalizedMessage::from_entry(e, now_ms))
            .collect()
    }
}

fn parse_xread_reply(value: redis::Value) -> Option<Vec<StreamEntry>> {
    let redis::Value::Array(streams) = value else {
        return None;
    };
    if streams.is_empty() {
        return None;
    }

    let mut out = Vec::new();
    for stream in streams {
        let redis::Value::Array(pair) = stream else { continue };
        if pair.len() != 2 {
            continue;
        }
        let redis::Value::BulkString(key_bytes) = &pair[0] else { continue };
        let stream_key = String::from_utf8_lossy(key_bytes).to_string();
        let redis::Value::Array(entries) = &pair[1] else { continue };

        for entry in entries {
            let redis::Value::Array(id_fields) = entry else { continue };
            if id_fields.len() != 2 {
                continue;
            }
            let id = redis_value_to_string(&id_fields[0]);
            let fields = redis_fields_to_map(&id_fields[1]);
            out.push(StreamEntry {
                stream_key: stream_key.clone(),
                id,
                fields,
            });
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn parse_range_reply(value: redis::Value) -> Vec<(String, StreamFields)> {
    let redis::Value::Array(entries) = value else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let redis::Value::Array(id_fields) = entry else { continue };
        if id_fields.len() != 2 {
            continue;
        }
        let id = redis_value_to_string(&id_fields[0]);
        let fields = redis_fields_to_map(&id_fields[1]);
        out.push((id, fields));
    }
    out
}

fn parse_autoclaim_reply(value: redis::Value) -> (String, Vec<(String, StreamFields)>) {
    let redis::Value::Array(parts) = value else {
        return ("0-0".to_string(), Vec::new());
    };
    if parts.len() < 2 {
        return ("0-0".to_string(), Vec::new());
    }
    let cursor = redis_value_to_string(&parts[0]);
    let entries = parse_range_reply(parts[1].clone());
    (cursor, entries)
}

fn redis_value_to_string(value: &redis::Value) -> String {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Int(i) => i.to_string(),
        _ => String::new(),
    }
}

fn redis_fields_to_map(value: &redis::Value) -> StreamFields {
    let mut map = StreamFields::new();
    if let redis::Value::Array(flat) = value {
        let mut it = flat.iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            map.insert(redis_value_to_string(k), redis_value_to_string(v));
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_start_maps_to_redis_ids() {
        assert_eq!(GroupStart::New.as_redis_id(), "$");
        assert_eq!(GroupStart::Beginning.as_redis_id(), "0");
    }

    #[test]
    fn redis_fields_to_map_pairs_up_flat_array() {
        let value = redis::Value::Array(vec![
            redis::Value::BulkString(b"ts".to_vec()),
            redis::Value::BulkString(b"123".to_vec()),
            redis::Value::BulkString(b"px".to_vec()),
            redis::Value::BulkString(b"100".to_vec()),
        ]);
        let map = redis_fields_to_map(&value);
        assert_eq!(map.get("ts").map(String::as_str), Some("123"));
        assert_eq!(map.get("px").map(String::as_str), Some("100"));
    }

    #[test]
    fn parse_range_reply_handles_empty() {
        let value = redis::Value::Array(vec![]);
        assert!(parse_range_reply(value).is_empty());
    }

    #[test]
    fn parse_xread_reply_none_on_empty_streams() {
        assert!(parse_xread_reply(redis::Value::Array(vec![])).is_none());
    }
}
