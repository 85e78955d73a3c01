// =============================================================================
// Runtime Configuration — process-env driven tunables for the signal backbone
// =============================================================================
//
// Every tunable consumed from process env lives here so a single struct,
// built once at startup, is threaded through every worker. Unlike a
// hot-reloadable JSON file, this configuration is immutable for the
// lifetime of the process, so there is no save()/load() round trip, only a
// one-shot `AppConfig::from_env()`.
//
// =============================================================================

/// Default Binance-perp short-token → instId mapping, e.g. `btc` → `BTC-USDT-SWAP`.
fn expand_symbol(token: &str) -> String {
    let t = token.trim();
    if t.is_empty() {
        return String::new();
    }
    if t.contains('-') {
        return t.to_uppercase();
    }
    format!("{}-USDT-SWAP", t.to_uppercase())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Gate parameters consumed by the Router (second-layer gating).
#[derive(Debug, Clone)]
pub struct SignalGateConfig {
    pub enabled: bool,
    pub min_strength_floor: f64,
    pub extra_cooldown_ms: i64,
    pub min_spacing_ms: i64,
    pub hyst_hi: f64,
    pub hyst_lo: f64,
    pub idem_bucket_ms: i64,
    pub idem_ttl_ms: i64,
}

impl Default for SignalGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_strength_floor: 0.6,
            extra_cooldown_ms: 0,
            min_spacing_ms: 10_000,
            hyst_hi: 0.75,
            hyst_lo: 0.55,
            idem_bucket_ms: 8_000,
            idem_ttl_ms: 10_000,
        }
    }
}

/// One resolution horizon for the Signal Evaluator (e.g. `5m` → 300000ms).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizon {
    pub name: &'static str,
    pub ms: i64,
}

/// Parameters consumed by the Signal Evaluator.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub horizons: Vec<Horizon>,
    pub success_bp: f64,
    pub neutral_band_bp: f64,
    pub fee_bp: f64,
    pub max_retry: u32,
    pub px_search_ms: i64,
    pub price_pref: Vec<String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            horizons: vec![
                Horizon { name: "5m", ms: 300_000 },
                Horizon { name: "15m", ms: 900_000 },
            ],
            success_bp: 5.0,
            neutral_band_bp: 2.0,
            fee_bp: 0.0,
            max_retry: 6,
            px_search_ms: 15_000,
            price_pref: vec![
                "mid".to_string(),
                "last".to_string(),
                "win:1m".to_string(),
                "ws:kline1m".to_string(),
                "bf:kline1m".to_string(),
            ],
        }
    }
}

/// Top-level, immutable configuration for the signal-core process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Process-wide Redis key prefix (e.g. `dev:`), empty by default.
    pub key_prefix: String,
    /// Redis connection string.
    pub redis_url: String,
    /// Fully-expanded exchange symbols (e.g. `BTC-USDT-SWAP`).
    pub symbols: Vec<String>,
    pub gate: SignalGateConfig,
    pub eval: EvalConfig,
}

impl AppConfig {
    /// Build configuration from process environment, falling back to the
    /// documented defaults for every unset variable.
    pub fn from_env() -> Self {
        let symbols = Self::resolve_symbols();

        let gate = SignalGateConfig {
            enabled: env_bool("SIGNALS_ENABLED", true),
            min_strength_floor: env_parse("SIGNAL_MIN_STRENGTH_FLOOR", 0.6),
            extra_cooldown_ms: env_parse("SIGNAL_EXTRA_COOLDOWN_MS", 0),
            min_spacing_ms: env_parse("SIGNAL_MIN_SPACING_MS", 10_000),
            hyst_hi: env_parse("SIGNAL_HYST_HI", 0.75),
            hyst_lo: env_parse("SIGNAL_HYST_LO", 0.55),
            idem_bucket_ms: env_parse("SIGNAL_IDEM_BUCKET_MS", 8_000),
            idem_ttl_ms: env_parse("SIGNAL_IDEM_TTL_MS", 10_000),
        };

        let horizons = std::env::var("EVAL_HORIZONS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|tok| parse_horizon(tok.trim()))
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| EvalConfig::default().horizons);

        let price_pref = std::env::var("EVAL_PRICE_PREF")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| EvalConfig::default().price_pref);

        let eval = EvalConfig {
            horizons,
            success_bp: env_parse("EVAL_SUCCESS_BP", 5.0),
            neutral_band_bp: env_parse("EVAL_NEUTRAL_BAND_BP", 2.0),
            fee_bp: env_parse("EVAL_FEE_BP", 0.0),
            max_retry: env_parse("EVAL_MAX_RETRY", 6),
            px_search_ms: env_parse("EVAL_PX_SEARCH_MS", 15_000),
            price_pref,
        };

        Self {
            key_prefix: env_string("REDIS_KEY_PREFIX", ""),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            symbols,
            gate,
            eval,
        }
    }

    fn resolve_symbols() -> Vec<String> {
        let raw = std::env::var("SYMBOLS")
            .or_else(|_| std::env::var("OKX_ASSETS"))
            .or_else(|_| std::env::var("OKX_SYMBOLS"))
            .unwrap_or_default();

        let mut symbols: Vec<String> = raw
            .split(',')
            .map(expand_symbol)
            .filter(|s| !s.is_empty())
            .collect();

        if symbols.is_empty() {
            symbols = vec![
                "BTC-USDT-SWAP".to_string(),
                "ETH-USDT-SWAP".to_string(),
            ];
        }
        symbols
    }

    /// Prefix a logical key name with the configured process-wide prefix.
    pub fn key(&self, name: impl AsRef<str>) -> String {
        format!("{}{}", self.key_prefix, name.as_ref())
    }
}

fn parse_horizon(tok: &str) -> Option<Horizon> {
    // Accepts the documented short tokens; extend here if new horizons are
    // added to EVAL_HORIZONS in deployment.
    match tok {
        "1m" => Some(Horizon { name: "1m", ms: 60_000 }),
        "5m" => Some(Horizon { name: "5m", ms: 300_000 }),
        "15m" => Some(Horizon { name: "15m", ms: 900_000 }),
        "30m" => Some(Horizon { name: "30m", ms: 1_800_000 }),
        "1h" => Some(Horizon { name: "1h", ms: 3_600_000 }),
        _ => None,
    }
}

/// Consumer-group/consumer naming helpers shared across workers.
pub mod groups {
    pub const WINDOW: &str = "cg:window";
    pub const SIGNAL_ROUTER: &str = "cg:signal-router";
    pub const SIGNAL_EVAL: &str = "cg:signal-eval";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_short_symbol_tokens() {
        assert_eq!(expand_symbol("btc"), "BTC-USDT-SWAP");
        assert_eq!(expand_symbol(" eth "), "ETH-USDT-SWAP");
    }

    #[test]
    fn leaves_full_inst_id_untouched_but_uppercased() {
        assert_eq!(expand_symbol("btc-usdt-swap"), "BTC-USDT-SWAP");
    }

    #[test]
    fn empty_token_is_dropped() {
        assert_eq!(expand_symbol(""), "");
        assert_eq!(expand_symbol("   "), "");
    }

    #[test]
    fn default_gate_matches_documented_defaults() {
        let g = SignalGateConfig::default();
        assert_eq!(g.min_strength_floor, 0.6);
        assert_eq!(g.min_spacing_ms, 10_000);
        assert_eq!(g.hyst_hi, 0.75);
        assert_eq!(g.hyst_lo, 0.55);
        assert_eq!(g.idem_bucket_ms, 8_000);
        assert_eq!(g.idem_ttl_ms, 10_000);
    }

    #[test]
    fn default_eval_has_5m_and_15m_horizons() {
        let e = EvalConfig::default();
        assert_eq!(e.horizons.len(), 2);
        assert_eq!(e.horizons[0].name, "5m");
        assert_eq!(e.horizons[0].ms, 300_000);
        assert_eq!(e.horizons[1].name, "15m");
        assert_eq!(e.horizons[1].ms, 900_000);
    }

    #[test]
    fn parse_horizon_rejects_unknown_tokens() {
        assert!(parse_horizon("7m").is_none());
        assert_eq!(parse_horizon("1h").unwrap().ms, 3_600_000);
    }

    #[test]
    fn key_prefixing() {
        let mut cfg = AppConfig::from_env();
        cfg.key_prefix = "dev:".to_string();
        assert_eq!(cfg.key("win:1m:{BTC-USDT-SWAP}"), "dev:win:1m:{BTC-USDT-SWAP}");
    }
}
