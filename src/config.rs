// =============================================================================
// Configuration — environment-variable driven runtime tunables
// =============================================================================
//
// Follows the teacher's `runtime_config.rs` pattern (a struct with
// `#[serde(default = "fn")]` per field) but is populated from `std::env::var`
// with typed parsing and warn-and-default fallback rather than a JSON file,
// per spec §6's environment-is-authoritative model. Loaded once at startup
// and treated as immutable for the process lifetime — the spec excludes
// runtime reconfiguration.

use serde::Serialize;
use tracing::warn;

/// Per-fill fee rate applied symmetrically to entry/exit when the exchange
/// does not report an explicit fee on a fill (spec §9 Open Question).
pub const FEE_RATE: f64 = 0.001;

/// Default memory-record retention window (spec §3: "configurable (default
/// 90 days); periodic compaction removes records older than the window").
pub const MEMORY_RETENTION_DAYS: i64 = 90;

/// Sealed candle windows older than this are eligible for deletion (spec
/// §4.3: "windows older than 30 days and sealed are eligible for deletion").
pub const CANDLE_WINDOW_GC_DAYS: i64 = 30;

/// How often the background compaction task sweeps memory records and
/// sealed candle windows.
pub const COMPACTION_INTERVAL_SEC: u64 = 3_600;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub exchange_api_key: String,
    #[serde(skip)]
    pub exchange_api_secret: String,
    pub exchange_testnet: bool,

    pub storage_url: String,

    pub default_strategy: String,
    pub default_symbol: String,
    pub default_amount: f64,
    pub max_position_size: f64,

    /// Negative fraction, e.g. -0.05 for a -5% stop-loss.
    pub stop_loss_pct: f64,
    pub tp_min_pct: f64,
    pub tp_trail_pct: f64,

    pub analysis_interval_sec: u64,
    pub max_autonomous: usize,
    pub min_score: f64,
    pub min_budget: f64,
    pub reap_age_hours: i64,

    pub cors_origins: Vec<String>,
    pub bind_addr: String,
    pub admin_token: String,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "failed to parse env var, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from the process environment, logging (with
    /// secrets redacted) the resolved values.
    pub fn load() -> Self {
        let cfg = Self {
            exchange_api_key: env_string("EXCHANGE_API_KEY", ""),
            exchange_api_secret: env_string("EXCHANGE_API_SECRET", ""),
            exchange_testnet: env_bool("EXCHANGE_TESTNET", true),

            storage_url: env_string("STORAGE_URL", "fleet-bot.sqlite3"),

            default_strategy: env_string("DEFAULT_STRATEGY", "rsi"),
            default_symbol: env_string("DEFAULT_SYMBOL", "BTCUSDT"),
            default_amount: env_parsed("DEFAULT_AMOUNT", 100.0),
            max_position_size: env_parsed("MAX_POSITION_SIZE", 1000.0),

            stop_loss_pct: env_parsed("STOP_LOSS_PCT", -5.0) / 100.0,
            tp_min_pct: env_parsed("TP_MIN_PCT", 2.0) / 100.0,
            tp_trail_pct: env_parsed("TP_TRAIL_PCT", 3.0) / 100.0,

            analysis_interval_sec: env_parsed("ANALYSIS_INTERVAL_SEC", 600),
            max_autonomous: env_parsed("MAX_AUTONOMOUS", 2),
            min_score: env_parsed("MIN_SCORE", 0.3),
            min_budget: env_parsed("MIN_BUDGET", 10.0),
            reap_age_hours: env_parsed("REAP_AGE_HOURS", 24),

            cors_origins: env_string("CORS_ORIGINS", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:3001"),
            admin_token: env_string("FLEET_ADMIN_TOKEN", ""),
        };

        tracing::info!(
            exchange_testnet = cfg.exchange_testnet,
            storage_url = %cfg.storage_url,
            default_strategy = %cfg.default_strategy,
            default_symbol = %cfg.default_symbol,
            stop_loss_pct = cfg.stop_loss_pct,
            tp_min_pct = cfg.tp_min_pct,
            tp_trail_pct = cfg.tp_trail_pct,
            analysis_interval_sec = cfg.analysis_interval_sec,
            max_autonomous = cfg.max_autonomous,
            min_score = cfg.min_score,
            "configuration loaded"
        );
        if cfg.exchange_api_key.is_empty() {
            warn!("EXCHANGE_API_KEY is not set — exchange calls will be rejected by the venue");
        }
        if cfg.admin_token.is_empty() {
            warn!("FLEET_ADMIN_TOKEN is not set — authenticated routes will reject all requests");
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_common_truthy_values() {
        for v in ["true", "1", "yes", "TRUE"] {
            std::env::set_var("FLEET_TEST_BOOL", v);
            assert!(env_bool("FLEET_TEST_BOOL", false));
        }
        std::env::remove_var("FLEET_TEST_BOOL");
    }

    #[test]
    fn env_parsed_falls_back_on_bad_value() {
        std::env::set_var("FLEET_TEST_NUM", "not-a-number");
        let v: f64 = env_parsed("FLEET_TEST_NUM", 42.0);
        assert_eq!(v, 42.0);
        std::env::remove_var("FLEET_TEST_NUM");
    }

    #[test]
    fn env_parsed_uses_default_when_unset() {
        std::env::remove_var("FLEET_TEST_UNSET");
        let v: u64 = env_parsed("FLEET_TEST_UNSET", 7);
        assert_eq!(v, 7);
    }
}
