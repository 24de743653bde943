//! Process configuration.
//!
//! Two layers:
//! - `AppConfig`: host/port/db-path style knobs, env-only.
//! - `SandboxConfig`: the simulated-trading parameters (capital, leverages,
//!   poll intervals, square-off times). Loaded from env defaults and
//!   persisted to the `sandbox_config` table so runtime edits survive
//!   restarts.

use chrono::{DateTime, FixedOffset, NaiveTime, Utc, Weekday};
use std::{collections::HashMap, env, path::PathBuf};

/// Indian Standard Time: UTC+05:30. All scheduling is interpreted in IST.
pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("IST offset is valid")
}

pub fn ist_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&ist())
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: String,
    /// Master-contract reload cadence for the symbol resolver.
    pub symbol_reload_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_string("TRADEGATE_BIND", "0.0.0.0:8765"),
            db_path: resolve_data_path(env::var("TRADEGATE_DB_PATH").ok(), "tradegate.db"),
            symbol_reload_secs: env_parse("SYMBOL_RELOAD_SECS", 6 * 3600),
        }
    }
}

/// Anchor relative data paths to the crate directory, not the caller's cwd,
/// so running from the repo root doesn't create a stray empty database.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub starting_capital: f64,
    pub reset_weekday: Weekday,
    pub reset_time: NaiveTime,
    pub equity_mis_leverage: f64,
    pub futures_leverage: f64,
    pub option_sell_leverage: f64,
    pub check_interval_ms: u64,
    pub mtm_interval_ms: u64,
    /// Exchange → square-off time (IST, HH:MM).
    pub square_off_times: HashMap<String, NaiveTime>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut square_off_times = HashMap::new();
        for (exchange, hhmm) in [
            ("NSE", "15:15"),
            ("BSE", "15:15"),
            ("NFO", "15:15"),
            ("BFO", "15:15"),
            ("CDS", "16:45"),
            ("BCD", "16:45"),
            ("MCX", "23:30"),
            ("NCDEX", "17:00"),
        ] {
            square_off_times.insert(
                exchange.to_string(),
                NaiveTime::parse_from_str(hhmm, "%H:%M").expect("valid default time"),
            );
        }

        Self {
            // One crore of paper money.
            starting_capital: 10_000_000.0,
            reset_weekday: Weekday::Sun,
            reset_time: NaiveTime::parse_from_str("00:00", "%H:%M").expect("valid time"),
            equity_mis_leverage: 5.0,
            futures_leverage: 10.0,
            option_sell_leverage: 10.0,
            check_interval_ms: 5000,
            mtm_interval_ms: 5000,
            square_off_times,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut cfg = Self {
            starting_capital: env_parse("SANDBOX_STARTING_CAPITAL", defaults.starting_capital),
            reset_weekday: env::var("SANDBOX_RESET_WEEKDAY")
                .ok()
                .and_then(|v| v.parse::<Weekday>().ok())
                .unwrap_or(defaults.reset_weekday),
            reset_time: env::var("SANDBOX_RESET_TIME")
                .ok()
                .and_then(|v| NaiveTime::parse_from_str(&v, "%H:%M").ok())
                .unwrap_or(defaults.reset_time),
            equity_mis_leverage: env_parse("SANDBOX_EQUITY_MIS_LEVERAGE", defaults.equity_mis_leverage),
            futures_leverage: env_parse("SANDBOX_FUTURES_LEVERAGE", defaults.futures_leverage),
            option_sell_leverage: env_parse(
                "SANDBOX_OPTION_SELL_LEVERAGE",
                defaults.option_sell_leverage,
            ),
            check_interval_ms: env_parse("SANDBOX_CHECK_INTERVAL_MS", defaults.check_interval_ms),
            mtm_interval_ms: env_parse("SANDBOX_MTM_INTERVAL_MS", defaults.mtm_interval_ms),
            square_off_times: defaults.square_off_times,
        };

        // Per-exchange override: SANDBOX_SQUARE_OFF_NSE=15:10
        let exchanges: Vec<String> = cfg.square_off_times.keys().cloned().collect();
        for exchange in exchanges {
            let key = format!("SANDBOX_SQUARE_OFF_{exchange}");
            if let Some(t) = env::var(&key)
                .ok()
                .and_then(|v| NaiveTime::parse_from_str(&v, "%H:%M").ok())
            {
                cfg.square_off_times.insert(exchange, t);
            }
        }

        cfg
    }

    pub fn square_off_time(&self, exchange: &str) -> Option<NaiveTime> {
        self.square_off_times.get(exchange).copied()
    }

    /// Flatten to string pairs for persistence in `sandbox_config`.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("starting_capital".to_string(), self.starting_capital.to_string()),
            ("reset_weekday".to_string(), self.reset_weekday.to_string()),
            ("reset_time".to_string(), self.reset_time.format("%H:%M").to_string()),
            ("equity_mis_leverage".to_string(), self.equity_mis_leverage.to_string()),
            ("futures_leverage".to_string(), self.futures_leverage.to_string()),
            ("option_sell_leverage".to_string(), self.option_sell_leverage.to_string()),
            ("check_interval_ms".to_string(), self.check_interval_ms.to_string()),
            ("mtm_interval_ms".to_string(), self.mtm_interval_ms.to_string()),
        ];
        for (exchange, t) in &self.square_off_times {
            pairs.push((
                format!("square_off_{exchange}"),
                t.format("%H:%M").to_string(),
            ));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ist_offset_is_five_thirty() {
        assert_eq!(ist().local_minus_utc(), 5 * 3600 + 1800);
    }

    #[test]
    fn defaults_cover_all_segment_exchanges() {
        let cfg = SandboxConfig::default();
        for exchange in ["NSE", "BSE", "CDS", "BCD", "MCX", "NCDEX"] {
            assert!(cfg.square_off_time(exchange).is_some(), "{exchange}");
        }
        assert_eq!(
            cfg.square_off_time("NSE").unwrap(),
            NaiveTime::parse_from_str("15:15", "%H:%M").unwrap()
        );
        assert!(cfg.square_off_time("NYSE").is_none());
    }

    #[test]
    fn config_flattens_for_persistence() {
        let cfg = SandboxConfig::default();
        let pairs = cfg.to_pairs();
        assert!(pairs.iter().any(|(k, _)| k == "starting_capital"));
        assert!(pairs.iter().any(|(k, v)| k == "square_off_MCX" && v == "23:30"));
    }
}
