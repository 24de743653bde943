//! Ingress normalization: broker-format ticks to the common wire
//! representation. Unit conversion is uniform — when a broker reports in
//! paise, every numeric price field (ltp, OHLC, bid/ask, each depth level)
//! is divided by the same factor.

use crate::broker::RawTick;
use crate::config::now_ms;
use crate::models::{DepthLevel, DepthSnapshot, Mode, Tick};

fn scale(v: f64, divisor: f64) -> f64 {
    if divisor == 1.0 {
        v
    } else {
        v / divisor
    }
}

fn scale_opt(v: Option<f64>, divisor: f64) -> Option<f64> {
    v.map(|v| scale(v, divisor))
}

fn scale_levels(levels: &[DepthLevel], divisor: f64, cap: usize) -> Vec<DepthLevel> {
    levels
        .iter()
        .take(cap)
        .map(|l| DepthLevel {
            price: scale(l.price, divisor),
            quantity: l.quantity,
            orders: l.orders,
        })
        .collect()
}

/// Normalize a raw broker tick for publication.
///
/// `actual_depth`/`broker_supported` come from the subscription record (the
/// truncation decision made at subscribe time); depth sequences are capped
/// to `actual_depth`, never silently dropped.
pub fn normalize_tick(
    raw: &RawTick,
    symbol: &str,
    exchange: &str,
    divisor: f64,
    actual_depth: usize,
    broker_supported: bool,
) -> Tick {
    let depth = if raw.mode == Mode::Depth {
        Some(DepthSnapshot {
            buy: scale_levels(&raw.depth_buy, divisor, actual_depth),
            sell: scale_levels(&raw.depth_sell, divisor, actual_depth),
            actual_depth,
            broker_supported,
        })
    } else {
        None
    };

    Tick {
        symbol: symbol.to_string(),
        exchange: exchange.to_string(),
        mode: raw.mode,
        ltp: scale(raw.ltp, divisor),
        open: scale_opt(raw.open, divisor),
        high: scale_opt(raw.high, divisor),
        low: scale_opt(raw.low, divisor),
        close: scale_opt(raw.close, divisor),
        volume: raw.volume,
        bid: scale_opt(raw.bid, divisor),
        ask: scale_opt(raw.ask, divisor),
        depth,
        ts_ms: raw.ts_ms.unwrap_or_else(now_ms),
    }
}
