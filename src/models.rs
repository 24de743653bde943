//! Normalized market-data and sandbox trading types shared across the
//! gateway: ticks on the bus, orders/positions/funds in the store, and the
//! enums that show up on every wire surface.

use serde::{Deserialize, Serialize};

/// Market-data tier requested by a client and delivered on the bus.
///
/// The numeric values are part of the client protocol (`mode: 1|2|4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mode {
    Ltp,
    Quote,
    Depth,
}

impl Mode {
    pub fn as_u8(self) -> u8 {
        match self {
            Mode::Ltp => 1,
            Mode::Quote => 2,
            Mode::Depth => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Ltp => "LTP",
            Mode::Quote => "QUOTE",
            Mode::Depth => "DEPTH",
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Ltp
    }
}

impl TryFrom<u8> for Mode {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Mode::Ltp),
            2 => Ok(Mode::Quote),
            4 => Ok(Mode::Depth),
            other => Err(format!("invalid mode {other}, expected 1, 2 or 4")),
        }
    }
}

impl From<Mode> for u8 {
    fn from(m: Mode) -> u8 {
        m.as_u8()
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u64,
    pub orders: u32,
}

/// Order-book snapshot carried on DEPTH ticks.
///
/// `actual_depth`/`broker_supported` report truncation when the broker caps
/// the book below the requested level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub buy: Vec<DepthLevel>,
    pub sell: Vec<DepthLevel>,
    pub actual_depth: usize,
    pub broker_supported: bool,
}

/// Normalized tick as published on the internal bus. All prices are rupees;
/// adapters convert paise before publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub exchange: String,
    pub mode: Mode,
    pub ltp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<DepthSnapshot>,
    /// Unix milliseconds, UTC. Ingestion time when the broker omits one.
    pub ts_ms: i64,
}

impl Tick {
    /// Bus topic for this tick: `EXCHANGE|SYMBOL|MODE`.
    pub fn topic(&self) -> String {
        topic(&self.exchange, &self.symbol, self.mode)
    }
}

pub fn topic(exchange: &str, symbol: &str, mode: Mode) -> String {
    format!("{exchange}|{symbol}|{}", mode.as_u8())
}

/// Subscription key as tracked per client; the user comes from the client's
/// authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubKey {
    pub symbol: String,
    pub exchange: String,
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    pub fn opposite(self) -> Action {
        match self {
            Action::Buy => Action::Sell,
            Action::Sell => Action::Buy,
        }
    }

    /// Signed direction: +1 for BUY, -1 for SELL.
    pub fn sign(self) -> i64 {
        match self {
            Action::Buy => 1,
            Action::Sell => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Product {
    /// Intraday; force-closed at the exchange square-off time.
    Mis,
    /// Carry-forward derivatives.
    Nrml,
    /// Delivery equity; settles into holdings at T+1.
    Cnc,
}

impl Product {
    pub fn as_str(self) -> &'static str {
        match self {
            Product::Mis => "MIS",
            Product::Nrml => "NRML",
            Product::Cnc => "CNC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "SL")]
    Sl,
    #[serde(rename = "SL-M")]
    SlM,
}

impl PriceType {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceType::Market => "MARKET",
            PriceType::Limit => "LIMIT",
            PriceType::Sl => "SL",
            PriceType::SlM => "SL-M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Completed,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

/// A simulated order. Created `open`; transitions to exactly one terminal
/// state, after which the row is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimOrder {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub action: Action,
    pub quantity: u64,
    pub product: Product,
    pub pricetype: PriceType,
    /// Pricetype as submitted; differs from `pricetype` once an SL/SL-M
    /// order arms and is rewritten to LIMIT/MARKET.
    pub pricetype_submitted: PriceType,
    pub price: f64,
    pub trigger_price: f64,
    pub status: OrderStatus,
    /// Margin blocked at acceptance, released on cancel/reject or folded
    /// into the position on fill.
    pub margin_blocked: f64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_ts: Option<i64>,
}

/// Execution record created on every fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimTrade {
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub action: Action,
    pub quantity: u64,
    pub price: f64,
    pub ts: i64,
}

/// Net position per (user, symbol, exchange, product). Quantity is signed:
/// long > 0, short < 0. A closed row (quantity = 0) stays for the day's
/// realized P&L accumulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub product: Product,
    pub quantity: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    /// Margin currently blocked against this position.
    pub margin_blocked: f64,
    pub ltp: f64,
    pub mtm: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.quantity != 0
    }
}

/// CNC position after T+1 settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub avg_price: f64,
    pub settled_at: i64,
}

/// Funds snapshot. Invariant at rest, rounded to paise:
/// `available + used_margin = capital + realized_pnl_today`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funds {
    pub user_id: String,
    pub capital: f64,
    pub available: f64,
    pub used_margin: f64,
    pub realized_pnl_today: f64,
    pub unrealized_pnl: f64,
}

impl Funds {
    pub fn fresh(user_id: &str, capital: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            capital,
            available: capital,
            used_margin: 0.0,
            realized_pnl_today: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    /// Check the funds identity to the nearest paisa.
    pub fn invariant_holds(&self) -> bool {
        let lhs = round_paise(self.available + self.used_margin);
        let rhs = round_paise(self.capital + self.realized_pnl_today);
        (lhs - rhs).abs() < 0.005
    }
}

/// Round a rupee amount to the nearest paisa.
pub fn round_paise(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_roundtrips_through_wire_values() {
        for (mode, n) in [(Mode::Ltp, 1u8), (Mode::Quote, 2), (Mode::Depth, 4)] {
            assert_eq!(mode.as_u8(), n);
            assert_eq!(Mode::try_from(n).unwrap(), mode);
        }
        assert!(Mode::try_from(3).is_err());
    }

    #[test]
    fn mode_serde_uses_numbers() {
        let json = serde_json::to_string(&Mode::Depth).unwrap();
        assert_eq!(json, "4");
        let back: Mode = serde_json::from_str("2").unwrap();
        assert_eq!(back, Mode::Quote);
    }

    #[test]
    fn topic_format() {
        assert_eq!(topic("NSE", "SBIN", Mode::Ltp), "NSE|SBIN|1");
    }

    #[test]
    fn pricetype_serde_matches_wire_names() {
        assert_eq!(serde_json::to_string(&PriceType::SlM).unwrap(), "\"SL-M\"");
        let pt: PriceType = serde_json::from_str("\"SL\"").unwrap();
        assert_eq!(pt, PriceType::Sl);
    }

    #[test]
    fn funds_invariant_tolerates_paise_rounding() {
        let mut funds = Funds::fresh("u1", 10_000_000.0);
        assert!(funds.invariant_holds());
        funds.available -= 50_000.0;
        funds.used_margin += 50_000.004;
        assert!(funds.invariant_holds());
        funds.used_margin += 1.0;
        assert!(!funds.invariant_holds());
    }
}
