//! The broker port: the narrow interface the gateway core consumes per
//! broker, plus per-broker capability flags and the registry that
//! constructs one client per (user, broker).

pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, sync::Arc, time::Duration};
use tokio::sync::broadcast;

pub use crate::error::BrokerError;

use crate::{
    models::{Action, DepthLevel, Mode, PriceType, Product},
};

/// Depth levels a client may request.
pub const DEPTH_LEVELS: [usize; 4] = [5, 20, 30, 50];

#[derive(Debug, Clone)]
pub struct BrokerCapabilities {
    /// Per-connection symbol cap C; total cap is C × pool_size.
    pub max_symbols_per_conn: usize,
    pub pool_size: usize,
    /// Brokers whose symbol caps are per-session keep the connection alive
    /// when the last client leaves and only soft-unsubscribe.
    pub retain_session_on_empty: bool,
    pub supported_depths: Vec<usize>,
    pub price_in_paise: bool,
    /// Divisor applied to every price field when `price_in_paise` is set.
    pub unit_conversion_factor: f64,
    pub heartbeat_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for BrokerCapabilities {
    fn default() -> Self {
        Self {
            max_symbols_per_conn: 1000,
            pool_size: 3,
            retain_session_on_empty: false,
            supported_depths: vec![5, 20],
            price_in_paise: false,
            unit_conversion_factor: 100.0,
            heartbeat_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerCapabilities {
    /// Resolve a requested depth level against broker support.
    ///
    /// Returns `(actual_depth, broker_supported)`: the requested level when
    /// supported, otherwise the deepest supported level below it (or the
    /// shallowest available). Truncation is not an error.
    pub fn best_depth(&self, requested: usize) -> (usize, bool) {
        if self.supported_depths.contains(&requested) {
            return (requested, true);
        }
        let below = self
            .supported_depths
            .iter()
            .copied()
            .filter(|&d| d < requested)
            .max();
        match below {
            Some(d) => (d, false),
            None => (
                self.supported_depths.iter().copied().min().unwrap_or(5),
                false,
            ),
        }
    }

    pub fn price_divisor(&self) -> f64 {
        if self.price_in_paise {
            self.unit_conversion_factor
        } else {
            1.0
        }
    }
}

/// Raw tick as delivered by a broker connection, before normalization.
/// Prices are in broker units (possibly paise).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTick {
    #[serde(default)]
    pub token: String,
    #[serde(default, alias = "exchange")]
    pub broker_exchange: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub depth_buy: Vec<DepthLevel>,
    #[serde(default)]
    pub depth_sell: Vec<DepthLevel>,
    /// Broker timestamp, unix ms. Ingestion time is substituted downstream
    /// when absent.
    #[serde(default)]
    pub ts_ms: Option<i64>,
    #[serde(skip)]
    pub slot: usize,
}

/// Connection-level events surfaced by a broker client to its adapter.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Tick(RawTick),
    SlotUp { slot: usize },
    SlotDown { slot: usize, reason: String },
    Heartbeat { slot: usize },
}

/// Live quote used for margin reference prices and trigger evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BrokerQuote {
    pub ltp: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
}

/// Real-order request shape on the port. The simulated engine never routes
/// these; they exist for live-mode callers of the same gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub token: String,
    pub broker_exchange: String,
    pub action: Action,
    pub quantity: u64,
    pub product: Product,
    pub pricetype: PriceType,
    pub price: f64,
    pub trigger_price: f64,
}

/// Port for live quotes keyed by user: the production impl routes through
/// the user's feed adapter, tests script the answers.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: &str,
    ) -> Result<BrokerQuote, BrokerError>;
}

/// Narrow port the core depends on, one instance per (user, broker).
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn broker(&self) -> &str;
    fn capabilities(&self) -> &BrokerCapabilities;

    /// Connection-level event stream (ticks, slot up/down, heartbeats).
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// (Re)establish the physical connection behind a pool slot.
    async fn connect_slot(&self, slot: usize) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        slot: usize,
        token: &str,
        broker_exchange: &str,
        mode: Mode,
        depth: usize,
    ) -> Result<(), BrokerError>;

    async fn unsubscribe(
        &self,
        slot: usize,
        token: &str,
        broker_exchange: &str,
        mode: Mode,
    ) -> Result<(), BrokerError>;

    /// Soft reset: drop every subscription but keep sessions alive.
    async fn unsubscribe_all(&self) -> Result<(), BrokerError>;

    async fn quote(&self, token: &str, broker_exchange: &str) -> Result<BrokerQuote, BrokerError>;

    async fn place_order(&self, req: &BrokerOrderRequest) -> Result<String, BrokerError>;
    async fn modify_order(&self, order_id: &str, req: &BrokerOrderRequest)
        -> Result<(), BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Tear down every session. Idempotent.
    async fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    pub url: String,
    pub capabilities: BrokerCapabilities,
}

/// Static registry of configured brokers; the proxy asks it for one client
/// per authenticated user.
pub struct BrokerRegistry {
    configs: HashMap<String, BrokerConfig>,
}

impl BrokerRegistry {
    pub fn new(configs: Vec<BrokerConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    /// Registry with the built-in `wsfeed` broker, configured from env.
    pub fn from_env() -> Self {
        let url = env::var("WSFEED_URL").unwrap_or_else(|_| "ws://127.0.0.1:9400/feed".into());
        let caps = BrokerCapabilities {
            max_symbols_per_conn: env::var("WSFEED_SYMBOLS_PER_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            pool_size: env::var("WSFEED_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            price_in_paise: env::var("WSFEED_PRICE_IN_PAISE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
                .unwrap_or(false),
            ..BrokerCapabilities::default()
        };
        Self::new(vec![BrokerConfig {
            name: "wsfeed".into(),
            url,
            capabilities: caps,
        }])
    }

    pub fn config(&self, broker: &str) -> Option<&BrokerConfig> {
        self.configs.get(broker)
    }

    /// Construct a fresh client for (user, broker). Creation is cheap; the
    /// physical connections dial lazily per pool slot.
    pub fn connect(
        &self,
        broker: &str,
        user_id: &str,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        let cfg = self
            .configs
            .get(broker)
            .ok_or_else(|| BrokerError::Broker(format!("unknown broker: {broker}")))?;
        Ok(ws::WsBroker::new(cfg.clone(), user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_depth_truncates_to_broker_cap() {
        let caps = BrokerCapabilities {
            supported_depths: vec![5, 20],
            ..Default::default()
        };
        assert_eq!(caps.best_depth(5), (5, true));
        assert_eq!(caps.best_depth(20), (20, true));
        assert_eq!(caps.best_depth(50), (20, false));
    }

    #[test]
    fn best_depth_rounds_up_when_nothing_below() {
        let caps = BrokerCapabilities {
            supported_depths: vec![20],
            ..Default::default()
        };
        assert_eq!(caps.best_depth(5), (20, false));
    }

    #[test]
    fn price_divisor_follows_paise_flag() {
        let mut caps = BrokerCapabilities::default();
        assert_eq!(caps.price_divisor(), 1.0);
        caps.price_in_paise = true;
        assert_eq!(caps.price_divisor(), 100.0);
    }

    #[test]
    fn registry_rejects_unknown_broker() {
        let registry = BrokerRegistry::new(vec![]);
        let err = match registry.connect("ghost", "u1") {
            Err(e) => e,
            Ok(_) => panic!("expected connect to fail for unknown broker"),
        };
        assert_eq!(err.code(), "BROKER_ERROR");
    }
}
