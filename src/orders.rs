//! Order acceptance: validation, lot-size and MIS-block checks, margin
//! blocking, persistence. The engine picks accepted orders up on its next
//! poll cycle.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::{
    broker::QuoteSource,
    config::SandboxConfig,
    error::EngineError,
    margin,
    models::{Action, OrderStatus, PriceType, Product, SimOrder},
    store::SandboxStore,
    symbols::SymbolResolver,
};

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub action: Action,
    pub quantity: u64,
    pub product: Product,
    pub pricetype: PriceType,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub trigger_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModifyOrderRequest {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub quantity: Option<u64>,
}

pub struct OrderService {
    store: Arc<SandboxStore>,
    resolver: Arc<SymbolResolver>,
    quotes: Arc<dyn QuoteSource>,
    cfg: SandboxConfig,
}

impl OrderService {
    pub fn new(
        store: Arc<SandboxStore>,
        resolver: Arc<SymbolResolver>,
        quotes: Arc<dyn QuoteSource>,
        cfg: SandboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            quotes,
            cfg,
        })
    }

    fn validate(req: &PlaceOrderRequest) -> Result<(), EngineError> {
        if req.quantity == 0 {
            return Err(EngineError::InvalidParameters("quantity must be > 0".into()));
        }
        match req.pricetype {
            PriceType::Limit if req.price <= 0.0 => Err(EngineError::InvalidParameters(
                "LIMIT orders need a price".into(),
            )),
            PriceType::Sl if req.price <= 0.0 || req.trigger_price <= 0.0 => {
                Err(EngineError::InvalidParameters(
                    "SL orders need price and trigger_price".into(),
                ))
            }
            PriceType::SlM if req.trigger_price <= 0.0 => Err(EngineError::InvalidParameters(
                "SL-M orders need a trigger_price".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Reference price for margin: the LIMIT price when available, else the
    /// live LTP.
    async fn reference_price(
        &self,
        user_id: &str,
        req: &PlaceOrderRequest,
    ) -> Result<f64, EngineError> {
        if req.pricetype == PriceType::Limit || req.pricetype == PriceType::Sl {
            return Ok(req.price);
        }
        let quote = self
            .quotes
            .quote(user_id, &req.symbol, &req.exchange)
            .await?;
        if quote.ltp <= 0.0 {
            return Err(EngineError::InvalidParameters(
                "no live price available for margin reference".into(),
            ));
        }
        Ok(quote.ltp)
    }

    pub async fn place(
        &self,
        user_id: &str,
        req: PlaceOrderRequest,
    ) -> Result<SimOrder, EngineError> {
        Self::validate(&req)?;

        let contract = self
            .resolver
            .lookup_any(&req.symbol, &req.exchange)
            .ok_or_else(|| {
                EngineError::SymbolNotFound(format!("{}:{}", req.exchange, req.symbol))
            })?;
        if req.quantity % contract.lot_size != 0 {
            return Err(EngineError::QuantityNotMultipleOfLot {
                quantity: req.quantity,
                lot_size: contract.lot_size,
            });
        }

        let now = Utc::now();
        if req.product == Product::Mis
            && self
                .store
                .mis_blocked(&req.exchange, now.timestamp())
                .await
                .map_err(|e| EngineError::Store(e.to_string()))?
        {
            return Err(EngineError::MisBlockedAfterSquareoff {
                exchange: req.exchange.clone(),
            });
        }

        self.store
            .ensure_funds(user_id, self.cfg.starting_capital)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let ref_price = self.reference_price(user_id, &req).await?;
        let margin = margin::margin_required(
            &self.cfg,
            &req.symbol,
            &req.exchange,
            req.action,
            req.quantity,
            ref_price,
            req.product,
        );

        let ts = now.timestamp_millis();
        let order = SimOrder {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: req.symbol,
            exchange: req.exchange,
            action: req.action,
            quantity: req.quantity,
            product: req.product,
            pricetype: req.pricetype,
            pricetype_submitted: req.pricetype,
            price: req.price,
            trigger_price: req.trigger_price,
            status: OrderStatus::Open,
            margin_blocked: margin,
            created_at: ts,
            updated_at: ts,
            fill_price: None,
            fill_ts: None,
        };

        self.store.accept_order(&order).await?;
        info!(
            user = user_id,
            order = %order.id,
            symbol = %order.symbol,
            action = order.action.as_str(),
            qty = order.quantity,
            pricetype = order.pricetype.as_str(),
            margin,
            "sandbox order accepted"
        );
        Ok(order)
    }

    pub async fn modify(
        &self,
        user_id: &str,
        order_id: &str,
        req: ModifyOrderRequest,
    ) -> Result<SimOrder, EngineError> {
        let order = self
            .store
            .order(user_id, order_id)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if order.status != OrderStatus::Open {
            return Err(EngineError::NotOpen);
        }

        let price = req.price.unwrap_or(order.price);
        let trigger = req.trigger_price.unwrap_or(order.trigger_price);
        let quantity = req.quantity.unwrap_or(order.quantity);
        if quantity == 0 {
            return Err(EngineError::InvalidParameters("quantity must be > 0".into()));
        }
        if let Some(contract) = self.resolver.lookup_any(&order.symbol, &order.exchange) {
            if quantity % contract.lot_size != 0 {
                return Err(EngineError::QuantityNotMultipleOfLot {
                    quantity,
                    lot_size: contract.lot_size,
                });
            }
        }

        let ref_price = if price > 0.0 {
            price
        } else {
            self.quotes
                .quote(user_id, &order.symbol, &order.exchange)
                .await?
                .ltp
        };
        let new_margin = margin::margin_required(
            &self.cfg,
            &order.symbol,
            &order.exchange,
            order.action,
            quantity,
            ref_price,
            order.product,
        );

        let ts = Utc::now().timestamp_millis();
        self.store
            .modify_order(user_id, order_id, price, trigger, quantity, new_margin, ts)
            .await?;
        self.store
            .order(user_id, order_id)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))
    }

    pub async fn cancel(&self, user_id: &str, order_id: &str) -> Result<SimOrder, EngineError> {
        let ts = Utc::now().timestamp_millis();
        let order = self.store.cancel_order(user_id, order_id, ts).await?;
        info!(user = user_id, order = order_id, "sandbox order cancelled");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerQuote};
    use crate::symbols::SymbolContract;
    use async_trait::async_trait;

    struct FixedQuotes {
        ltp: f64,
    }

    #[async_trait]
    impl QuoteSource for FixedQuotes {
        async fn quote(
            &self,
            _user_id: &str,
            _symbol: &str,
            _exchange: &str,
        ) -> Result<BrokerQuote, BrokerError> {
            Ok(BrokerQuote {
                ltp: self.ltp,
                bid: Some(self.ltp - 0.5),
                ask: Some(self.ltp + 0.5),
                ..Default::default()
            })
        }
    }

    fn service(ltp: f64) -> (Arc<OrderService>, Arc<SandboxStore>, Vec<tempfile::NamedTempFile>) {
        let db = tempfile::NamedTempFile::new().unwrap();
        let sym_db = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(SandboxStore::new(db.path().to_str().unwrap()).unwrap());
        let resolver = Arc::new(SymbolResolver::new(sym_db.path().to_str().unwrap()).unwrap());
        resolver
            .upsert_contracts(&[
                SymbolContract {
                    symbol: "RELIANCE".into(),
                    exchange: "NSE".into(),
                    broker: "mock".into(),
                    broker_token: "2885".into(),
                    broker_exchange: "NSE".into(),
                    lot_size: 1,
                    tick_size: 0.05,
                },
                SymbolContract {
                    symbol: "NIFTY25AUGFUT".into(),
                    exchange: "NFO".into(),
                    broker: "mock".into(),
                    broker_token: "53001".into(),
                    broker_exchange: "NFO".into(),
                    lot_size: 75,
                    tick_size: 0.05,
                },
            ])
            .unwrap();
        let svc = OrderService::new(
            store.clone(),
            resolver,
            Arc::new(FixedQuotes { ltp }),
            SandboxConfig::default(),
        );
        (svc, store, vec![db, sym_db])
    }

    fn buy_market(symbol: &str, exchange: &str, qty: u64) -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: symbol.into(),
            exchange: exchange.into(),
            action: Action::Buy,
            quantity: qty,
            product: Product::Mis,
            pricetype: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
        }
    }

    #[tokio::test]
    async fn market_order_blocks_ltp_margin() {
        let (svc, store, _f) = service(2500.0);
        let order = svc.place("u1", buy_market("RELIANCE", "NSE", 100)).await.unwrap();
        // 100 × 2500 / 5 = 50,000 at default equity MIS leverage.
        assert_eq!(order.margin_blocked, 50_000.0);
        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.available, 10_000_000.0 - 50_000.0);
    }

    #[tokio::test]
    async fn lot_size_is_enforced() {
        let (svc, _store, _f) = service(24_000.0);
        let err = svc
            .place("u1", buy_market("NIFTY25AUGFUT", "NFO", 70))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUANTITY_NOT_MULTIPLE_OF_LOT");

        svc.place("u1", buy_market("NIFTY25AUGFUT", "NFO", 75))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected() {
        let (svc, _store, _f) = service(100.0);
        let err = svc.place("u1", buy_market("GHOST", "NSE", 1)).await.unwrap_err();
        assert_eq!(err.code(), "SYMBOL_NOT_FOUND");
    }

    #[tokio::test]
    async fn limit_order_uses_its_own_price_for_margin() {
        let (svc, _store, _f) = service(2500.0);
        let mut req = buy_market("RELIANCE", "NSE", 100);
        req.pricetype = PriceType::Limit;
        req.price = 2000.0;
        let order = svc.place("u1", req).await.unwrap();
        assert_eq!(order.margin_blocked, 40_000.0);
    }

    #[tokio::test]
    async fn mis_block_rejects_after_squareoff() {
        let (svc, store, _f) = service(2500.0);
        let until = Utc::now().timestamp() + 3600;
        store.set_mis_block("NSE", "2026-08-01", until).await.unwrap();

        let err = svc.place("u1", buy_market("RELIANCE", "NSE", 10)).await.unwrap_err();
        assert_eq!(err.code(), "MIS_BLOCKED_AFTER_SQUAREOFF");

        // CNC is unaffected by the MIS block.
        let mut req = buy_market("RELIANCE", "NSE", 10);
        req.product = Product::Cnc;
        svc.place("u1", req).await.unwrap();
    }

    #[tokio::test]
    async fn insufficient_funds_rejects_cleanly() {
        let (svc, store, _f) = service(2500.0);
        let mut req = buy_market("RELIANCE", "NSE", 100_000);
        req.product = Product::Cnc; // 250M notional, capital is 10M.
        let err = svc.place("u1", req).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");

        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.available, 10_000_000.0);
        assert!(store.orderbook("u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn modify_reblocks_margin_delta() {
        let (svc, store, _f) = service(2500.0);
        let order = svc.place("u1", buy_market("RELIANCE", "NSE", 100)).await.unwrap();

        let modified = svc
            .modify(
                "u1",
                &order.id,
                ModifyOrderRequest {
                    price: Some(2000.0),
                    trigger_price: None,
                    quantity: Some(50),
                },
            )
            .await
            .unwrap();
        assert_eq!(modified.quantity, 50);
        assert_eq!(modified.margin_blocked, 20_000.0);

        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.used_margin, 20_000.0);
        assert!(funds.invariant_holds());
    }

    #[tokio::test]
    async fn place_then_cancel_restores_funds() {
        let (svc, store, _f) = service(2500.0);
        let order = svc.place("u1", buy_market("RELIANCE", "NSE", 100)).await.unwrap();
        svc.cancel("u1", &order.id).await.unwrap();

        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.available, 10_000_000.0);
        assert_eq!(funds.used_margin, 0.0);
        assert!(store.positions("u1").await.unwrap().is_empty());
    }
}
