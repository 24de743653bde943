//! Simulated execution engine: polls pending orders, evaluates trigger
//! rules against live quotes, executes fills through the store's atomic
//! fill transaction, and sweeps open positions for mark-to-market.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    broker::{BrokerError, BrokerQuote, QuoteSource},
    config::SandboxConfig,
    models::{Action, Position, PriceType, SimOrder},
    proxy::ProxyState,
    store::SandboxStore,
};

/// Quote routing through the per-user feed adapters the proxy owns.
pub struct AdapterQuoteSource {
    state: Arc<ProxyState>,
}

impl AdapterQuoteSource {
    pub fn new(state: Arc<ProxyState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

#[async_trait]
impl QuoteSource for AdapterQuoteSource {
    async fn quote(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: &str,
    ) -> Result<BrokerQuote, BrokerError> {
        let adapter = self
            .state
            .adapters
            .lock()
            .await
            .get(user_id)
            .cloned()
            .ok_or(BrokerError::NotConnected)?;
        adapter.quote(symbol, exchange).await
    }
}

/// What the current quote means for an open order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    /// No trigger condition met; stays open.
    Hold,
    /// SL/SL-M trigger fired but the armed order cannot fill on this quote;
    /// rewrite it to the armed pricetype.
    Arm(PriceType),
    /// Fill now at this price.
    Fill(f64),
}

fn market_price(action: Action, quote: &BrokerQuote) -> f64 {
    let side = match action {
        Action::Buy => quote.ask,
        Action::Sell => quote.bid,
    };
    side.filter(|p| *p > 0.0).unwrap_or(quote.ltp)
}

fn limit_eval(action: Action, price: f64, ltp: f64) -> Evaluation {
    match action {
        Action::Buy if ltp <= price => Evaluation::Fill(price.min(ltp)),
        Action::Sell if ltp >= price => Evaluation::Fill(price.max(ltp)),
        _ => Evaluation::Hold,
    }
}

fn trigger_armed(action: Action, trigger: f64, ltp: f64) -> bool {
    match action {
        // SL BUY arms when the price rises through the trigger.
        Action::Buy => ltp >= trigger,
        // SL SELL arms when it falls through.
        Action::Sell => ltp <= trigger,
    }
}

/// Evaluate one open order against a quote. Arming and filling are checked
/// on the same quote, so an SL that arms into an immediately marketable
/// limit fills in the same cycle.
pub fn evaluate(order: &SimOrder, quote: &BrokerQuote) -> Evaluation {
    if quote.ltp <= 0.0 {
        return Evaluation::Hold;
    }
    match order.pricetype {
        PriceType::Market => Evaluation::Fill(market_price(order.action, quote)),
        PriceType::Limit => limit_eval(order.action, order.price, quote.ltp),
        PriceType::Sl => {
            if !trigger_armed(order.action, order.trigger_price, quote.ltp) {
                return Evaluation::Hold;
            }
            match limit_eval(order.action, order.price, quote.ltp) {
                Evaluation::Fill(p) => Evaluation::Fill(p),
                _ => Evaluation::Arm(PriceType::Limit),
            }
        }
        PriceType::SlM => {
            if trigger_armed(order.action, order.trigger_price, quote.ltp) {
                Evaluation::Fill(market_price(order.action, quote))
            } else {
                Evaluation::Hold
            }
        }
    }
}

pub struct ExecutionEngine {
    store: Arc<SandboxStore>,
    quotes: Arc<dyn QuoteSource>,
    cfg: SandboxConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<SandboxStore>,
        quotes: Arc<dyn QuoteSource>,
        cfg: SandboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self { store, quotes, cfg })
    }

    /// Single cooperative loop: order checks on `check_interval_ms`, MTM on
    /// `mtm_interval_ms`. Cycles never overlap; a cycle that overruns its
    /// interval logs and the next starts immediately.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut check = interval(Duration::from_millis(engine.cfg.check_interval_ms.max(100)));
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut mtm = interval(Duration::from_millis(engine.cfg.mtm_interval_ms.max(100)));
            mtm.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                check_ms = engine.cfg.check_interval_ms,
                mtm_ms = engine.cfg.mtm_interval_ms,
                "execution engine started"
            );
            loop {
                tokio::select! {
                    _ = check.tick() => {
                        let started = Instant::now();
                        if let Err(e) = engine.check_cycle().await {
                            warn!(error = %e, "order check cycle failed");
                        }
                        let elapsed = started.elapsed();
                        if elapsed > Duration::from_millis(engine.cfg.check_interval_ms) {
                            warn!(
                                elapsed_ms = elapsed.as_millis() as u64,
                                interval_ms = engine.cfg.check_interval_ms,
                                "order check cycle overran its interval"
                            );
                        }
                    }
                    _ = mtm.tick() => {
                        if let Err(e) = engine.mtm_cycle().await {
                            warn!(error = %e, "mtm sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// One poll cycle: open orders grouped by (symbol, exchange) for quote
    /// reuse, each evaluated and filled/armed as the quote dictates.
    pub async fn check_cycle(&self) -> Result<usize> {
        let open = self.store.open_orders().await?;
        if open.is_empty() {
            return Ok(0);
        }

        let mut groups: HashMap<(String, String), Vec<SimOrder>> = HashMap::new();
        for order in open {
            groups
                .entry((order.symbol.clone(), order.exchange.clone()))
                .or_default()
                .push(order);
        }

        let mut fills = 0usize;
        for ((symbol, exchange), orders) in groups {
            let quote = match self
                .quotes
                .quote(&orders[0].user_id, &symbol, &exchange)
                .await
            {
                Ok(q) => q,
                Err(e) => {
                    debug!(symbol, exchange, error = %e, "no quote this cycle");
                    continue;
                }
            };

            for order in orders {
                let ts = Utc::now().timestamp_millis();
                match evaluate(&order, &quote) {
                    Evaluation::Hold => {}
                    Evaluation::Arm(armed_as) => {
                        debug!(order = %order.id, armed_as = armed_as.as_str(), ltp = quote.ltp, "trigger armed");
                        self.store.arm_order(&order.id, armed_as, ts).await?;
                    }
                    Evaluation::Fill(price) => {
                        match self.store.apply_fill(&order.id, price, ts, &self.cfg).await {
                            Ok(report) => {
                                fills += 1;
                                info!(
                                    order = %report.order_id,
                                    symbol = %order.symbol,
                                    price,
                                    qty = order.quantity,
                                    realized = report.realized,
                                    "order filled"
                                );
                            }
                            Err(e) => {
                                // The order stays open and is retried next
                                // cycle; the transaction rolled back.
                                warn!(order = %order.id, error = %e, "fill failed, will retry");
                            }
                        }
                    }
                }
            }
        }
        Ok(fills)
    }

    /// Sweep open positions, recompute sign-aware MTM, push per-user
    /// unrealized P&L into funds.
    pub async fn mtm_cycle(&self) -> Result<usize> {
        let positions = self.store.open_positions().await?;
        if positions.is_empty() {
            return Ok(0);
        }

        let mut quote_cache: HashMap<(String, String), BrokerQuote> = HashMap::new();
        let mut marks: Vec<(Position, f64, f64)> = Vec::with_capacity(positions.len());
        for pos in positions {
            let key = (pos.symbol.clone(), pos.exchange.clone());
            let cached = quote_cache.get(&key).copied();
            let quote = match cached {
                Some(q) => q,
                None => {
                    match self.quotes.quote(&pos.user_id, &pos.symbol, &pos.exchange).await {
                        Ok(q) => {
                            quote_cache.insert(key, q);
                            q
                        }
                        Err(_) => continue,
                    }
                }
            };
            if quote.ltp <= 0.0 {
                continue;
            }
            let mtm = (quote.ltp - pos.avg_price) * pos.quantity as f64;
            marks.push((pos, quote.ltp, mtm));
        }

        let n = marks.len();
        if n > 0 {
            self.store.update_marks(&marks).await?;
        }
        Ok(n)
    }

    /// Force-close a position through the normal fill path with a synthetic
    /// market order (square-off). Falls back to the last marked price when
    /// no live quote is available.
    pub async fn force_close_position(&self, pos: &Position) -> Result<(), crate::error::EngineError> {
        if pos.quantity == 0 {
            return Ok(());
        }
        let action = if pos.quantity > 0 {
            Action::Sell
        } else {
            Action::Buy
        };
        let ts = Utc::now().timestamp_millis();
        let order = SimOrder {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: pos.user_id.clone(),
            symbol: pos.symbol.clone(),
            exchange: pos.exchange.clone(),
            action,
            quantity: pos.quantity.unsigned_abs(),
            product: pos.product,
            pricetype: PriceType::Market,
            pricetype_submitted: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            status: crate::models::OrderStatus::Open,
            // Closing an existing position; no fresh margin is blocked.
            margin_blocked: 0.0,
            created_at: ts,
            updated_at: ts,
            fill_price: None,
            fill_ts: None,
        };
        self.store.accept_order(&order).await?;

        let price = match self
            .quotes
            .quote(&pos.user_id, &pos.symbol, &pos.exchange)
            .await
        {
            Ok(q) if q.ltp > 0.0 => market_price(action, &q),
            _ => pos.ltp.max(pos.avg_price),
        };
        let report = self.store.apply_fill(&order.id, price, ts, &self.cfg).await?;
        info!(
            user = %pos.user_id,
            symbol = %pos.symbol,
            price,
            realized = report.realized,
            "position force-closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, Product};
    use parking_lot::Mutex;

    struct ScriptedQuotes {
        ltp: Mutex<f64>,
    }

    impl ScriptedQuotes {
        fn new(ltp: f64) -> Arc<Self> {
            Arc::new(Self {
                ltp: Mutex::new(ltp),
            })
        }
        fn set(&self, ltp: f64) {
            *self.ltp.lock() = ltp;
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedQuotes {
        async fn quote(
            &self,
            _user: &str,
            _symbol: &str,
            _exchange: &str,
        ) -> Result<BrokerQuote, BrokerError> {
            let ltp = *self.ltp.lock();
            Ok(BrokerQuote {
                ltp,
                bid: Some(ltp),
                ask: Some(ltp),
                ..Default::default()
            })
        }
    }

    fn quote(ltp: f64, bid: f64, ask: f64) -> BrokerQuote {
        BrokerQuote {
            ltp,
            bid: Some(bid),
            ask: Some(ask),
            ..Default::default()
        }
    }

    fn order(action: Action, pricetype: PriceType, price: f64, trigger: f64) -> SimOrder {
        SimOrder {
            id: "o".into(),
            user_id: "u1".into(),
            symbol: "SBIN".into(),
            exchange: "NSE".into(),
            action,
            quantity: 50,
            product: Product::Mis,
            pricetype,
            pricetype_submitted: pricetype,
            price,
            trigger_price: trigger,
            status: OrderStatus::Open,
            margin_blocked: 0.0,
            created_at: 0,
            updated_at: 0,
            fill_price: None,
            fill_ts: None,
        }
    }

    #[test]
    fn market_fills_at_touch() {
        let o = order(Action::Buy, PriceType::Market, 0.0, 0.0);
        assert_eq!(evaluate(&o, &quote(100.0, 99.0, 101.0)), Evaluation::Fill(101.0));

        let o = order(Action::Sell, PriceType::Market, 0.0, 0.0);
        assert_eq!(evaluate(&o, &quote(100.0, 99.0, 101.0)), Evaluation::Fill(99.0));

        // No book: fall back to LTP.
        let o = order(Action::Buy, PriceType::Market, 0.0, 0.0);
        let q = BrokerQuote {
            ltp: 100.0,
            ..Default::default()
        };
        assert_eq!(evaluate(&o, &q), Evaluation::Fill(100.0));
    }

    #[test]
    fn limit_buy_fills_at_or_below_price() {
        let o = order(Action::Buy, PriceType::Limit, 100.0, 0.0);
        assert_eq!(evaluate(&o, &quote(101.0, 0.0, 0.0)), Evaluation::Hold);
        assert_eq!(evaluate(&o, &quote(100.0, 0.0, 0.0)), Evaluation::Fill(100.0));
        // Better than limit: filled at the better price.
        assert_eq!(evaluate(&o, &quote(98.0, 0.0, 0.0)), Evaluation::Fill(98.0));
    }

    #[test]
    fn limit_sell_fills_at_or_above_price() {
        let o = order(Action::Sell, PriceType::Limit, 100.0, 0.0);
        assert_eq!(evaluate(&o, &quote(99.0, 0.0, 0.0)), Evaluation::Hold);
        assert_eq!(evaluate(&o, &quote(103.0, 0.0, 0.0)), Evaluation::Fill(103.0));
    }

    #[test]
    fn sl_sell_arms_and_fills_on_same_quote() {
        // Scenario: trigger 990, price 985; LTP 995 → hold, 992 → hold,
        // 989 → armed and immediately marketable, fills at 989.
        let o = order(Action::Sell, PriceType::Sl, 985.0, 990.0);
        assert_eq!(evaluate(&o, &quote(995.0, 0.0, 0.0)), Evaluation::Hold);
        assert_eq!(evaluate(&o, &quote(992.0, 0.0, 0.0)), Evaluation::Hold);
        assert_eq!(evaluate(&o, &quote(989.0, 0.0, 0.0)), Evaluation::Fill(989.0));
    }

    #[test]
    fn sl_buy_arms_without_fill_when_limit_away() {
        // Trigger 100, limit 95: arming quote is above the limit, so the
        // order converts to LIMIT and waits.
        let o = order(Action::Buy, PriceType::Sl, 95.0, 100.0);
        assert_eq!(evaluate(&o, &quote(99.0, 0.0, 0.0)), Evaluation::Hold);
        assert_eq!(
            evaluate(&o, &quote(101.0, 0.0, 0.0)),
            Evaluation::Arm(PriceType::Limit)
        );
    }

    #[test]
    fn sl_m_fills_as_market_on_trigger() {
        let o = order(Action::Sell, PriceType::SlM, 0.0, 990.0);
        assert_eq!(evaluate(&o, &quote(995.0, 994.0, 996.0)), Evaluation::Hold);
        assert_eq!(
            evaluate(&o, &quote(989.0, 988.0, 990.0)),
            Evaluation::Fill(988.0)
        );
    }

    async fn engine_fixture(
        ltp: f64,
    ) -> (
        Arc<ExecutionEngine>,
        Arc<SandboxStore>,
        Arc<ScriptedQuotes>,
        Vec<tempfile::NamedTempFile>,
    ) {
        let db = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(SandboxStore::new(db.path().to_str().unwrap()).unwrap());
        store.ensure_funds("u1", 10_000_000.0).await.unwrap();
        let quotes = ScriptedQuotes::new(ltp);
        let engine = ExecutionEngine::new(store.clone(), quotes.clone(), SandboxConfig::default());
        (engine, store, quotes, vec![db])
    }

    #[tokio::test]
    async fn sl_sell_scenario_realizes_minus_550() {
        let (engine, store, quotes, _f) = engine_fixture(1000.0).await;

        // Build the long 50 @ 1000 through the fill path.
        let mut open = order(Action::Buy, PriceType::Market, 0.0, 0.0);
        open.id = "buy1".into();
        open.margin_blocked = 10_000.0;
        store.accept_order(&open).await.unwrap();
        engine.check_cycle().await.unwrap();

        // SL SELL 50, trigger 990, price 985.
        let mut sl = order(Action::Sell, PriceType::Sl, 985.0, 990.0);
        sl.id = "sl1".into();
        store.accept_order(&sl).await.unwrap();

        quotes.set(995.0);
        engine.check_cycle().await.unwrap();
        assert_eq!(
            store.order("u1", "sl1").await.unwrap().unwrap().status,
            OrderStatus::Open
        );

        quotes.set(992.0);
        engine.check_cycle().await.unwrap();
        assert_eq!(
            store.order("u1", "sl1").await.unwrap().unwrap().status,
            OrderStatus::Open
        );

        quotes.set(989.0);
        engine.check_cycle().await.unwrap();
        let filled = store.order("u1", "sl1").await.unwrap().unwrap();
        assert_eq!(filled.status, OrderStatus::Completed);
        assert_eq!(filled.fill_price, Some(989.0));

        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.realized_pnl_today, -550.0);
        assert_eq!(funds.used_margin, 0.0);
        assert!(funds.invariant_holds());

        let positions = store.positions("u1").await.unwrap();
        assert_eq!(positions[0].quantity, 0);
    }

    #[tokio::test]
    async fn mtm_sweep_updates_marks_and_unrealized() {
        let (engine, store, quotes, _f) = engine_fixture(1000.0).await;

        let mut open = order(Action::Buy, PriceType::Market, 0.0, 0.0);
        open.id = "buy1".into();
        open.margin_blocked = 10_000.0;
        store.accept_order(&open).await.unwrap();
        engine.check_cycle().await.unwrap();

        quotes.set(1010.0);
        let marked = engine.mtm_cycle().await.unwrap();
        assert_eq!(marked, 1);

        let pos = &store.positions("u1").await.unwrap()[0];
        assert_eq!(pos.ltp, 1010.0);
        assert_eq!(pos.mtm, 500.0);
        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.unrealized_pnl, 500.0);
    }

    #[tokio::test]
    async fn force_close_flattens_via_fill_path() {
        let (engine, store, quotes, _f) = engine_fixture(1000.0).await;

        let mut open = order(Action::Buy, PriceType::Market, 0.0, 0.0);
        open.id = "buy1".into();
        open.margin_blocked = 10_000.0;
        store.accept_order(&open).await.unwrap();
        engine.check_cycle().await.unwrap();

        quotes.set(1020.0);
        let pos = store.positions("u1").await.unwrap()[0].clone();
        engine.force_close_position(&pos).await.unwrap();

        let pos = &store.positions("u1").await.unwrap()[0];
        assert_eq!(pos.quantity, 0);
        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.realized_pnl_today, 1000.0);
        assert_eq!(funds.used_margin, 0.0);
        assert!(funds.invariant_holds());

        // A trade exists for the synthetic close.
        let trades = store.tradebook("u1", 10).await.unwrap();
        assert_eq!(trades.len(), 2);
    }
}
