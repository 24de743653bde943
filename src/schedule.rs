//! Cron-like background jobs, all interpreted in IST: per-exchange MIS
//! square-off, T+1 settlement of CNC positions, catch-up settlement at
//! startup, and the weekly capital reset. Every job is idempotent via a
//! per-period marker row.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveTime};
use std::{sync::Arc, time::Duration};
use tokio::time::interval;
use tracing::{info, warn};

use crate::{config::ist_now, config::SandboxConfig, engine::ExecutionEngine, store::SandboxStore};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn date_key(now: &DateTime<FixedOffset>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn week_key(now: &DateTime<FixedOffset>) -> String {
    let week = now.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Start of the current IST day, unix milliseconds.
fn start_of_day_ms(now: &DateTime<FixedOffset>) -> i64 {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_local_timezone(now.timezone())
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

/// 09:00 IST on the next calendar day, unix seconds: the end of a MIS
/// block window.
fn next_day_0900_ts(now: &DateTime<FixedOffset>) -> i64 {
    let next = now.date_naive() + ChronoDuration::days(1);
    next.and_hms_opt(9, 0, 0)
        .expect("09:00 exists")
        .and_local_timezone(now.timezone())
        .single()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| now.timestamp() + 86_400)
}

pub struct Scheduler {
    store: Arc<SandboxStore>,
    engine: Arc<ExecutionEngine>,
    cfg: SandboxConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<SandboxStore>,
        engine: Arc<ExecutionEngine>,
        cfg: SandboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self { store, engine, cfg })
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("scheduler started (IST)");
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.tick(ist_now()).await {
                    warn!(error = %e, "scheduler sweep failed");
                }
            }
        })
    }

    /// One sweep at `now`. Split out for deterministic tests.
    pub async fn tick(&self, now: DateTime<FixedOffset>) -> Result<()> {
        let today = date_key(&now);

        // Per-exchange MIS square-off.
        let square_offs: Vec<(String, NaiveTime)> = self
            .cfg
            .square_off_times
            .iter()
            .map(|(e, t)| (e.clone(), *t))
            .collect();
        for (exchange, at) in square_offs {
            if now.time() < at {
                continue;
            }
            let job = format!("square_off:{exchange}");
            if self.store.job_done(&job, &today).await? {
                continue;
            }
            self.run_square_off(&exchange, &now).await?;
            self.store
                .mark_job_done(&job, &today, now.timestamp())
                .await?;
        }

        // T+1 settlement at midnight (the per-date marker makes the first
        // sweep of the day do the work; a mid-day cold start settles as the
        // catch-up pass would).
        if !self.store.job_done("t1_settlement", &today).await? {
            let settled = self
                .store
                .settle_cnc_positions(start_of_day_ms(&now), now.timestamp_millis())
                .await?;
            if settled > 0 {
                info!(settled, "T+1 settlement moved CNC positions to holdings");
            }
            self.store
                .mark_job_done("t1_settlement", &today, now.timestamp())
                .await?;
        }

        // Weekly capital reset.
        if now.weekday() == self.cfg.reset_weekday && now.time() >= self.cfg.reset_time {
            let week = week_key(&now);
            if !self.store.job_done("capital_reset", &week).await? {
                let users = self.store.reset_capital(self.cfg.starting_capital).await?;
                info!(users, week = %week, "weekly capital reset");
                self.store
                    .mark_job_done("capital_reset", &week, now.timestamp())
                    .await?;
            }
        }

        Ok(())
    }

    /// Catch-up at startup: anything a downed process missed — CNC
    /// positions older than a day settle immediately.
    pub async fn run_catchup(&self) -> Result<()> {
        let now = ist_now();
        let settled = self
            .store
            .settle_cnc_positions(start_of_day_ms(&now), now.timestamp_millis())
            .await?;
        if settled > 0 {
            info!(settled, "catch-up settlement at startup");
        }
        self.store
            .mark_job_done("t1_settlement", &date_key(&now), now.timestamp())
            .await?;
        Ok(())
    }

    async fn run_square_off(&self, exchange: &str, now: &DateTime<FixedOffset>) -> Result<()> {
        let cancelled = self
            .store
            .cancel_open_mis_orders(exchange, now.timestamp_millis())
            .await?;

        let positions = self.store.open_mis_positions(exchange).await?;
        let mut closed = 0usize;
        for pos in &positions {
            match self.engine.force_close_position(pos).await {
                Ok(()) => closed += 1,
                Err(e) => warn!(
                    user = %pos.user_id,
                    symbol = %pos.symbol,
                    error = %e,
                    "square-off close failed"
                ),
            }
        }

        self.store
            .set_mis_block(exchange, &date_key(now), next_day_0900_ts(now))
            .await?;
        info!(
            exchange,
            cancelled = cancelled.len(),
            closed,
            at = %now.format("%H:%M"),
            "MIS square-off complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerQuote, QuoteSource};
    use crate::config::ist;
    use crate::models::{Action, OrderStatus, PriceType, Product, SimOrder};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FixedQuotes(f64);

    #[async_trait]
    impl QuoteSource for FixedQuotes {
        async fn quote(
            &self,
            _u: &str,
            _s: &str,
            _e: &str,
        ) -> Result<BrokerQuote, BrokerError> {
            Ok(BrokerQuote {
                ltp: self.0,
                bid: Some(self.0),
                ask: Some(self.0),
                ..Default::default()
            })
        }
    }

    fn ist_at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<FixedOffset> {
        ist().with_ymd_and_hms(y, m, d, hh, mm, 0).unwrap()
    }

    async fn fixture(ltp: f64) -> (Arc<Scheduler>, Arc<SandboxStore>, Vec<tempfile::NamedTempFile>) {
        let db = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(SandboxStore::new(db.path().to_str().unwrap()).unwrap());
        store.ensure_funds("u1", 10_000_000.0).await.unwrap();
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(FixedQuotes(ltp)),
            SandboxConfig::default(),
        );
        let scheduler = Scheduler::new(store.clone(), engine, SandboxConfig::default());
        (scheduler, store, vec![db])
    }

    fn mis_order(id: &str, symbol: &str) -> SimOrder {
        SimOrder {
            id: id.into(),
            user_id: "u1".into(),
            symbol: symbol.into(),
            exchange: "NSE".into(),
            action: Action::Buy,
            quantity: 10,
            product: Product::Mis,
            pricetype: PriceType::Limit,
            pricetype_submitted: PriceType::Limit,
            price: 90.0,
            trigger_price: 0.0,
            status: OrderStatus::Open,
            margin_blocked: 180.0,
            created_at: 1_000,
            updated_at: 1_000,
            fill_price: None,
            fill_ts: None,
        }
    }

    #[tokio::test]
    async fn square_off_cancels_closes_and_blocks_once() {
        let (scheduler, store, _f) = fixture(100.0).await;

        // An open MIS order and an open MIS position.
        store.accept_order(&mis_order("o1", "SBIN")).await.unwrap();
        let mut fill_me = mis_order("o2", "INFY");
        fill_me.pricetype = PriceType::Market;
        store.accept_order(&fill_me).await.unwrap();
        store
            .apply_fill("o2", 100.0, 1_500, &SandboxConfig::default())
            .await
            .unwrap();

        // Before 15:15 nothing happens for NSE.
        scheduler.tick(ist_at(2026, 8, 3, 15, 0)).await.unwrap();
        assert_eq!(
            store.order("u1", "o1").await.unwrap().unwrap().status,
            OrderStatus::Open
        );

        // At 15:20 the square-off runs.
        let now = ist_at(2026, 8, 3, 15, 20);
        scheduler.tick(now).await.unwrap();
        assert_eq!(
            store.order("u1", "o1").await.unwrap().unwrap().status,
            OrderStatus::Cancelled
        );
        let positions = store.positions("u1").await.unwrap();
        assert!(positions.iter().all(|p| p.quantity == 0));
        assert!(store.mis_blocked("NSE", now.timestamp()).await.unwrap());

        // 15:30 same day: still blocked; 09:05 next day: clear.
        let at_1530 = ist_at(2026, 8, 3, 15, 30).timestamp();
        assert!(store.mis_blocked("NSE", at_1530).await.unwrap());
        let at_0905 = ist_at(2026, 8, 4, 9, 5).timestamp();
        assert!(!store.mis_blocked("NSE", at_0905).await.unwrap());

        // Re-running the sweep is a no-op (marker).
        scheduler.tick(ist_at(2026, 8, 3, 15, 40)).await.unwrap();
        let funds = store.funds("u1").await.unwrap().unwrap();
        assert!(funds.invariant_holds());
    }

    #[tokio::test]
    async fn t1_settles_yesterdays_cnc_not_todays() {
        let (scheduler, store, _f) = fixture(1500.0).await;
        let cfg = SandboxConfig::default();

        let yesterday_fill = ist_at(2026, 8, 2, 10, 0).timestamp_millis();
        let mut old = mis_order("o1", "INFY");
        old.product = Product::Cnc;
        old.pricetype = PriceType::Market;
        old.margin_blocked = 15_000.0;
        store.accept_order(&old).await.unwrap();
        store.apply_fill("o1", 1500.0, yesterday_fill, &cfg).await.unwrap();

        let today_fill = ist_at(2026, 8, 3, 10, 0).timestamp_millis();
        let mut fresh = mis_order("o2", "TCS");
        fresh.product = Product::Cnc;
        fresh.pricetype = PriceType::Market;
        fresh.margin_blocked = 30_000.0;
        store.accept_order(&fresh).await.unwrap();
        store.apply_fill("o2", 3000.0, today_fill, &cfg).await.unwrap();

        scheduler.tick(ist_at(2026, 8, 3, 0, 1)).await.unwrap();

        let holdings = store.holdings("u1").await.unwrap();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].symbol, "INFY");
        assert_eq!(holdings[0].quantity, 10);
        assert_eq!(holdings[0].avg_price, 1500.0);

        // Today's CNC buy is still a position.
        let positions = store.positions("u1").await.unwrap();
        assert!(positions.iter().any(|p| p.symbol == "TCS" && p.quantity == 10));
    }

    #[tokio::test]
    async fn weekly_reset_runs_on_configured_weekday_once() {
        let (scheduler, store, _f) = fixture(100.0).await;

        let mut fill_me = mis_order("o1", "SBIN");
        fill_me.pricetype = PriceType::Market;
        store.accept_order(&fill_me).await.unwrap();
        store
            .apply_fill("o1", 90.0, 1_500, &SandboxConfig::default())
            .await
            .unwrap();

        // Saturday: no reset.
        scheduler.tick(ist_at(2026, 8, 1, 12, 0)).await.unwrap();
        assert_ne!(
            store.funds("u1").await.unwrap().unwrap().used_margin,
            0.0
        );

        // Sunday (default reset weekday): reset runs.
        scheduler.tick(ist_at(2026, 8, 2, 0, 30)).await.unwrap();
        let funds = store.funds("u1").await.unwrap().unwrap();
        assert_eq!(funds.capital, 10_000_000.0);
        assert_eq!(funds.available, 10_000_000.0);
        assert_eq!(funds.used_margin, 0.0);
    }

    #[test]
    fn period_keys_are_stable() {
        let now = ist_at(2026, 8, 3, 15, 20);
        assert_eq!(date_key(&now), "2026-08-03");
        assert_eq!(week_key(&now), "2026-W32");
        assert_eq!(
            next_day_0900_ts(&now),
            ist_at(2026, 8, 4, 9, 0).timestamp()
        );
    }
}
