//! Durable sandbox state: orders, trades, positions, holdings, funds,
//! config and job markers, all in one sqlite database.
//!
//! Every engine write path is a single transaction across the affected
//! tables; a fill commits order + trade + position + funds atomically.
//! Committed writes that change funds or positions publish a `StoreEvent`
//! so UI-facing caches can refresh; correctness never depends on it.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{
    config::SandboxConfig,
    error::EngineError,
    margin,
    models::{
        round_paise, Action, Funds, Holding, OrderStatus, Position, PriceType, Product, SimOrder,
        SimTrade,
    },
    netting,
};

/// Cache-invalidation notifications for committed writes.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    OrdersChanged { user_id: String },
    PositionsChanged { user_id: String },
    FundsChanged { user_id: String },
}

#[derive(Debug, Clone)]
pub struct FillReport {
    pub trade_id: String,
    pub order_id: String,
    pub realized: f64,
    pub position_qty: i64,
    pub funds: Funds,
}

#[derive(Clone)]
pub struct SandboxStore {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<StoreEvent>,
}

fn parse_action(s: &str) -> Action {
    if s == "SELL" {
        Action::Sell
    } else {
        Action::Buy
    }
}

fn parse_product(s: &str) -> Product {
    match s {
        "MIS" => Product::Mis,
        "NRML" => Product::Nrml,
        _ => Product::Cnc,
    }
}

fn parse_pricetype(s: &str) -> PriceType {
    match s {
        "LIMIT" => PriceType::Limit,
        "SL" => PriceType::Sl,
        "SL-M" => PriceType::SlM,
        _ => PriceType::Market,
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "completed" => OrderStatus::Completed,
        "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Open,
    }
}

fn order_from_row(row: &Row) -> rusqlite::Result<SimOrder> {
    Ok(SimOrder {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        exchange: row.get(3)?,
        action: parse_action(&row.get::<_, String>(4)?),
        quantity: row.get::<_, i64>(5)?.max(0) as u64,
        product: parse_product(&row.get::<_, String>(6)?),
        pricetype: parse_pricetype(&row.get::<_, String>(7)?),
        pricetype_submitted: parse_pricetype(&row.get::<_, String>(8)?),
        price: row.get(9)?,
        trigger_price: row.get(10)?,
        status: parse_status(&row.get::<_, String>(11)?),
        margin_blocked: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        fill_price: row.get(15)?,
        fill_ts: row.get(16)?,
    })
}

const ORDER_COLUMNS: &str = "id, user_id, symbol, exchange, action, quantity, product, pricetype, \
     pricetype_submitted, price, trigger_price, status, margin_blocked, created_at, updated_at, \
     fill_price, fill_ts";

fn position_from_row(row: &Row) -> rusqlite::Result<Position> {
    Ok(Position {
        user_id: row.get(0)?,
        symbol: row.get(1)?,
        exchange: row.get(2)?,
        product: parse_product(&row.get::<_, String>(3)?),
        quantity: row.get(4)?,
        avg_price: row.get(5)?,
        realized_pnl: row.get(6)?,
        margin_blocked: row.get(7)?,
        ltp: row.get(8)?,
        mtm: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const POSITION_COLUMNS: &str = "user_id, symbol, exchange, product, quantity, avg_price, \
     realized_pnl, margin_blocked, ltp, mtm, created_at, updated_at";

fn funds_from_row(row: &Row) -> rusqlite::Result<Funds> {
    Ok(Funds {
        user_id: row.get(0)?,
        capital: row.get(1)?,
        available: row.get(2)?,
        used_margin: row.get(3)?,
        realized_pnl_today: row.get(4)?,
        unrealized_pnl: row.get(5)?,
    })
}

impl SandboxStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open sandbox db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;

        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                product TEXT NOT NULL,
                pricetype TEXT NOT NULL,
                pricetype_submitted TEXT NOT NULL,
                price REAL NOT NULL DEFAULT 0,
                trigger_price REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                margin_blocked REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                fill_price REAL,
                fill_ts INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON sandbox_orders(status, symbol, exchange)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_user ON sandbox_orders(user_id, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_trades (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_user ON sandbox_trades(user_id, ts DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_positions (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                product TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                avg_price REAL NOT NULL,
                realized_pnl REAL NOT NULL DEFAULT 0,
                margin_blocked REAL NOT NULL DEFAULT 0,
                ltp REAL NOT NULL DEFAULT 0,
                mtm REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, symbol, exchange, product)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_holdings (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                avg_price REAL NOT NULL,
                settled_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, symbol, exchange)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_funds (
                user_id TEXT PRIMARY KEY,
                capital REAL NOT NULL,
                available REAL NOT NULL,
                used_margin REAL NOT NULL DEFAULT 0,
                realized_pnl_today REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS job_markers (
                job TEXT NOT NULL,
                period_key TEXT NOT NULL,
                ran_at INTEGER NOT NULL,
                PRIMARY KEY (job, period_key)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS mis_blocks (
                exchange TEXT PRIMARY KEY,
                blocked_on TEXT NOT NULL,
                until_ts INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    // ---- funds ----------------------------------------------------------

    pub async fn ensure_funds(&self, user_id: &str, starting_capital: f64) -> Result<Funds> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO sandbox_funds (user_id, capital, available)
             VALUES (?1, ?2, ?2)",
            params![user_id, starting_capital],
        )?;
        let funds = conn.query_row(
            "SELECT user_id, capital, available, used_margin, realized_pnl_today, unrealized_pnl
             FROM sandbox_funds WHERE user_id = ?1",
            params![user_id],
            funds_from_row,
        )?;
        Ok(funds)
    }

    pub async fn funds(&self, user_id: &str) -> Result<Option<Funds>> {
        let conn = self.conn.lock().await;
        let funds = conn
            .query_row(
                "SELECT user_id, capital, available, used_margin, realized_pnl_today, unrealized_pnl
                 FROM sandbox_funds WHERE user_id = ?1",
                params![user_id],
                funds_from_row,
            )
            .optional()?;
        Ok(funds)
    }

    fn funds_in_tx(tx: &Transaction, user_id: &str) -> rusqlite::Result<Option<Funds>> {
        tx.query_row(
            "SELECT user_id, capital, available, used_margin, realized_pnl_today, unrealized_pnl
             FROM sandbox_funds WHERE user_id = ?1",
            params![user_id],
            funds_from_row,
        )
        .optional()
    }

    fn write_funds(tx: &Transaction, funds: &Funds) -> rusqlite::Result<()> {
        tx.execute(
            "UPDATE sandbox_funds
             SET capital = ?2, available = ?3, used_margin = ?4,
                 realized_pnl_today = ?5, unrealized_pnl = ?6
             WHERE user_id = ?1",
            params![
                &funds.user_id,
                round_paise(funds.capital),
                round_paise(funds.available),
                round_paise(funds.used_margin),
                round_paise(funds.realized_pnl_today),
                round_paise(funds.unrealized_pnl),
            ],
        )?;
        Ok(())
    }

    /// Weekly reset: capital back to `starting_capital`, margins and daily
    /// P&L cleared, holdings preserved.
    pub async fn reset_capital(&self, starting_capital: f64) -> Result<usize> {
        let users: Vec<String> = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let users: Vec<String> = {
                let mut stmt = tx.prepare("SELECT user_id FROM sandbox_funds")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.filter_map(|r| r.ok()).collect()
            };
            tx.execute(
                "UPDATE sandbox_funds
                 SET capital = ?1, available = ?1, used_margin = 0,
                     realized_pnl_today = 0, unrealized_pnl = 0",
                params![starting_capital],
            )?;
            tx.execute(
                "UPDATE sandbox_positions SET realized_pnl = 0, margin_blocked = 0, mtm = 0",
                [],
            )?;
            tx.commit()?;
            users
        };
        for user in &users {
            self.emit(StoreEvent::FundsChanged {
                user_id: user.clone(),
            });
        }
        Ok(users.len())
    }

    // ---- orders ---------------------------------------------------------

    /// Accept an order: check and block margin, persist the row. Atomic; a
    /// rejection leaves funds and the orderbook unchanged.
    pub async fn accept_order(&self, order: &SimOrder) -> Result<(), EngineError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(store_err)?;

        let mut funds = Self::funds_in_tx(&tx, &order.user_id)
            .map_err(store_err)?
            .ok_or_else(|| EngineError::Store("funds row missing".into()))?;

        if funds.available - order.margin_blocked < 0.0 {
            return Err(EngineError::InsufficientFunds {
                required: order.margin_blocked,
                available: funds.available,
            });
        }
        funds.available -= order.margin_blocked;
        funds.used_margin += order.margin_blocked;
        Self::write_funds(&tx, &funds).map_err(store_err)?;

        tx.execute(
            &format!("INSERT INTO sandbox_orders ({ORDER_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)"),
            params![
                &order.id,
                &order.user_id,
                &order.symbol,
                &order.exchange,
                order.action.as_str(),
                order.quantity as i64,
                order.product.as_str(),
                order.pricetype.as_str(),
                order.pricetype_submitted.as_str(),
                order.price,
                order.trigger_price,
                order.status.as_str(),
                order.margin_blocked,
                order.created_at,
                order.updated_at,
                order.fill_price,
                order.fill_ts,
            ],
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)?;
        drop(conn);
        self.emit(StoreEvent::OrdersChanged {
            user_id: order.user_id.clone(),
        });
        self.emit(StoreEvent::FundsChanged {
            user_id: order.user_id.clone(),
        });
        Ok(())
    }

    pub async fn order(&self, user_id: &str, order_id: &str) -> Result<Option<SimOrder>> {
        let conn = self.conn.lock().await;
        let order = conn
            .query_row(
                &format!(
                    "SELECT {ORDER_COLUMNS} FROM sandbox_orders WHERE id = ?1 AND user_id = ?2"
                ),
                params![order_id, user_id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// All open orders, oldest first, for the engine's poll cycle.
    pub async fn open_orders(&self) -> Result<Vec<SimOrder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLUMNS} FROM sandbox_orders WHERE status = 'open' ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], order_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn orderbook(&self, user_id: &str, limit: usize) -> Result<Vec<SimOrder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLUMNS} FROM sandbox_orders WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit.clamp(1, 5000) as i64], order_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn tradebook(&self, user_id: &str, limit: usize) -> Result<Vec<SimTrade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, order_id, user_id, symbol, exchange, action, quantity, price, ts
             FROM sandbox_trades WHERE user_id = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit.clamp(1, 5000) as i64], |row| {
            Ok(SimTrade {
                id: row.get(0)?,
                order_id: row.get(1)?,
                user_id: row.get(2)?,
                symbol: row.get(3)?,
                exchange: row.get(4)?,
                action: parse_action(&row.get::<_, String>(5)?),
                quantity: row.get::<_, i64>(6)?.max(0) as u64,
                price: row.get(7)?,
                ts: row.get(8)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Cancel an open order and release its margin block.
    pub async fn cancel_order(
        &self,
        user_id: &str,
        order_id: &str,
        ts: i64,
    ) -> Result<SimOrder, EngineError> {
        let order = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction().map_err(store_err)?;

            let mut order = tx
                .query_row(
                    &format!(
                        "SELECT {ORDER_COLUMNS} FROM sandbox_orders WHERE id = ?1 AND user_id = ?2"
                    ),
                    params![order_id, user_id],
                    order_from_row,
                )
                .optional()
                .map_err(store_err)?
                .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
            if order.status != OrderStatus::Open {
                return Err(EngineError::NotOpen);
            }

            let mut funds = Self::funds_in_tx(&tx, user_id)
                .map_err(store_err)?
                .ok_or_else(|| EngineError::Store("funds row missing".into()))?;
            funds.available += order.margin_blocked;
            funds.used_margin -= order.margin_blocked;
            Self::write_funds(&tx, &funds).map_err(store_err)?;

            tx.execute(
                "UPDATE sandbox_orders SET status = 'cancelled', margin_blocked = 0, updated_at = ?2
                 WHERE id = ?1",
                params![order_id, ts],
            )
            .map_err(store_err)?;
            tx.commit().map_err(store_err)?;

            order.status = OrderStatus::Cancelled;
            order.margin_blocked = 0.0;
            order.updated_at = ts;
            order
        };

        self.emit(StoreEvent::OrdersChanged {
            user_id: user_id.to_string(),
        });
        self.emit(StoreEvent::FundsChanged {
            user_id: user_id.to_string(),
        });
        Ok(order)
    }

    /// Modify price/trigger/quantity of an open order, re-blocking margin
    /// for the new terms.
    pub async fn modify_order(
        &self,
        user_id: &str,
        order_id: &str,
        price: f64,
        trigger_price: f64,
        quantity: u64,
        new_margin: f64,
        ts: i64,
    ) -> Result<(), EngineError> {
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction().map_err(store_err)?;

            let order = tx
                .query_row(
                    &format!(
                        "SELECT {ORDER_COLUMNS} FROM sandbox_orders WHERE id = ?1 AND user_id = ?2"
                    ),
                    params![order_id, user_id],
                    order_from_row,
                )
                .optional()
                .map_err(store_err)?
                .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
            if order.status != OrderStatus::Open {
                return Err(EngineError::NotOpen);
            }

            let mut funds = Self::funds_in_tx(&tx, user_id)
                .map_err(store_err)?
                .ok_or_else(|| EngineError::Store("funds row missing".into()))?;
            let delta = new_margin - order.margin_blocked;
            if funds.available - delta < 0.0 {
                return Err(EngineError::InsufficientFunds {
                    required: delta,
                    available: funds.available,
                });
            }
            funds.available -= delta;
            funds.used_margin += delta;
            Self::write_funds(&tx, &funds).map_err(store_err)?;

            tx.execute(
                "UPDATE sandbox_orders
                 SET price = ?2, trigger_price = ?3, quantity = ?4, margin_blocked = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![order_id, price, trigger_price, quantity as i64, new_margin, ts],
            )
            .map_err(store_err)?;
            tx.commit().map_err(store_err)?;
        }

        self.emit(StoreEvent::OrdersChanged {
            user_id: user_id.to_string(),
        });
        self.emit(StoreEvent::FundsChanged {
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// An SL/SL-M order whose trigger fired is rewritten in place to
    /// LIMIT/MARKET (still open) so arming survives restart.
    pub async fn arm_order(&self, order_id: &str, armed_as: PriceType, ts: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sandbox_orders SET pricetype = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'open'",
            params![order_id, armed_as.as_str(), ts],
        )?;
        Ok(())
    }

    // ---- fills ----------------------------------------------------------

    /// Execute a fill in one transaction: order → completed, trade created,
    /// position netted, margin and realized P&L settled into funds.
    pub async fn apply_fill(
        &self,
        order_id: &str,
        fill_price: f64,
        ts: i64,
        cfg: &SandboxConfig,
    ) -> Result<FillReport, EngineError> {
        let report = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction().map_err(store_err)?;

            let order = tx
                .query_row(
                    &format!("SELECT {ORDER_COLUMNS} FROM sandbox_orders WHERE id = ?1"),
                    params![order_id],
                    order_from_row,
                )
                .optional()
                .map_err(store_err)?
                .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
            if order.status != OrderStatus::Open {
                return Err(EngineError::NotOpen);
            }

            let position = tx
                .query_row(
                    &format!(
                        "SELECT {POSITION_COLUMNS} FROM sandbox_positions
                         WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND product = ?4"
                    ),
                    params![
                        &order.user_id,
                        &order.symbol,
                        &order.exchange,
                        order.product.as_str()
                    ],
                    position_from_row,
                )
                .optional()
                .map_err(store_err)?;

            let (old_qty, old_avg, old_margin, old_realized, pos_created_at) = match &position {
                Some(p) => (
                    p.quantity,
                    p.avg_price,
                    p.margin_blocked,
                    p.realized_pnl,
                    p.created_at,
                ),
                None => (0, 0.0, 0.0, 0.0, ts),
            };

            let outcome = netting::apply(
                old_qty,
                old_avg,
                old_margin,
                order.action,
                order.quantity,
                fill_price,
            );
            let opened_margin = if outcome.opened_qty != 0 {
                margin::margin_required(
                    cfg,
                    &order.symbol,
                    &order.exchange,
                    order.action,
                    outcome.opened_qty.unsigned_abs(),
                    outcome.opened_price,
                    order.product,
                )
            } else {
                0.0
            };

            let mut funds = Self::funds_in_tx(&tx, &order.user_id)
                .map_err(store_err)?
                .ok_or_else(|| EngineError::Store("funds row missing".into()))?;

            // Release the acceptance-time block, settle the netting outcome.
            funds.available += order.margin_blocked;
            funds.used_margin -= order.margin_blocked;
            funds.available += outcome.margin_released;
            funds.used_margin -= outcome.margin_released;
            funds.realized_pnl_today += outcome.realized;
            funds.available += outcome.realized;
            funds.available -= opened_margin;
            funds.used_margin += opened_margin;
            Self::write_funds(&tx, &funds).map_err(store_err)?;

            tx.execute(
                "UPDATE sandbox_orders
                 SET status = 'completed', margin_blocked = 0, fill_price = ?2, fill_ts = ?3,
                     updated_at = ?3
                 WHERE id = ?1",
                params![order_id, fill_price, ts],
            )
            .map_err(store_err)?;

            let trade_id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO sandbox_trades (id, order_id, user_id, symbol, exchange, action, quantity, price, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &trade_id,
                    order_id,
                    &order.user_id,
                    &order.symbol,
                    &order.exchange,
                    order.action.as_str(),
                    order.quantity as i64,
                    fill_price,
                    ts,
                ],
            )
            .map_err(store_err)?;

            // A fresh open (flat → non-flat) restarts the position's clock;
            // T+1 settlement keys off created_at.
            let created_at = if old_qty == 0 { ts } else { pos_created_at };
            let new_margin = round_paise(old_margin - outcome.margin_released + opened_margin);
            let mtm = (fill_price - outcome.new_avg) * outcome.new_qty as f64;
            tx.execute(
                "INSERT INTO sandbox_positions
                 (user_id, symbol, exchange, product, quantity, avg_price, realized_pnl,
                  margin_blocked, ltp, mtm, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(user_id, symbol, exchange, product) DO UPDATE SET
                    quantity = excluded.quantity,
                    avg_price = excluded.avg_price,
                    realized_pnl = excluded.realized_pnl,
                    margin_blocked = excluded.margin_blocked,
                    ltp = excluded.ltp,
                    mtm = excluded.mtm,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    &order.user_id,
                    &order.symbol,
                    &order.exchange,
                    order.product.as_str(),
                    outcome.new_qty,
                    outcome.new_avg,
                    round_paise(old_realized + outcome.realized),
                    new_margin,
                    fill_price,
                    round_paise(mtm),
                    created_at,
                    ts,
                ],
            )
            .map_err(store_err)?;

            tx.commit().map_err(store_err)?;

            if !funds.invariant_holds() {
                warn!(
                    user = %order.user_id,
                    available = funds.available,
                    used = funds.used_margin,
                    capital = funds.capital,
                    realized = funds.realized_pnl_today,
                    "funds invariant violated after fill"
                );
            }

            FillReport {
                trade_id,
                order_id: order_id.to_string(),
                realized: outcome.realized,
                position_qty: outcome.new_qty,
                funds,
            }
        };

        let user_id = report.funds.user_id.clone();
        self.emit(StoreEvent::OrdersChanged {
            user_id: user_id.clone(),
        });
        self.emit(StoreEvent::PositionsChanged {
            user_id: user_id.clone(),
        });
        self.emit(StoreEvent::FundsChanged { user_id });
        debug!(order = %report.order_id, realized = report.realized, "fill applied");
        Ok(report)
    }

    // ---- positions & holdings ------------------------------------------

    pub async fn positions(&self, user_id: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM sandbox_positions WHERE user_id = ?1
             ORDER BY symbol ASC"
        ))?;
        let rows = stmt.query_map(params![user_id], position_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Open (non-flat) positions across all users, for the MTM sweep.
    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM sandbox_positions WHERE quantity != 0"
        ))?;
        let rows = stmt.query_map([], position_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn open_mis_positions(&self, exchange: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM sandbox_positions
             WHERE quantity != 0 AND product = 'MIS' AND exchange = ?1"
        ))?;
        let rows = stmt.query_map(params![exchange], position_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// MTM sweep write-back: marks on each open position, per-user
    /// unrealized total on funds.
    pub async fn update_marks(&self, marks: &[(Position, f64, f64)]) -> Result<()> {
        use std::collections::HashMap;
        let mut per_user: HashMap<String, f64> = HashMap::new();
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            for (pos, ltp, mtm) in marks {
                tx.execute(
                    "UPDATE sandbox_positions SET ltp = ?5, mtm = ?6, updated_at = updated_at
                     WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND product = ?4",
                    params![
                        &pos.user_id,
                        &pos.symbol,
                        &pos.exchange,
                        pos.product.as_str(),
                        ltp,
                        round_paise(*mtm),
                    ],
                )?;
                *per_user.entry(pos.user_id.clone()).or_insert(0.0) += mtm;
            }
            for (user, total) in &per_user {
                tx.execute(
                    "UPDATE sandbox_funds SET unrealized_pnl = ?2 WHERE user_id = ?1",
                    params![user, round_paise(*total)],
                )?;
            }
            tx.commit()?;
        }
        for user in per_user.keys() {
            self.emit(StoreEvent::PositionsChanged {
                user_id: user.clone(),
            });
        }
        Ok(())
    }

    pub async fn holdings(&self, user_id: &str) -> Result<Vec<Holding>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, symbol, exchange, quantity, avg_price, settled_at
             FROM sandbox_holdings WHERE user_id = ?1 ORDER BY symbol ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(Holding {
                user_id: row.get(0)?,
                symbol: row.get(1)?,
                exchange: row.get(2)?,
                quantity: row.get(3)?,
                avg_price: row.get(4)?,
                settled_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// T+1 settlement: move long CNC positions created before `cutoff_ts`
    /// into holdings (merging averages) and remove the position rows.
    pub async fn settle_cnc_positions(&self, cutoff_ts: i64, settled_at: i64) -> Result<usize> {
        let settled = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            let candidates: Vec<Position> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {POSITION_COLUMNS} FROM sandbox_positions
                     WHERE product = 'CNC' AND quantity > 0 AND created_at < ?1"
                ))?;
                let rows = stmt.query_map(params![cutoff_ts], position_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            };

            for pos in &candidates {
                let existing: Option<(i64, f64)> = tx
                    .query_row(
                        "SELECT quantity, avg_price FROM sandbox_holdings
                         WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3",
                        params![&pos.user_id, &pos.symbol, &pos.exchange],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let (qty, avg) = match existing {
                    Some((hq, ha)) => {
                        let total = hq + pos.quantity;
                        let avg = if total > 0 {
                            (ha * hq as f64 + pos.avg_price * pos.quantity as f64) / total as f64
                        } else {
                            pos.avg_price
                        };
                        (total, avg)
                    }
                    None => (pos.quantity, pos.avg_price),
                };

                tx.execute(
                    "INSERT INTO sandbox_holdings (user_id, symbol, exchange, quantity, avg_price, settled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(user_id, symbol, exchange) DO UPDATE SET
                        quantity = excluded.quantity,
                        avg_price = excluded.avg_price,
                        settled_at = excluded.settled_at",
                    params![&pos.user_id, &pos.symbol, &pos.exchange, qty, avg, settled_at],
                )?;
                tx.execute(
                    "DELETE FROM sandbox_positions
                     WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND product = 'CNC'",
                    params![&pos.user_id, &pos.symbol, &pos.exchange],
                )?;
            }
            tx.commit()?;
            candidates
        };

        for pos in &settled {
            self.emit(StoreEvent::PositionsChanged {
                user_id: pos.user_id.clone(),
            });
        }
        Ok(settled.len())
    }

    /// Cancel every open MIS order on `exchange`, releasing margins.
    /// Returns the cancelled orders.
    pub async fn cancel_open_mis_orders(
        &self,
        exchange: &str,
        ts: i64,
    ) -> Result<Vec<SimOrder>> {
        let cancelled = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            let orders: Vec<SimOrder> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {ORDER_COLUMNS} FROM sandbox_orders
                     WHERE status = 'open' AND product = 'MIS' AND exchange = ?1"
                ))?;
                let rows = stmt.query_map(params![exchange], order_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            };

            for order in &orders {
                tx.execute(
                    "UPDATE sandbox_funds
                     SET available = available + ?2, used_margin = used_margin - ?2
                     WHERE user_id = ?1",
                    params![&order.user_id, order.margin_blocked],
                )?;
                tx.execute(
                    "UPDATE sandbox_orders SET status = 'cancelled', margin_blocked = 0, updated_at = ?2
                     WHERE id = ?1",
                    params![&order.id, ts],
                )?;
            }
            tx.commit()?;
            orders
        };

        for order in &cancelled {
            self.emit(StoreEvent::OrdersChanged {
                user_id: order.user_id.clone(),
            });
            self.emit(StoreEvent::FundsChanged {
                user_id: order.user_id.clone(),
            });
        }
        Ok(cancelled)
    }

    // ---- config, markers, MIS blocks -----------------------------------

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sandbox_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM sandbox_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn persist_config(&self, cfg: &SandboxConfig) -> Result<()> {
        let conn = self.conn.lock().await;
        for (key, value) in cfg.to_pairs() {
            conn.execute(
                "INSERT INTO sandbox_config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        Ok(())
    }

    pub async fn job_done(&self, job: &str, period_key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let row: Option<i64> = conn
            .query_row(
                "SELECT ran_at FROM job_markers WHERE job = ?1 AND period_key = ?2",
                params![job, period_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub async fn mark_job_done(&self, job: &str, period_key: &str, ts: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO job_markers (job, period_key, ran_at) VALUES (?1, ?2, ?3)",
            params![job, period_key, ts],
        )?;
        Ok(())
    }

    pub async fn set_mis_block(&self, exchange: &str, blocked_on: &str, until_ts: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO mis_blocks (exchange, blocked_on, until_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(exchange) DO UPDATE SET
                blocked_on = excluded.blocked_on,
                until_ts = excluded.until_ts",
            params![exchange, blocked_on, until_ts],
        )?;
        Ok(())
    }

    /// MIS orders for `exchange` are blocked when a square-off flag is
    /// active and its window has not elapsed.
    pub async fn mis_blocked(&self, exchange: &str, now_ts: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let until: Option<i64> = conn
            .query_row(
                "SELECT until_ts FROM mis_blocks WHERE exchange = ?1",
                params![exchange],
                |row| row.get(0),
            )
            .optional()?;
        Ok(until.map(|u| now_ts < u).unwrap_or(false))
    }
}

fn store_err(e: rusqlite::Error) -> EngineError {
    EngineError::Store(e.to_string())
}
