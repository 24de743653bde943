//! Symbol resolution over the master-contract table.
//!
//! Lookups are served from an in-memory snapshot (read-mostly); the table is
//! reloaded periodically and after contract upserts. Keys are
//! (broker, exchange, symbol) forward and (broker, broker_exchange, token)
//! reverse, so feed adapters can map broker frames back to gateway symbols.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolContract {
    pub symbol: String,
    pub exchange: String,
    pub broker: String,
    pub broker_token: String,
    pub broker_exchange: String,
    pub lot_size: u64,
    pub tick_size: f64,
}

#[derive(Default)]
struct ContractMaps {
    forward: HashMap<(String, String, String), SymbolContract>,
    reverse: HashMap<(String, String, String), SymbolContract>,
}

pub struct SymbolResolver {
    db_path: String,
    maps: RwLock<ContractMaps>,
}

impl SymbolResolver {
    pub fn new(db_path: &str) -> Result<Self> {
        let resolver = Self {
            db_path: db_path.to_string(),
            maps: RwLock::new(ContractMaps::default()),
        };
        resolver.init_schema()?;
        resolver.reload()?;
        Ok(resolver)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path).context("open symbol db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS symbol_map (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                broker TEXT NOT NULL,
                broker_token TEXT NOT NULL,
                broker_exchange TEXT NOT NULL,
                lot_size INTEGER NOT NULL DEFAULT 1,
                tick_size REAL NOT NULL DEFAULT 0.05,
                PRIMARY KEY (broker, exchange, symbol)
            )",
            [],
        )?;
        Ok(())
    }

    /// Swap the in-memory snapshot for a fresh read of `symbol_map`.
    pub fn reload(&self) -> Result<usize> {
        let conn = Connection::open(&self.db_path).context("open symbol db")?;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, exchange, broker, broker_token, broker_exchange, lot_size, tick_size
             FROM symbol_map",
        )?;

        let mut next = ContractMaps::default();
        let rows = stmt.query_map([], |row| {
            Ok(SymbolContract {
                symbol: row.get(0)?,
                exchange: row.get(1)?,
                broker: row.get(2)?,
                broker_token: row.get(3)?,
                broker_exchange: row.get(4)?,
                lot_size: row.get::<_, i64>(5)?.max(1) as u64,
                tick_size: row.get(6)?,
            })
        })?;

        for contract in rows.filter_map(|r| r.ok()) {
            next.forward.insert(
                (
                    contract.broker.clone(),
                    contract.exchange.clone(),
                    contract.symbol.clone(),
                ),
                contract.clone(),
            );
            next.reverse.insert(
                (
                    contract.broker.clone(),
                    contract.broker_exchange.clone(),
                    contract.broker_token.clone(),
                ),
                contract,
            );
        }

        let count = next.forward.len();
        *self.maps.write() = next;
        debug!(contracts = count, "symbol map reloaded");
        Ok(count)
    }

    /// Resolve a user-facing (symbol, exchange) to broker contract details.
    pub fn resolve(
        &self,
        broker: &str,
        symbol: &str,
        exchange: &str,
    ) -> Result<SymbolContract, BrokerError> {
        self.maps
            .read()
            .forward
            .get(&(broker.to_string(), exchange.to_string(), symbol.to_string()))
            .cloned()
            .ok_or_else(|| BrokerError::SymbolNotFound(format!("{exchange}:{symbol}")))
    }

    /// Broker-agnostic lookup for validation paths that only need contract
    /// terms (lot size, tick size), not broker routing.
    pub fn lookup_any(&self, symbol: &str, exchange: &str) -> Option<SymbolContract> {
        let maps = self.maps.read();
        maps.forward
            .iter()
            .find(|((_, ex, sym), _)| ex == exchange && sym == symbol)
            .map(|(_, c)| c.clone())
    }

    /// Reverse-resolve a broker (exchange code, token) pair to the contract.
    pub fn resolve_token(
        &self,
        broker: &str,
        broker_exchange: &str,
        broker_token: &str,
    ) -> Option<SymbolContract> {
        self.maps
            .read()
            .reverse
            .get(&(
                broker.to_string(),
                broker_exchange.to_string(),
                broker_token.to_string(),
            ))
            .cloned()
    }

    pub fn upsert_contracts(&self, contracts: &[SymbolContract]) -> Result<usize> {
        let mut conn = Connection::open(&self.db_path).context("open symbol db")?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO symbol_map
                 (symbol, exchange, broker, broker_token, broker_exchange, lot_size, tick_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(broker, exchange, symbol) DO UPDATE SET
                    broker_token = excluded.broker_token,
                    broker_exchange = excluded.broker_exchange,
                    lot_size = excluded.lot_size,
                    tick_size = excluded.tick_size",
            )?;
            for c in contracts {
                stmt.execute(params![
                    &c.symbol,
                    &c.exchange,
                    &c.broker,
                    &c.broker_token,
                    &c.broker_exchange,
                    c.lot_size as i64,
                    c.tick_size,
                ])?;
            }
        }
        tx.commit()?;
        self.reload()?;
        Ok(contracts.len())
    }

    /// Development seed so a fresh database resolves a few liquid contracts.
    pub fn seed_if_empty(&self, broker: &str) -> Result<()> {
        if !self.maps.read().forward.is_empty() {
            return Ok(());
        }

        let seeds = [
            ("SBIN", "NSE", "3045", 1u64),
            ("RELIANCE", "NSE", "2885", 1),
            ("INFY", "NSE", "1594", 1),
            ("TCS", "NSE", "11536", 1),
            ("SBIN", "BSE", "500112", 1),
            ("NIFTY25AUGFUT", "NFO", "53001", 75),
        ];
        let contracts: Vec<SymbolContract> = seeds
            .iter()
            .map(|(symbol, exchange, token, lot)| SymbolContract {
                symbol: symbol.to_string(),
                exchange: exchange.to_string(),
                broker: broker.to_string(),
                broker_token: token.to_string(),
                broker_exchange: exchange.to_string(),
                lot_size: *lot,
                tick_size: 0.05,
            })
            .collect();

        self.upsert_contracts(&contracts)?;
        info!(count = contracts.len(), broker, "seeded development symbol map");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn temp_resolver() -> (SymbolResolver, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let resolver = SymbolResolver::new(file.path().to_str().unwrap()).unwrap();
        (resolver, file)
    }

    #[test]
    fn resolve_roundtrip_after_upsert() {
        let (resolver, _file) = temp_resolver();
        resolver
            .upsert_contracts(&[SymbolContract {
                symbol: "SBIN".into(),
                exchange: "NSE".into(),
                broker: "flattrade".into(),
                broker_token: "3045".into(),
                broker_exchange: "NSE".into(),
                lot_size: 1,
                tick_size: 0.05,
            }])
            .unwrap();

        let c = resolver.resolve("flattrade", "SBIN", "NSE").unwrap();
        assert_eq!(c.broker_token, "3045");

        let back = resolver.resolve_token("flattrade", "NSE", "3045").unwrap();
        assert_eq!(back.symbol, "SBIN");
    }

    #[test]
    fn missing_symbol_is_not_found() {
        let (resolver, _file) = temp_resolver();
        let err = resolver.resolve("flattrade", "NOPE", "NSE").unwrap_err();
        assert_eq!(err.code(), "SYMBOL_NOT_FOUND");
    }

    #[test]
    fn upsert_overwrites_existing_contract() {
        let (resolver, _file) = temp_resolver();
        let mut c = SymbolContract {
            symbol: "INFY".into(),
            exchange: "NSE".into(),
            broker: "flattrade".into(),
            broker_token: "1594".into(),
            broker_exchange: "NSE".into(),
            lot_size: 1,
            tick_size: 0.05,
        };
        resolver.upsert_contracts(std::slice::from_ref(&c)).unwrap();
        c.broker_token = "9999".into();
        resolver.upsert_contracts(&[c]).unwrap();

        let got = resolver.resolve("flattrade", "INFY", "NSE").unwrap();
        assert_eq!(got.broker_token, "9999");
    }
}
