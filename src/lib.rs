//! tradegate — personal algorithmic-trading gateway core: one real-time
//! market-data fan-out over heterogeneous brokers, plus a simulated
//! execution engine that paper-trades on the same live quotes.

pub mod api;
pub mod auth;
pub mod broker;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod margin;
pub mod models;
pub mod netting;
pub mod orders;
pub mod proxy;
pub mod schedule;
pub mod store;
pub mod symbols;
