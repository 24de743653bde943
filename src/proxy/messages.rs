//! Client WebSocket protocol: JSON text frames, UTF-8.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::BusMessage;
use crate::error::WsErrorCode;
use crate::models::Mode;

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolRef {
    pub symbol: String,
    pub exchange: String,
}

/// Messages client → server, dispatched on `action`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate {
        api_key: String,
    },
    Subscribe {
        symbols: Vec<SymbolRef>,
        mode: u8,
        #[serde(default)]
        depth_level: Option<usize>,
    },
    Unsubscribe {
        symbols: Vec<SymbolRef>,
        mode: u8,
    },
    UnsubscribeAll,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub status: &'static str,
    pub code: WsErrorCode,
    pub message: String,
}

pub fn error_frame(code: WsErrorCode, message: impl Into<String>) -> String {
    serde_json::to_string(&ErrorMessage {
        status: "error",
        code,
        message: message.into(),
    })
    .unwrap_or_else(|_| "{\"status\":\"error\"}".to_string())
}

pub fn authenticated_frame(broker: &str) -> String {
    json!({
        "type": "auth",
        "status": "authenticated",
        "broker": broker,
    })
    .to_string()
}

/// Per-symbol outcome inside a subscribe/unsubscribe response.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolResult {
    pub symbol: String,
    pub exchange: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<WsErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_supported: Option<bool>,
}

impl SymbolResult {
    pub fn success(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            status: "success",
            message: None,
            code: None,
            actual_depth: None,
            broker_supported: None,
        }
    }

    pub fn warning(symbol: &str, exchange: &str, message: impl Into<String>) -> Self {
        Self {
            status: "warning",
            message: Some(message.into()),
            ..Self::success(symbol, exchange)
        }
    }

    pub fn error(symbol: &str, exchange: &str, code: WsErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            code: Some(code),
            message: Some(message.into()),
            ..Self::success(symbol, exchange)
        }
    }
}

pub fn subscribe_response_frame(mode: Mode, results: &[SymbolResult]) -> String {
    json!({
        "type": "subscribe_result",
        "mode": mode.as_u8(),
        "results": results,
    })
    .to_string()
}

pub fn unsubscribe_response_frame(mode: Mode, results: &[SymbolResult]) -> String {
    json!({
        "type": "unsubscribe_result",
        "mode": mode.as_u8(),
        "results": results,
    })
    .to_string()
}

pub fn unsubscribe_all_frame(count: usize) -> String {
    json!({
        "type": "unsubscribe_all_result",
        "status": "success",
        "unsubscribed": count,
    })
    .to_string()
}

/// Render a bus tick as the client-facing `market_data` frame. The `broker`
/// field is stamped here from the adapter identity carried on the bus
/// message, not by the adapter payload.
pub fn market_data_frame(msg: &BusMessage) -> String {
    let tick = &msg.tick;
    let mut data = json!({
        "ltp": tick.ltp,
        "timestamp": tick.ts_ms,
    });

    if tick.mode != Mode::Ltp {
        let obj = data.as_object_mut().expect("data is an object");
        obj.insert("open".into(), json!(tick.open));
        obj.insert("high".into(), json!(tick.high));
        obj.insert("low".into(), json!(tick.low));
        obj.insert("close".into(), json!(tick.close));
        obj.insert("volume".into(), json!(tick.volume));
        obj.insert("bid".into(), json!(tick.bid));
        obj.insert("ask".into(), json!(tick.ask));

        let (change, change_percent) = match tick.close {
            Some(close) if close != 0.0 => {
                let change = tick.ltp - close;
                (Some(change), Some(change / close * 100.0))
            }
            _ => (None, None),
        };
        obj.insert("change".into(), json!(change));
        obj.insert("change_percent".into(), json!(change_percent));
    }

    if tick.mode == Mode::Depth {
        let obj = data.as_object_mut().expect("data is an object");
        if let Some(depth) = &tick.depth {
            obj.insert(
                "depth".into(),
                json!({ "buy": depth.buy, "sell": depth.sell }),
            );
            obj.insert("actual_depth".into(), json!(depth.actual_depth));
            obj.insert("broker_supported".into(), json!(depth.broker_supported));
        }
    }

    json!({
        "type": "market_data",
        "mode": tick.mode.as_u8(),
        "symbol": tick.symbol,
        "exchange": tick.exchange,
        "broker": msg.broker,
        "data": data,
    })
    .to_string()
}
