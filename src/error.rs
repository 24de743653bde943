//! Stable error-code taxonomy. Codes are part of the client contract and
//! never change spelling; everything else about an error (message text,
//! source chain) is free to evolve.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by broker adapters and the broker port.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("mode not supported by broker")]
    UnsupportedMode,
    #[error("depth level {0} not supported by broker")]
    UnsupportedDepthLevel(usize),
    #[error("per-connection symbol limit exceeded")]
    LimitExceeded,
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker call timed out")]
    Timeout,
    #[error("broker error: {0}")]
    Broker(String),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::SymbolNotFound(_) => "SYMBOL_NOT_FOUND",
            BrokerError::UnsupportedMode => "UNSUPPORTED_MODE",
            BrokerError::UnsupportedDepthLevel(_) => "UNSUPPORTED_DEPTH_LEVEL",
            BrokerError::LimitExceeded => "LIMIT_EXCEEDED",
            BrokerError::NotConnected => "NOT_CONNECTED",
            BrokerError::Timeout => "BROKER_TIMEOUT",
            BrokerError::Broker(_) => "BROKER_ERROR",
        }
    }
}

/// Authentication failures from the auth port.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("authentication error: {0}")]
    Other(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidApiKey => "INVALID_API_KEY",
            AuthError::Other(_) => "AUTHENTICATION_ERROR",
        }
    }
}

/// Rejections and faults on the simulated order path.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("insufficient funds: requires {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },
    #[error("quantity {quantity} is not a multiple of lot size {lot_size}")]
    QuantityNotMultipleOfLot { quantity: u64, lot_size: u64 },
    #[error("MIS orders for {exchange} are blocked until 09:00 IST next session")]
    MisBlockedAfterSquareoff { exchange: String },
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("order is not open")]
    NotOpen,
    #[error("invalid order parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::QuantityNotMultipleOfLot { .. } => "QUANTITY_NOT_MULTIPLE_OF_LOT",
            EngineError::MisBlockedAfterSquareoff { .. } => "MIS_BLOCKED_AFTER_SQUAREOFF",
            EngineError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            EngineError::SymbolNotFound(_) => "SYMBOL_NOT_FOUND",
            EngineError::NotOpen => "ORDER_NOT_FOUND",
            EngineError::InvalidParameters(_) => "INVALID_PARAMETERS",
            EngineError::Broker(e) => e.code(),
            EngineError::Store(_) => "SERVER_ERROR",
        }
    }
}

/// Error codes on the client WebSocket protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsErrorCode {
    NotAuthenticated,
    InvalidApiKey,
    AuthenticationError,
    InvalidParameters,
    InvalidAction,
    BrokerError,
    BrokerTimeout,
    SymbolNotFound,
    NotConnected,
    UnsupportedMode,
    LimitExceeded,
    UnsupportedDepthLevel,
    NotSubscribed,
    ProcessingError,
    InvalidJson,
    ServerError,
}

impl WsErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            WsErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            WsErrorCode::InvalidApiKey => "INVALID_API_KEY",
            WsErrorCode::AuthenticationError => "AUTHENTICATION_ERROR",
            WsErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            WsErrorCode::InvalidAction => "INVALID_ACTION",
            WsErrorCode::BrokerError => "BROKER_ERROR",
            WsErrorCode::BrokerTimeout => "BROKER_TIMEOUT",
            WsErrorCode::SymbolNotFound => "SYMBOL_NOT_FOUND",
            WsErrorCode::NotConnected => "NOT_CONNECTED",
            WsErrorCode::UnsupportedMode => "UNSUPPORTED_MODE",
            WsErrorCode::LimitExceeded => "LIMIT_EXCEEDED",
            WsErrorCode::UnsupportedDepthLevel => "UNSUPPORTED_DEPTH_LEVEL",
            WsErrorCode::NotSubscribed => "NOT_SUBSCRIBED",
            WsErrorCode::ProcessingError => "PROCESSING_ERROR",
            WsErrorCode::InvalidJson => "INVALID_JSON",
            WsErrorCode::ServerError => "SERVER_ERROR",
        }
    }
}

impl From<&BrokerError> for WsErrorCode {
    fn from(e: &BrokerError) -> Self {
        match e {
            BrokerError::SymbolNotFound(_) => WsErrorCode::SymbolNotFound,
            BrokerError::UnsupportedMode => WsErrorCode::UnsupportedMode,
            BrokerError::UnsupportedDepthLevel(_) => WsErrorCode::UnsupportedDepthLevel,
            BrokerError::LimitExceeded => WsErrorCode::LimitExceeded,
            BrokerError::NotConnected => WsErrorCode::NotConnected,
            BrokerError::Timeout => WsErrorCode::BrokerTimeout,
            BrokerError::Broker(_) => WsErrorCode::BrokerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_codes_are_stable() {
        assert_eq!(BrokerError::SymbolNotFound("X".into()).code(), "SYMBOL_NOT_FOUND");
        assert_eq!(BrokerError::Timeout.code(), "BROKER_TIMEOUT");
        assert_eq!(BrokerError::LimitExceeded.code(), "LIMIT_EXCEEDED");
    }

    #[test]
    fn ws_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&WsErrorCode::NotSubscribed).unwrap();
        assert_eq!(json, "\"NOT_SUBSCRIBED\"");
        assert_eq!(WsErrorCode::InvalidJson.as_str(), "INVALID_JSON");
    }

    #[test]
    fn engine_rejections_map_to_codes() {
        let e = EngineError::QuantityNotMultipleOfLot {
            quantity: 7,
            lot_size: 5,
        };
        assert_eq!(e.code(), "QUANTITY_NOT_MULTIPLE_OF_LOT");
        let e = EngineError::MisBlockedAfterSquareoff {
            exchange: "NSE".into(),
        };
        assert_eq!(e.code(), "MIS_BLOCKED_AFTER_SQUAREOFF");
    }
}
