//! Thin REST surface over the sandbox order service and account views.
//! Authentication reuses the API-key port via the `X-API-Key` header; error
//! responses carry the same stable codes as the WebSocket protocol.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::{
    auth::{AuthInfo, AuthPort},
    error::EngineError,
    orders::{ModifyOrderRequest, OrderService, PlaceOrderRequest},
    store::SandboxStore,
};

#[derive(Clone)]
pub struct ApiContext {
    pub auth: Arc<dyn AuthPort>,
    pub orders: Arc<OrderService>,
    pub store: Arc<SandboxStore>,
}

pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn server(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "SERVER_ERROR", message)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::OrderNotFound(_) | EngineError::NotOpen => StatusCode::NOT_FOUND,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Broker(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

async fn require_auth(ctx: &ApiContext, headers: &HeaderMap) -> Result<AuthInfo, ApiError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if key.is_empty() {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "NOT_AUTHENTICATED",
            "missing X-API-Key header",
        ));
    }
    ctx.auth
        .verify(key)
        .await
        .map_err(|e| ApiError::new(StatusCode::UNAUTHORIZED, e.code(), e.to_string()))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    200
}

async fn place_order(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let order = ctx.orders.place(&info.user_id, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "order": order })),
    ))
}

async fn modify_order(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(req): Json<ModifyOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let order = ctx.orders.modify(&info.user_id, &order_id, req).await?;
    Ok(Json(json!({ "status": "success", "order": order })))
}

async fn cancel_order(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let order = ctx.orders.cancel(&info.user_id, &order_id).await?;
    Ok(Json(json!({ "status": "success", "order": order })))
}

async fn orderbook(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let orders = ctx
        .store
        .orderbook(&info.user_id, params.limit)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "orders": orders })))
}

async fn tradebook(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let trades = ctx
        .store
        .tradebook(&info.user_id, params.limit)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "trades": trades })))
}

async fn positions(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let positions = ctx
        .store
        .positions(&info.user_id)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "positions": positions })))
}

async fn holdings(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let holdings = ctx
        .store
        .holdings(&info.user_id)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "holdings": holdings })))
}

async fn funds(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let info = require_auth(&ctx, &headers).await?;
    let funds = ctx
        .store
        .funds(&info.user_id)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "funds": funds })))
}

pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/orders", post(place_order))
        .route("/orders/:id", put(modify_order))
        .route("/orders/:id", delete(cancel_order))
        .route("/orderbook", get(orderbook))
        .route("/tradebook", get(tradebook))
        .route("/positions", get(positions))
        .route("/holdings", get(holdings))
        .route("/funds", get(funds))
        .with_state(ctx)
}
