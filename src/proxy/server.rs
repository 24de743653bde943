//! Client-facing WebSocket proxy: authentication, per-client subscription
//! sets, shared-subscription reference counting, fan-out of bus ticks, and
//! graceful cleanup on disconnect.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthInfo, AuthPort},
    broker::BrokerRegistry,
    bus::Bus,
    error::WsErrorCode,
    feed::FeedAdapter,
    models::{Mode, SubKey},
    proxy::{
        messages::{
            authenticated_frame, error_frame, market_data_frame, subscribe_response_frame,
            unsubscribe_all_frame, unsubscribe_response_frame, ClientRequest, SymbolRef,
            SymbolResult,
        },
        outbox::Outbox,
        state::{ClientId, PreRegister, ProxyState},
    },
    symbols::SymbolResolver,
};

/// How long a concurrent subscriber waits for another client's in-flight
/// first-subscribe before giving up.
const PENDING_RETRY: Duration = Duration::from_millis(25);
const PENDING_RETRIES: usize = 200;

pub struct ProxyServer {
    pub state: Arc<ProxyState>,
    auth: Arc<dyn AuthPort>,
    registry: Arc<BrokerRegistry>,
    resolver: Arc<SymbolResolver>,
    bus: Bus,
}

impl ProxyServer {
    pub fn new(
        auth: Arc<dyn AuthPort>,
        registry: Arc<BrokerRegistry>,
        resolver: Arc<SymbolResolver>,
        bus: Bus,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ProxyState::new()),
            auth,
            registry,
            resolver,
            bus,
        })
    }

    /// Bus consumer: snapshot interested clients under the subscription
    /// lock, send after release. DEPTH frames queue-and-drop; LTP/QUOTE
    /// coalesce in each client's outbox.
    pub fn spawn_fanout(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut sub = server.bus.subscribe("");
            while let Some(msg) = sub.recv().await {
                let key = SubKey {
                    symbol: msg.tick.symbol.clone(),
                    exchange: msg.tick.exchange.clone(),
                    mode: msg.tick.mode,
                };
                let targets = {
                    let tables = server.state.subs.lock();
                    tables.fanout_targets(&msg.user_id, &key)
                };
                if targets.is_empty() {
                    continue;
                }

                let frame = market_data_frame(&msg);
                for outbox in targets {
                    if msg.tick.mode == Mode::Depth {
                        outbox.push_depth(frame.clone());
                    } else {
                        outbox.push_market(
                            (key.symbol.clone(), key.exchange.clone(), key.mode.as_u8()),
                            frame.clone(),
                        );
                    }
                }
            }
            info!("bus fan-out task ended");
        });
    }

    pub async fn adapter_for(&self, user_id: &str) -> Option<Arc<FeedAdapter>> {
        self.state.adapters.lock().await.get(user_id).cloned()
    }

    /// Authenticate a client and ensure its user has a live adapter.
    /// Adapter creation is mutually exclusive with disposal via the adapter
    /// lock; one adapter exists per user at any time.
    pub async fn authenticate_client(
        &self,
        client_id: ClientId,
        api_key: &str,
        outbox: Arc<Outbox>,
    ) -> Option<AuthInfo> {
        let info = match self.auth.verify(api_key).await {
            Ok(info) => info,
            Err(e) => {
                let code = match e.code() {
                    "INVALID_API_KEY" => WsErrorCode::InvalidApiKey,
                    _ => WsErrorCode::AuthenticationError,
                };
                outbox.push_control(error_frame(code, e.to_string()));
                return None;
            }
        };

        {
            let mut adapters = self.state.adapters.lock().await;
            if !adapters.contains_key(&info.user_id) {
                let broker = match self.registry.connect(&info.broker_name, &info.user_id) {
                    Ok(b) => b,
                    Err(e) => {
                        outbox.push_control(error_frame(WsErrorCode::BrokerError, e.to_string()));
                        return None;
                    }
                };
                let adapter = FeedAdapter::spawn(
                    &info.user_id,
                    broker,
                    self.resolver.clone(),
                    self.bus.clone(),
                );
                adapters.insert(info.user_id.clone(), adapter);
                info!(user = %info.user_id, broker = %info.broker_name, "feed adapter created");
            }
        }

        self.state
            .users
            .lock()
            .entry(info.user_id.clone())
            .or_default()
            .insert(client_id);

        self.state.subs.lock().register_client(
            client_id,
            crate::proxy::state::ClientHandle {
                user_id: info.user_id.clone(),
                broker: info.broker_name.clone(),
                outbox: outbox.clone(),
            },
        );

        outbox.push_control(authenticated_frame(&info.broker_name));
        Some(info)
    }

    /// Subscribe algorithm for one symbol. Pre-registration happens under
    /// the subscription lock; the broker call happens with no lock held;
    /// failure rolls the pre-registration back.
    pub async fn subscribe_symbol(
        &self,
        client_id: ClientId,
        user_id: &str,
        symbol: &SymbolRef,
        mode: Mode,
        depth_level: usize,
    ) -> SymbolResult {
        let Some(adapter) = self.adapter_for(user_id).await else {
            return SymbolResult::error(
                &symbol.symbol,
                &symbol.exchange,
                WsErrorCode::NotConnected,
                "no adapter for user",
            );
        };

        let key = SubKey {
            symbol: symbol.symbol.clone(),
            exchange: symbol.exchange.clone(),
            mode,
        };
        let user_key = (user_id.to_string(), key.clone());

        for _ in 0..PENDING_RETRIES {
            let pre = self.state.subs.lock().pre_register(client_id, &user_key);
            match pre {
                PreRegister::AlreadySubscribed => {
                    return SymbolResult::warning(
                        &symbol.symbol,
                        &symbol.exchange,
                        "already subscribed",
                    );
                }
                PreRegister::Shared => {
                    // No broker call; report the established truncation.
                    let mut result = SymbolResult::success(&symbol.symbol, &symbol.exchange);
                    result.message = Some("shared with other clients".into());
                    if let Ok(outcome) = adapter
                        .subscribe(&symbol.symbol, &symbol.exchange, mode, depth_level)
                        .await
                    {
                        result.actual_depth = Some(outcome.actual_depth);
                        result.broker_supported = Some(outcome.broker_supported);
                    }
                    return result;
                }
                PreRegister::First => {
                    match adapter
                        .subscribe(&symbol.symbol, &symbol.exchange, mode, depth_level)
                        .await
                    {
                        Ok(outcome) => {
                            self.state.subs.lock().commit_first(client_id, &user_key);
                            let mut result =
                                SymbolResult::success(&symbol.symbol, &symbol.exchange);
                            result.actual_depth = Some(outcome.actual_depth);
                            result.broker_supported = Some(outcome.broker_supported);
                            return result;
                        }
                        Err(e) => {
                            self.state.subs.lock().rollback_first(client_id, &user_key);
                            return SymbolResult::error(
                                &symbol.symbol,
                                &symbol.exchange,
                                WsErrorCode::from(&e),
                                e.to_string(),
                            );
                        }
                    }
                }
                PreRegister::Wait => {
                    sleep(PENDING_RETRY).await;
                }
            }
        }

        SymbolResult::error(
            &symbol.symbol,
            &symbol.exchange,
            WsErrorCode::ProcessingError,
            "subscription contended, retry",
        )
    }

    /// Unsubscribe for one symbol; issues the broker unsubscribe only when
    /// the reference count reaches zero.
    pub async fn unsubscribe_symbol(
        &self,
        client_id: ClientId,
        user_id: &str,
        symbol: &SymbolRef,
        mode: Mode,
    ) -> SymbolResult {
        let key = SubKey {
            symbol: symbol.symbol.clone(),
            exchange: symbol.exchange.clone(),
            mode,
        };
        let user_key = (user_id.to_string(), key.clone());

        let last = match self.state.subs.lock().remove_subscription(client_id, &user_key) {
            Ok(last) => last,
            Err(()) => {
                return SymbolResult::error(
                    &symbol.symbol,
                    &symbol.exchange,
                    WsErrorCode::NotSubscribed,
                    "not subscribed",
                );
            }
        };

        if last {
            if let Some(adapter) = self.adapter_for(user_id).await {
                // Best effort; never resurrect table state on failure.
                if let Err(e) = adapter
                    .unsubscribe(&symbol.symbol, &symbol.exchange, mode)
                    .await
                {
                    warn!(user = user_id, symbol = %symbol.symbol, error = %e, "broker unsubscribe failed");
                }
            }
        }
        SymbolResult::success(&symbol.symbol, &symbol.exchange)
    }

    /// Disconnect cleanup. Not cancellable; runs to completion after the
    /// read loop ends.
    pub async fn cleanup_client(&self, client_id: ClientId) {
        let (user_id, last_keys) = {
            let mut tables = self.state.subs.lock();
            let Some(user) = tables.client_user(client_id).map(|u| u.to_string()) else {
                return;
            };
            let last = tables.remove_client(client_id);
            (user, last)
        };

        let adapter = self.adapter_for(&user_id).await;
        if let Some(adapter) = &adapter {
            for key in &last_keys {
                if let Err(e) = adapter.unsubscribe(&key.symbol, &key.exchange, key.mode).await {
                    warn!(user = %user_id, symbol = %key.symbol, error = %e, "cleanup unsubscribe failed");
                }
            }
        }

        let user_empty = {
            let mut users = self.state.users.lock();
            if let Some(set) = users.get_mut(&user_id) {
                set.remove(&client_id);
                if set.is_empty() {
                    users.remove(&user_id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if user_empty {
            let removed = {
                let mut adapters = self.state.adapters.lock().await;
                // Re-check under the adapter lock: a client may have
                // re-authenticated for this user meanwhile.
                if self.state.users.lock().contains_key(&user_id) {
                    None
                } else if let Some(adapter) = adapters.get(&user_id).cloned() {
                    if adapter.retain_session_on_empty() {
                        Some((adapter, false))
                    } else {
                        adapters.remove(&user_id);
                        Some((adapter, true))
                    }
                } else {
                    None
                }
            };

            match removed {
                Some((adapter, true)) => {
                    adapter.disconnect().await;
                    info!(user = %user_id, "last client left, adapter disconnected");
                }
                Some((adapter, false)) => {
                    if let Err(e) = adapter.unsubscribe_all().await {
                        warn!(user = %user_id, error = %e, "soft unsubscribe_all failed");
                    }
                    info!(user = %user_id, "last client left, session retained");
                }
                None => {}
            }
        }

        debug!(client = client_id, user = %user_id, "client cleaned up");
    }

    async fn handle_request(
        &self,
        client_id: ClientId,
        auth: &mut Option<AuthInfo>,
        outbox: &Arc<Outbox>,
        text: &str,
    ) {
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                let code = if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                    WsErrorCode::InvalidAction
                } else {
                    WsErrorCode::InvalidJson
                };
                outbox.push_control(error_frame(code, e.to_string()));
                return;
            }
        };

        match request {
            ClientRequest::Authenticate { api_key } => {
                *auth = self.authenticate_client(client_id, &api_key, outbox.clone()).await;
            }
            ClientRequest::Subscribe {
                symbols,
                mode,
                depth_level,
            } => {
                let Some(info) = auth.as_ref() else {
                    outbox.push_control(error_frame(
                        WsErrorCode::NotAuthenticated,
                        "authenticate first",
                    ));
                    return;
                };
                let Ok(mode) = Mode::try_from(mode) else {
                    outbox.push_control(error_frame(
                        WsErrorCode::InvalidParameters,
                        "mode must be 1, 2 or 4",
                    ));
                    return;
                };
                if symbols.is_empty() {
                    outbox.push_control(error_frame(
                        WsErrorCode::InvalidParameters,
                        "symbols must be non-empty",
                    ));
                    return;
                }
                let depth = depth_level.unwrap_or(5);
                let mut results = Vec::with_capacity(symbols.len());
                for symbol in &symbols {
                    results.push(
                        self.subscribe_symbol(client_id, &info.user_id, symbol, mode, depth)
                            .await,
                    );
                }
                outbox.push_control(subscribe_response_frame(mode, &results));
            }
            ClientRequest::Unsubscribe { symbols, mode } => {
                let Some(info) = auth.as_ref() else {
                    outbox.push_control(error_frame(
                        WsErrorCode::NotAuthenticated,
                        "authenticate first",
                    ));
                    return;
                };
                let Ok(mode) = Mode::try_from(mode) else {
                    outbox.push_control(error_frame(
                        WsErrorCode::InvalidParameters,
                        "mode must be 1, 2 or 4",
                    ));
                    return;
                };
                let mut results = Vec::with_capacity(symbols.len());
                for symbol in &symbols {
                    results.push(
                        self.unsubscribe_symbol(client_id, &info.user_id, symbol, mode)
                            .await,
                    );
                }
                outbox.push_control(unsubscribe_response_frame(mode, &results));
            }
            ClientRequest::UnsubscribeAll => {
                let Some(info) = auth.as_ref() else {
                    outbox.push_control(error_frame(
                        WsErrorCode::NotAuthenticated,
                        "authenticate first",
                    ));
                    return;
                };
                let keys = self.state.subs.lock().client_keys(client_id);
                let mut count = 0usize;
                for key in keys {
                    let symbol = SymbolRef {
                        symbol: key.symbol.clone(),
                        exchange: key.exchange.clone(),
                    };
                    let result = self
                        .unsubscribe_symbol(client_id, &info.user_id, &symbol, key.mode)
                        .await;
                    if result.status == "success" {
                        count += 1;
                    }
                }
                outbox.push_control(unsubscribe_all_frame(count));
            }
        }
    }
}

/// Axum handler for `GET /ws`.
pub async fn ws_handler(
    State(server): State<Arc<ProxyServer>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: Arc<ProxyServer>) {
    let client_id = server.state.next_client_id();
    let outbox = Arc::new(Outbox::new());
    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbox so slow sockets back-pressure into
    // coalescing, never into the bus.
    let writer_outbox = outbox.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_outbox.next().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut auth: Option<AuthInfo> = None;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                server
                    .handle_request(client_id, &mut auth, &outbox, &text)
                    .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Cleanup is not cancellable and must complete even if the socket died.
    server.cleanup_client(client_id).await;
    outbox.close();
    let _ = writer.await;
    debug!(client = client_id, "socket closed");
}
