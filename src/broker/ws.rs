//! JSON-over-WebSocket broker transport.
//!
//! One `WsBroker` per (user, broker); each pool slot is a physical
//! WebSocket connection driven by its own task. Slot tasks do not
//! self-reconnect: on any stream error they emit `SlotDown` and exit, and
//! the owning feed adapter re-dials with backoff and replays subscriptions.
//!
//! Wire frames (text JSON):
//!   out: {"t":"subscribe","token":"3045","exchange":"NSE","mode":2,"depth":5}
//!        {"t":"unsubscribe","token":"3045","exchange":"NSE","mode":2}
//!        {"t":"ping"}
//!   in:  {"t":"tick","token":"3045","exchange":"NSE","mode":2,"ltp":...}
//!        {"t":"hb"}

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerCapabilities, BrokerClient, BrokerConfig, BrokerError, BrokerEvent, BrokerOrderRequest,
    BrokerQuote, RawTick,
};
use crate::models::Mode;

#[derive(Debug)]
enum SlotCommand {
    Send(String),
    Close,
}

struct SlotHandle {
    tx: mpsc::Sender<SlotCommand>,
}

type QuoteCache = Arc<RwLock<HashMap<(String, String), BrokerQuote>>>;

pub struct WsBroker {
    config: BrokerConfig,
    user_id: String,
    event_tx: broadcast::Sender<BrokerEvent>,
    slots: Mutex<HashMap<usize, SlotHandle>>,
    /// Latest quote per (broker_exchange, token), fed by the tick stream.
    quotes: QuoteCache,
}

impl WsBroker {
    pub fn new(config: BrokerConfig, user_id: &str) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(8192);
        Arc::new(Self {
            config,
            user_id: user_id.to_string(),
            event_tx,
            slots: Mutex::new(HashMap::new()),
            quotes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn send_to_slot(&self, slot: usize, frame: String) -> Result<(), BrokerError> {
        let tx = {
            let slots = self.slots.lock();
            slots.get(&slot).map(|h| h.tx.clone())
        };
        let Some(tx) = tx else {
            return Err(BrokerError::NotConnected);
        };
        tx.send(SlotCommand::Send(frame))
            .await
            .map_err(|_| BrokerError::NotConnected)
    }
}

fn record_quote(quotes: &QuoteCache, tick: &RawTick) {
    let key = (tick.broker_exchange.clone(), tick.token.clone());
    let mut map = quotes.write();
    let entry = map.entry(key).or_default();
    entry.ltp = tick.ltp;
    if tick.bid.is_some() {
        entry.bid = tick.bid;
    }
    if tick.ask.is_some() {
        entry.ask = tick.ask;
    }
    if tick.open.is_some() {
        entry.open = tick.open;
    }
    if tick.high.is_some() {
        entry.high = tick.high;
    }
    if tick.low.is_some() {
        entry.low = tick.low;
    }
    if tick.close.is_some() {
        entry.close = tick.close;
    }
    if tick.volume.is_some() {
        entry.volume = tick.volume;
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    t: String,
    #[serde(flatten)]
    tick: RawTick,
}

fn handle_frame(
    broker: &str,
    slot: usize,
    text: &str,
    event_tx: &broadcast::Sender<BrokerEvent>,
    quotes: &QuoteCache,
) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(broker, slot, error = %e, "unparseable broker frame");
            return;
        }
    };

    match frame.t.as_str() {
        "tick" => {
            let mut tick = frame.tick;
            tick.slot = slot;
            record_quote(quotes, &tick);
            let _ = event_tx.send(BrokerEvent::Tick(tick));
        }
        "hb" | "pong" => {
            let _ = event_tx.send(BrokerEvent::Heartbeat { slot });
        }
        other => {
            debug!(broker, slot, frame = other, "ignoring broker frame");
        }
    }
}

#[async_trait]
impl BrokerClient for WsBroker {
    fn broker(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &BrokerCapabilities {
        &self.config.capabilities
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_tx.subscribe()
    }

    async fn connect_slot(&self, slot: usize) -> Result<(), BrokerError> {
        // Replace any previous handle; the old task sees a Close and exits.
        if let Some(old) = self.slots.lock().remove(&slot) {
            let _ = old.tx.try_send(SlotCommand::Close);
        }

        let (ws_stream, resp) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| BrokerError::Broker(format!("connect: {e}")))?;
        info!(
            broker = %self.config.name,
            user = %self.user_id,
            slot,
            status = %resp.status(),
            "broker feed connected"
        );

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SlotCommand>(256);
        self.slots.lock().insert(slot, SlotHandle { tx: cmd_tx });

        let event_tx = self.event_tx.clone();
        let broker = self.config.name.clone();
        let quotes = self.quotes.clone();

        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();
            let mut ping = interval(Duration::from_secs(10));
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let _ = event_tx.send(BrokerEvent::SlotUp { slot });

            let reason = loop {
                tokio::select! {
                    _ = ping.tick() => {
                        if write.send(Message::Text("{\"t\":\"ping\"}".to_string())).await.is_err() {
                            break "ping write failed".to_string();
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(SlotCommand::Send(frame)) => {
                                if write.send(Message::Text(frame)).await.is_err() {
                                    break "command write failed".to_string();
                                }
                            }
                            Some(SlotCommand::Close) | None => {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }
                    ws_msg = read.next() => {
                        let Some(ws_msg) = ws_msg else {
                            break "stream ended".to_string();
                        };
                        match ws_msg {
                            Ok(Message::Text(text)) => {
                                handle_frame(&broker, slot, &text, &event_tx, &quotes);
                            }
                            Ok(Message::Ping(payload)) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Ok(Message::Close(frame)) => {
                                break format!("closed by broker: {frame:?}");
                            }
                            Ok(_) => {}
                            Err(e) => break format!("stream error: {e}"),
                        }
                    }
                }
            };

            warn!(broker = %broker, slot, reason = %reason, "broker feed slot down");
            let _ = event_tx.send(BrokerEvent::SlotDown { slot, reason });
        });

        Ok(())
    }

    async fn subscribe(
        &self,
        slot: usize,
        token: &str,
        broker_exchange: &str,
        mode: Mode,
        depth: usize,
    ) -> Result<(), BrokerError> {
        let frame = serde_json::json!({
            "t": "subscribe",
            "token": token,
            "exchange": broker_exchange,
            "mode": mode.as_u8(),
            "depth": depth,
        });
        self.send_to_slot(slot, frame.to_string()).await
    }

    async fn unsubscribe(
        &self,
        slot: usize,
        token: &str,
        broker_exchange: &str,
        mode: Mode,
    ) -> Result<(), BrokerError> {
        let frame = serde_json::json!({
            "t": "unsubscribe",
            "token": token,
            "exchange": broker_exchange,
            "mode": mode.as_u8(),
        });
        self.send_to_slot(slot, frame.to_string()).await
    }

    async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        let slots: Vec<usize> = self.slots.lock().keys().copied().collect();
        for slot in slots {
            let _ = self
                .send_to_slot(slot, "{\"t\":\"unsubscribe_all\"}".to_string())
                .await;
        }
        Ok(())
    }

    async fn quote(&self, token: &str, broker_exchange: &str) -> Result<BrokerQuote, BrokerError> {
        self.quotes
            .read()
            .get(&(broker_exchange.to_string(), token.to_string()))
            .copied()
            .ok_or(BrokerError::NotConnected)
    }

    async fn place_order(&self, _req: &BrokerOrderRequest) -> Result<String, BrokerError> {
        Err(BrokerError::Broker(
            "live order routing is not configured on the feed transport".into(),
        ))
    }

    async fn modify_order(
        &self,
        _order_id: &str,
        _req: &BrokerOrderRequest,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::Broker(
            "live order routing is not configured on the feed transport".into(),
        ))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        Err(BrokerError::Broker(
            "live order routing is not configured on the feed transport".into(),
        ))
    }

    async fn shutdown(&self) {
        let handles: Vec<SlotHandle> = {
            let mut slots = self.slots.lock();
            slots.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.tx.try_send(SlotCommand::Close);
        }
    }
}
