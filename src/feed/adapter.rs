//! Per-(user, broker) ingestion adapter.
//!
//! Owns the broker-facing connection pool, records subscriptions for replay,
//! normalizes raw frames and republishes them on the bus. Reconnects with
//! capped exponential backoff; ticks received while a slot is down are
//! dropped, not queued.

use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::hash_map::DefaultHasher,
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    broker::{BrokerClient, BrokerError, BrokerEvent, BrokerQuote, RawTick, DEPTH_LEVELS},
    bus::{Bus, BusMessage},
    config::now_ms,
    feed::normalize::normalize_tick,
    models::{Mode, SubKey},
    symbols::SymbolResolver,
};

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const HEARTBEAT_SWEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub actual_depth: usize,
    pub broker_supported: bool,
}

#[derive(Debug, Clone)]
struct SubRecord {
    token: String,
    broker_exchange: String,
    slot: usize,
    actual_depth: usize,
    broker_supported: bool,
}

struct AdapterState {
    subs: HashMap<SubKey, SubRecord>,
    by_token: HashMap<(String, String, Mode), SubKey>,
    slot_counts: Vec<usize>,
    slot_live: Vec<bool>,
    slot_reconnecting: Vec<bool>,
    last_event: Vec<Instant>,
}

impl AdapterState {
    fn new(pool_size: usize) -> Self {
        Self {
            subs: HashMap::new(),
            by_token: HashMap::new(),
            slot_counts: vec![0; pool_size],
            slot_live: vec![false; pool_size],
            slot_reconnecting: vec![false; pool_size],
            last_event: vec![Instant::now(); pool_size],
        }
    }
}

/// Deterministic pool routing: a subscription's slot is stable for its
/// lifetime.
fn pool_index(symbol: &str, exchange: &str, pool_size: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    exchange.hash(&mut hasher);
    (hasher.finish() as usize) % pool_size.max(1)
}

pub struct FeedAdapter {
    user_id: String,
    broker: Arc<dyn BrokerClient>,
    resolver: Arc<SymbolResolver>,
    bus: Bus,
    state: Mutex<AdapterState>,
    run_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disconnected: AtomicBool,
}

impl FeedAdapter {
    pub fn spawn(
        user_id: &str,
        broker: Arc<dyn BrokerClient>,
        resolver: Arc<SymbolResolver>,
        bus: Bus,
    ) -> Arc<Self> {
        let pool_size = broker.capabilities().pool_size;
        // Attach to the event stream before the task starts so nothing
        // emitted between construction and the first poll is missed.
        let events = broker.events();
        let adapter = Arc::new(Self {
            user_id: user_id.to_string(),
            broker,
            resolver,
            bus,
            state: Mutex::new(AdapterState::new(pool_size)),
            run_task: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        });

        let task_adapter = adapter.clone();
        let handle = tokio::spawn(async move {
            task_adapter.run(events).await;
        });
        *adapter.run_task.lock() = Some(handle);

        adapter
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn broker_name(&self) -> &str {
        self.broker.broker()
    }

    pub fn retain_session_on_empty(&self) -> bool {
        self.broker.capabilities().retain_session_on_empty
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subs.len()
    }

    /// Subscribe at the broker feed. Pre-registers the record so concurrent
    /// callers see consistent slot accounting, then rolls back if the broker
    /// call fails or times out.
    pub async fn subscribe(
        &self,
        symbol: &str,
        exchange: &str,
        mode: Mode,
        depth_level: usize,
    ) -> Result<SubscribeOutcome, BrokerError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        if mode == Mode::Depth && !DEPTH_LEVELS.contains(&depth_level) {
            return Err(BrokerError::UnsupportedDepthLevel(depth_level));
        }

        let caps = self.broker.capabilities().clone();
        let contract = self
            .resolver
            .resolve(self.broker.broker(), symbol, exchange)?;
        let (actual_depth, broker_supported) = caps.best_depth(depth_level);
        let key = SubKey {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            mode,
        };
        let slot = pool_index(symbol, exchange, caps.pool_size);

        let needs_connect = {
            let mut state = self.state.lock();
            if let Some(existing) = state.subs.get(&key) {
                return Ok(SubscribeOutcome {
                    actual_depth: existing.actual_depth,
                    broker_supported: existing.broker_supported,
                });
            }
            if state.slot_reconnecting[slot] {
                return Err(BrokerError::NotConnected);
            }
            if state.slot_counts[slot] >= caps.max_symbols_per_conn {
                return Err(BrokerError::LimitExceeded);
            }

            state.subs.insert(
                key.clone(),
                SubRecord {
                    token: contract.broker_token.clone(),
                    broker_exchange: contract.broker_exchange.clone(),
                    slot,
                    actual_depth,
                    broker_supported,
                },
            );
            state.by_token.insert(
                (
                    contract.broker_token.clone(),
                    contract.broker_exchange.clone(),
                    mode,
                ),
                key.clone(),
            );
            state.slot_counts[slot] += 1;
            !state.slot_live[slot]
        };

        let result = async {
            if needs_connect {
                timeout(caps.call_timeout, self.broker.connect_slot(slot))
                    .await
                    .map_err(|_| BrokerError::Timeout)??;
                self.state.lock().slot_live[slot] = true;
            }
            timeout(
                caps.call_timeout,
                self.broker.subscribe(
                    slot,
                    &contract.broker_token,
                    &contract.broker_exchange,
                    mode,
                    actual_depth,
                ),
            )
            .await
            .map_err(|_| BrokerError::Timeout)?
        }
        .await;

        if let Err(e) = result {
            let mut state = self.state.lock();
            if state.subs.remove(&key).is_some() {
                state.slot_counts[slot] = state.slot_counts[slot].saturating_sub(1);
            }
            state.by_token.remove(&(
                contract.broker_token.clone(),
                contract.broker_exchange.clone(),
                mode,
            ));
            return Err(e);
        }

        debug!(
            user = %self.user_id,
            symbol,
            exchange,
            mode = mode.as_str(),
            slot,
            actual_depth,
            "broker subscribe ok"
        );
        Ok(SubscribeOutcome {
            actual_depth,
            broker_supported,
        })
    }

    /// Remove the local record and forward the unsubscribe to the broker.
    /// Removing an unknown key is a no-op (the proxy owns NOT_SUBSCRIBED).
    pub async fn unsubscribe(
        &self,
        symbol: &str,
        exchange: &str,
        mode: Mode,
    ) -> Result<(), BrokerError> {
        let key = SubKey {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            mode,
        };
        let record = {
            let mut state = self.state.lock();
            let Some(record) = state.subs.remove(&key) else {
                return Ok(());
            };
            state.by_token.remove(&(
                record.token.clone(),
                record.broker_exchange.clone(),
                mode,
            ));
            state.slot_counts[record.slot] = state.slot_counts[record.slot].saturating_sub(1);
            record
        };

        let caps = self.broker.capabilities();
        match timeout(
            caps.call_timeout,
            self.broker
                .unsubscribe(record.slot, &record.token, &record.broker_exchange, mode),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // Do not resurrect local state; the broker may already have
                // dropped the stream.
                warn!(user = %self.user_id, symbol, exchange, error = %e, "broker unsubscribe failed");
                Ok(())
            }
            Err(_) => {
                warn!(user = %self.user_id, symbol, exchange, "broker unsubscribe timed out");
                Ok(())
            }
        }
    }

    /// Soft reset for brokers whose session is expensive to rebuild.
    pub async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            state.subs.clear();
            state.by_token.clear();
            for c in state.slot_counts.iter_mut() {
                *c = 0;
            }
        }
        self.broker.unsubscribe_all().await
    }

    /// Release all resources. Idempotent.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.run_task.lock().take() {
            handle.abort();
        }
        {
            let mut state = self.state.lock();
            state.subs.clear();
            state.by_token.clear();
        }
        self.broker.shutdown().await;
        info!(user = %self.user_id, broker = %self.broker.broker(), "feed adapter disconnected");
    }

    /// Live quote passthrough for the execution engine.
    pub async fn quote(&self, symbol: &str, exchange: &str) -> Result<BrokerQuote, BrokerError> {
        let contract = self
            .resolver
            .resolve(self.broker.broker(), symbol, exchange)?;
        let caps = self.broker.capabilities();
        let mut q = timeout(
            caps.call_timeout,
            self.broker
                .quote(&contract.broker_token, &contract.broker_exchange),
        )
        .await
        .map_err(|_| BrokerError::Timeout)??;

        let divisor = caps.price_divisor();
        if divisor != 1.0 {
            q.ltp /= divisor;
            q.bid = q.bid.map(|v| v / divisor);
            q.ask = q.ask.map(|v| v / divisor);
            q.open = q.open.map(|v| v / divisor);
            q.high = q.high.map(|v| v / divisor);
            q.low = q.low.map(|v| v / divisor);
            q.close = q.close.map(|v| v / divisor);
        }
        Ok(q)
    }

    async fn run(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<crate::broker::BrokerEvent>,
    ) {
        let mut sweep = interval(HEARTBEAT_SWEEP);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.disconnected.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                ev = events.recv() => {
                    match ev {
                        Ok(BrokerEvent::Tick(raw)) => self.handle_tick(raw),
                        Ok(BrokerEvent::SlotUp { slot }) => {
                            let mut state = self.state.lock();
                            if slot < state.slot_live.len() {
                                state.slot_live[slot] = true;
                                state.last_event[slot] = Instant::now();
                            }
                        }
                        Ok(BrokerEvent::SlotDown { slot, reason }) => {
                            warn!(user = %self.user_id, slot, reason = %reason, "feed slot lost");
                            Self::mark_down_and_reconnect(&self, slot);
                        }
                        Ok(BrokerEvent::Heartbeat { slot }) => {
                            let mut state = self.state.lock();
                            if slot < state.last_event.len() {
                                state.last_event[slot] = Instant::now();
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(user = %self.user_id, lagged = n, "adapter lagged on broker events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = sweep.tick() => Self::check_heartbeats(&self),
            }
        }
    }

    fn handle_tick(&self, raw: RawTick) {
        let (key, record) = {
            let state = self.state.lock();
            if raw.slot >= state.slot_live.len() || !state.slot_live[raw.slot] {
                // Mid-reconnect stragglers are dropped, not queued.
                return;
            }
            let Some(key) = state
                .by_token
                .get(&(raw.token.clone(), raw.broker_exchange.clone(), raw.mode))
                .cloned()
            else {
                return;
            };
            let Some(record) = state.subs.get(&key).cloned() else {
                return;
            };
            (key, record)
        };
        {
            let mut state = self.state.lock();
            state.last_event[record.slot] = Instant::now();
        }

        let divisor = self.broker.capabilities().price_divisor();
        let tick = normalize_tick(
            &raw,
            &key.symbol,
            &key.exchange,
            divisor,
            record.actual_depth,
            record.broker_supported,
        );
        self.bus.publish(BusMessage {
            user_id: self.user_id.clone(),
            broker: self.broker.broker().to_string(),
            topic: tick.topic(),
            tick: Arc::new(tick),
        });
    }

    fn check_heartbeats(adapter: &Arc<Self>) {
        let timeout = adapter.broker.capabilities().heartbeat_timeout;
        let stale: Vec<usize> = {
            let state = adapter.state.lock();
            (0..state.slot_live.len())
                .filter(|&s| {
                    state.slot_live[s]
                        && state.slot_counts[s] > 0
                        && state.last_event[s].elapsed() > timeout
                })
                .collect()
        };
        for slot in stale {
            warn!(user = %adapter.user_id, slot, "broker heartbeat silent, forcing reconnect");
            Self::mark_down_and_reconnect(adapter, slot);
        }
    }

    fn mark_down_and_reconnect(adapter: &Arc<Self>, slot: usize) {
        {
            let mut state = adapter.state.lock();
            if slot >= state.slot_live.len() {
                return;
            }
            state.slot_live[slot] = false;
            if state.slot_counts[slot] == 0 {
                // Nothing to replay; the slot reconnects lazily on demand.
                return;
            }
            if state.slot_reconnecting[slot] {
                return;
            }
            state.slot_reconnecting[slot] = true;
        }

        let adapter = adapter.clone();
        tokio::spawn(async move {
            adapter.reconnect_slot(slot).await;
        });
    }

    async fn reconnect_slot(self: Arc<Self>, slot: usize) {
        let mut backoff = RECONNECT_INITIAL;
        loop {
            if self.disconnected.load(Ordering::SeqCst) {
                break;
            }
            match self.broker.connect_slot(slot).await {
                Ok(()) => {
                    // Replay recorded subscriptions before the slot goes live.
                    let replay: Vec<(SubKey, SubRecord)> = {
                        let state = self.state.lock();
                        state
                            .subs
                            .iter()
                            .filter(|(_, r)| r.slot == slot)
                            .map(|(k, r)| (k.clone(), r.clone()))
                            .collect()
                    };
                    for (key, record) in &replay {
                        if let Err(e) = self
                            .broker
                            .subscribe(
                                slot,
                                &record.token,
                                &record.broker_exchange,
                                key.mode,
                                record.actual_depth,
                            )
                            .await
                        {
                            warn!(
                                user = %self.user_id,
                                symbol = %key.symbol,
                                error = %e,
                                "subscription replay failed"
                            );
                        }
                    }
                    let mut state = self.state.lock();
                    state.slot_live[slot] = true;
                    state.slot_reconnecting[slot] = false;
                    state.last_event[slot] = Instant::now();
                    info!(user = %self.user_id, slot, replayed = replay.len(), "feed slot recovered");
                    break;
                }
                Err(e) => {
                    debug!(user = %self.user_id, slot, error = %e, "reconnect attempt failed");
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(0.8..1.2)
                    };
                    sleep(backoff.mul_f64(jitter)).await;
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    }
}

impl Drop for FeedAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.run_task.lock().take() {
            handle.abort();
        }
    }
}
