//! Per-client send buffer between the fan-out task and the socket writer.
//!
//! A slow client must never block the bus, so pushes are non-blocking and
//! bounded: control frames (auth/subscribe responses, errors) queue FIFO and
//! are never dropped; LTP/QUOTE market data coalesces per
//! (symbol, exchange, mode) so the newest tick supersedes an undelivered
//! one; DEPTH frames queue FIFO and are dropped (counted) when the bound is
//! reached, because order books are not composable.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;

pub type MarketKey = (String, String, u8);

const DEPTH_QUEUE_CAP: usize = 256;

#[derive(Default)]
struct OutboxInner {
    control: VecDeque<String>,
    market_order: VecDeque<MarketKey>,
    market_latest: HashMap<MarketKey, String>,
    depth: VecDeque<String>,
    depth_dropped: u64,
    closed: bool,
}

pub struct Outbox {
    inner: Mutex<OutboxInner>,
    notify: Notify,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OutboxInner::default()),
            notify: Notify::new(),
        }
    }

    pub fn push_control(&self, frame: String) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.control.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn push_market(&self, key: MarketKey, frame: String) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if inner.market_latest.insert(key.clone(), frame).is_none() {
                inner.market_order.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    pub fn push_depth(&self, frame: String) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if inner.depth.len() >= DEPTH_QUEUE_CAP {
                inner.depth_dropped += 1;
                return;
            }
            inner.depth.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn depth_dropped(&self) -> u64 {
        self.inner.lock().depth_dropped
    }

    /// Wake the writer and refuse further frames.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Next frame for the wire, control first, then depth, then coalesced
    /// market data. Returns `None` once closed and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.control.pop_front() {
                    return Some(frame);
                }
                if let Some(frame) = inner.depth.pop_front() {
                    return Some(frame);
                }
                if let Some(key) = inner.market_order.pop_front() {
                    if let Some(frame) = inner.market_latest.remove(&key) {
                        return Some(frame);
                    }
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}
