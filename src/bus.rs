//! In-process pub/sub between feed adapters and the client-facing proxy.
//!
//! Topics are `EXCHANGE|SYMBOL|MODE` text; payloads are normalized ticks
//! shared by `Arc`. Delivery is at-most-once with per-publisher-per-topic
//! ordering. A slow subscriber never blocks publishers: when its queue
//! overflows, the oldest messages are dropped and counted.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::Tick;

/// A tick on the bus, tagged with the publishing adapter's identity. The
/// `broker` field is carried out-of-band and stamped onto the client payload
/// by the fan-out task, not by the adapter payload itself.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub user_id: String,
    pub broker: String,
    pub topic: String,
    pub tick: Arc<Tick>,
}

#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<BusMessage>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Non-blocking publish. Returns the number of live subscribers.
    pub fn publish(&self, message: BusMessage) -> usize {
        match self.tx.send(message) {
            Ok(n) => n,
            Err(e) => {
                // No subscribers yet; ticks before the proxy attaches are dropped.
                trace!(topic = %e.0.topic, "bus publish with no subscribers");
                0
            }
        }
    }

    /// Subscribe with a topic prefix filter. An empty prefix matches all
    /// topics (the proxy's fan-out subscribes this way).
    pub fn subscribe(&self, topic_prefix: &str) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
            prefix: topic_prefix.to_string(),
            dropped: AtomicU64::new(0),
        }
    }
}

pub struct BusSubscriber {
    rx: broadcast::Receiver<BusMessage>,
    prefix: String,
    dropped: AtomicU64,
}

impl BusSubscriber {
    /// Receive the next message matching the filter. Returns `None` once the
    /// bus is closed. Overflow is absorbed here: lagging drops the oldest
    /// messages for this subscriber only and increments the counter.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if msg.topic.starts_with(&self.prefix) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    trace!(lagged = n, "bus subscriber dropped oldest messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{topic, Mode};

    fn tick(symbol: &str, exchange: &str, mode: Mode, ltp: f64) -> BusMessage {
        let tick = Tick {
            symbol: symbol.into(),
            exchange: exchange.into(),
            mode,
            ltp,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            bid: None,
            ask: None,
            depth: None,
            ts_ms: 0,
        };
        BusMessage {
            user_id: "u1".into(),
            broker: "mock".into(),
            topic: topic(exchange, symbol, mode),
            tick: Arc::new(tick),
        }
    }

    #[tokio::test]
    async fn prefix_filter_selects_topics() {
        let bus = Bus::new(64);
        let mut nse = bus.subscribe("NSE|");
        let mut all = bus.subscribe("");

        bus.publish(tick("SBIN", "NSE", Mode::Ltp, 800.0));
        bus.publish(tick("SENSEX", "BSE", Mode::Ltp, 81000.0));

        let first = nse.recv().await.unwrap();
        assert_eq!(first.topic, "NSE|SBIN|1");

        assert_eq!(all.recv().await.unwrap().topic, "NSE|SBIN|1");
        assert_eq!(all.recv().await.unwrap().topic, "BSE|SENSEX|1");
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let bus = Bus::new(64);
        let mut sub = bus.subscribe("");
        for i in 0..10 {
            bus.publish(tick("SBIN", "NSE", Mode::Ltp, 800.0 + i as f64));
        }
        for i in 0..10 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.tick.ltp, 800.0 + i as f64);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = Bus::new(4);
        let mut sub = bus.subscribe("");
        for i in 0..12 {
            bus.publish(tick("SBIN", "NSE", Mode::Ltp, i as f64));
        }

        // Oldest 8 were evicted; the newest 4 survive in order.
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.tick.ltp, 8.0);
        assert_eq!(sub.dropped(), 8);
        for i in 9..12 {
            assert_eq!(sub.recv().await.unwrap().tick.ltp, i as f64);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = Bus::new(4);
        assert_eq!(bus.publish(tick("SBIN", "NSE", Mode::Ltp, 1.0)), 0);
    }
}
