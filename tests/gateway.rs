//! End-to-end scenarios: shared subscriptions with reference counting,
//! rollback on broker failure, tick fan-out to client outboxes, and the
//! order-to-fill-to-funds path.

use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::broadcast;

use tradegate::{
    auth::{AuthInfo, AuthPort},
    broker::{
        BrokerCapabilities, BrokerClient, BrokerError, BrokerEvent, BrokerOrderRequest,
        BrokerQuote, BrokerRegistry, QuoteSource, RawTick,
    },
    bus::Bus,
    config::SandboxConfig,
    engine::ExecutionEngine,
    error::AuthError,
    feed::FeedAdapter,
    models::{Action, Mode, OrderStatus, PriceType, Product},
    orders::{OrderService, PlaceOrderRequest},
    proxy::{outbox::Outbox, state::ClientHandle, ProxyServer},
    proxy::messages::SymbolRef,
    store::SandboxStore,
    symbols::{SymbolContract, SymbolResolver},
};

struct MockBroker {
    caps: BrokerCapabilities,
    event_tx: broadcast::Sender<BrokerEvent>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    fail_subscribe: AtomicBool,
    shutdown: AtomicBool,
}

impl MockBroker {
    fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            caps: BrokerCapabilities {
                pool_size: 2,
                supported_depths: vec![5, 20],
                ..Default::default()
            },
            event_tx,
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn broker(&self) -> &str {
        "mock"
    }
    fn capabilities(&self) -> &BrokerCapabilities {
        &self.caps
    }
    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_tx.subscribe()
    }
    async fn connect_slot(&self, slot: usize) -> Result<(), BrokerError> {
        let _ = self.event_tx.send(BrokerEvent::SlotUp { slot });
        Ok(())
    }
    async fn subscribe(
        &self,
        _slot: usize,
        token: &str,
        _bex: &str,
        _mode: Mode,
        _depth: usize,
    ) -> Result<(), BrokerError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::SymbolNotFound(token.to_string()));
        }
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn unsubscribe(
        &self,
        _slot: usize,
        _token: &str,
        _bex: &str,
        _mode: Mode,
    ) -> Result<(), BrokerError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        Ok(())
    }
    async fn quote(&self, _token: &str, _bex: &str) -> Result<BrokerQuote, BrokerError> {
        Ok(BrokerQuote {
            ltp: 2500.0,
            bid: Some(2499.0),
            ask: Some(2500.0),
            ..Default::default()
        })
    }
    async fn place_order(&self, _req: &BrokerOrderRequest) -> Result<String, BrokerError> {
        Ok("live-1".into())
    }
    async fn modify_order(&self, _id: &str, _req: &BrokerOrderRequest) -> Result<(), BrokerError> {
        Ok(())
    }
    async fn cancel_order(&self, _id: &str) -> Result<(), BrokerError> {
        Ok(())
    }
    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

struct StaticAuth;

#[async_trait]
impl AuthPort for StaticAuth {
    async fn verify(&self, api_key: &str) -> Result<AuthInfo, AuthError> {
        if api_key == "good-key" {
            Ok(AuthInfo {
                user_id: "u1".into(),
                broker_name: "mock".into(),
            })
        } else {
            Err(AuthError::InvalidApiKey)
        }
    }
}

struct Fixture {
    proxy: Arc<ProxyServer>,
    broker: Arc<MockBroker>,
    bus: Bus,
    resolver: Arc<SymbolResolver>,
    _files: Vec<tempfile::NamedTempFile>,
}

async fn fixture() -> Fixture {
    let sym_db = tempfile::NamedTempFile::new().unwrap();
    let resolver = Arc::new(SymbolResolver::new(sym_db.path().to_str().unwrap()).unwrap());
    resolver
        .upsert_contracts(&[
            SymbolContract {
                symbol: "SBIN".into(),
                exchange: "NSE".into(),
                broker: "mock".into(),
                broker_token: "3045".into(),
                broker_exchange: "NSE".into(),
                lot_size: 1,
                tick_size: 0.05,
            },
            SymbolContract {
                symbol: "RELIANCE".into(),
                exchange: "NSE".into(),
                broker: "mock".into(),
                broker_token: "2885".into(),
                broker_exchange: "NSE".into(),
                lot_size: 1,
                tick_size: 0.05,
            },
        ])
        .unwrap();

    let bus = Bus::new(1024);
    let broker = MockBroker::new();
    let proxy = ProxyServer::new(
        Arc::new(StaticAuth),
        Arc::new(BrokerRegistry::new(vec![])),
        resolver.clone(),
        bus.clone(),
    );

    // Wire the user's adapter directly over the mock broker; the empty
    // registry never dials anything.
    let adapter = FeedAdapter::spawn("u1", broker.clone(), resolver.clone(), bus.clone());
    proxy
        .state
        .adapters
        .lock()
        .await
        .insert("u1".to_string(), adapter);

    Fixture {
        proxy,
        broker,
        bus,
        resolver,
        _files: vec![sym_db],
    }
}

fn attach_client(fx: &Fixture, id: u64) -> Arc<Outbox> {
    let outbox = Arc::new(Outbox::new());
    fx.proxy.state.subs.lock().register_client(
        id,
        ClientHandle {
            user_id: "u1".into(),
            broker: "mock".into(),
            outbox: outbox.clone(),
        },
    );
    fx.proxy
        .state
        .users
        .lock()
        .entry("u1".into())
        .or_default()
        .insert(id);
    outbox
}

fn sbin() -> SymbolRef {
    SymbolRef {
        symbol: "SBIN".into(),
        exchange: "NSE".into(),
    }
}

#[tokio::test]
async fn shared_subscription_refcounts_one_broker_call() {
    let fx = fixture().await;
    for id in 1..=3 {
        attach_client(&fx, id);
    }

    for id in 1..=3 {
        let result = fx
            .proxy
            .subscribe_symbol(id, "u1", &sbin(), Mode::Ltp, 5)
            .await;
        assert_eq!(result.status, "success", "client {id}: {result:?}");
    }

    // Broker subscribe exactly once; ref_count = 3.
    assert_eq!(fx.broker.subscribes.load(Ordering::SeqCst), 1);
    let key = ("u1".to_string(), tradegate::models::SubKey {
        symbol: "SBIN".into(),
        exchange: "NSE".into(),
        mode: Mode::Ltp,
    });
    assert_eq!(fx.proxy.state.subs.lock().ref_count(&key), 3);

    // Client 1 disconnects → 2 refs, no broker unsubscribe.
    fx.proxy.cleanup_client(1).await;
    assert_eq!(fx.proxy.state.subs.lock().ref_count(&key), 2);
    assert_eq!(fx.broker.unsubscribes.load(Ordering::SeqCst), 0);

    // Client 2 unsubscribes → 1 ref.
    let result = fx.proxy.unsubscribe_symbol(2, "u1", &sbin(), Mode::Ltp).await;
    assert_eq!(result.status, "success");
    assert_eq!(fx.proxy.state.subs.lock().ref_count(&key), 1);
    assert_eq!(fx.broker.unsubscribes.load(Ordering::SeqCst), 0);

    // Client 3 disconnects → 0 refs, broker unsubscribe exactly once, and
    // the user's adapter is torn down with its last client.
    fx.proxy.cleanup_client(3).await;
    assert_eq!(fx.proxy.state.subs.lock().ref_count(&key), 0);
    assert!(!fx.proxy.state.subs.lock().has_key(&key));
    assert_eq!(fx.broker.unsubscribes.load(Ordering::SeqCst), 1);
    assert!(fx.broker.shutdown.load(Ordering::SeqCst));
    assert!(fx.proxy.adapter_for("u1").await.is_none());
}

#[tokio::test]
async fn broker_failure_rolls_back_preregistration() {
    let fx = fixture().await;
    attach_client(&fx, 1);
    fx.broker.fail_subscribe.store(true, Ordering::SeqCst);

    let result = fx
        .proxy
        .subscribe_symbol(1, "u1", &sbin(), Mode::Quote, 5)
        .await;
    assert_eq!(result.status, "error");
    assert_eq!(result.code, Some(tradegate::error::WsErrorCode::SymbolNotFound));

    let key = ("u1".to_string(), tradegate::models::SubKey {
        symbol: "SBIN".into(),
        exchange: "NSE".into(),
        mode: Mode::Quote,
    });
    let tables = fx.proxy.state.subs.lock();
    assert!(!tables.has_key(&key));
    assert_eq!(tables.ref_count(&key), 0);
    assert_eq!(tables.client_sub_count(1), 0);
}

#[tokio::test]
async fn second_subscribe_warns_without_state_change() {
    let fx = fixture().await;
    attach_client(&fx, 1);

    let first = fx
        .proxy
        .subscribe_symbol(1, "u1", &sbin(), Mode::Ltp, 5)
        .await;
    assert_eq!(first.status, "success");

    let again = fx
        .proxy
        .subscribe_symbol(1, "u1", &sbin(), Mode::Ltp, 5)
        .await;
    assert_eq!(again.status, "warning");
    assert_eq!(fx.broker.subscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsubscribe_without_subscription_is_not_subscribed() {
    let fx = fixture().await;
    attach_client(&fx, 1);

    let result = fx.proxy.unsubscribe_symbol(1, "u1", &sbin(), Mode::Ltp).await;
    assert_eq!(result.status, "error");
    assert_eq!(result.code, Some(tradegate::error::WsErrorCode::NotSubscribed));
    assert_eq!(fx.broker.unsubscribes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tick_flows_from_broker_to_client_outbox() {
    let fx = fixture().await;
    fx.proxy.spawn_fanout();
    let outbox = attach_client(&fx, 1);

    let result = fx
        .proxy
        .subscribe_symbol(1, "u1", &sbin(), Mode::Ltp, 5)
        .await;
    assert_eq!(result.status, "success");
    // The authenticated-frame queue is empty; now push a tick through the
    // mock broker and expect a market_data frame.
    let _ = fx.broker.event_tx.send(BrokerEvent::Tick(RawTick {
        token: "3045".into(),
        broker_exchange: "NSE".into(),
        mode: Mode::Ltp,
        ltp: 812.5,
        ts_ms: Some(1_722_500_000_000),
        slot: {
            // Matches the adapter's deterministic pool routing for SBIN/NSE.
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut h = DefaultHasher::new();
            "SBIN".hash(&mut h);
            "NSE".hash(&mut h);
            (h.finish() as usize) % 2
        },
        ..Default::default()
    }));

    let frame = tokio::time::timeout(Duration::from_secs(2), outbox.next())
        .await
        .expect("tick should arrive")
        .expect("outbox open");
    let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(v["type"], "market_data");
    assert_eq!(v["symbol"], "SBIN");
    assert_eq!(v["broker"], "mock");
    assert_eq!(v["data"]["ltp"], 812.5);

    // An unrelated user's tick never reaches this client.
    fx.bus.publish(tradegate::bus::BusMessage {
        user_id: "u2".into(),
        broker: "mock".into(),
        topic: "NSE|SBIN|1".into(),
        tick: Arc::new(tradegate::models::Tick {
            symbol: "SBIN".into(),
            exchange: "NSE".into(),
            mode: Mode::Ltp,
            ltp: 1.0,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            bid: None,
            ask: None,
            depth: None,
            ts_ms: 0,
        }),
    });
    let quiet = tokio::time::timeout(Duration::from_millis(200), outbox.next()).await;
    assert!(quiet.is_err());
}

struct AdapterQuotes {
    proxy: Arc<ProxyServer>,
}

#[async_trait]
impl QuoteSource for AdapterQuotes {
    async fn quote(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: &str,
    ) -> Result<BrokerQuote, BrokerError> {
        let adapter = self
            .proxy
            .adapter_for(user_id)
            .await
            .ok_or(BrokerError::NotConnected)?;
        adapter.quote(symbol, exchange).await
    }
}

#[tokio::test]
async fn market_order_fills_against_live_quote() {
    let fx = fixture().await;
    let db = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(SandboxStore::new(db.path().to_str().unwrap()).unwrap());
    let cfg = SandboxConfig::default();

    let quotes = Arc::new(AdapterQuotes {
        proxy: fx.proxy.clone(),
    });
    let orders = OrderService::new(store.clone(), fx.resolver.clone(), quotes.clone(), cfg.clone());
    let engine = ExecutionEngine::new(store.clone(), quotes, cfg);

    // Scenario: capital 10,000,000; BUY 100 RELIANCE MARKET MIS; ask 2500;
    // equity leverage 5 → margin 50,000; fill at 2500.
    let order = orders
        .place(
            "u1",
            PlaceOrderRequest {
                symbol: "RELIANCE".into(),
                exchange: "NSE".into(),
                action: Action::Buy,
                quantity: 100,
                product: Product::Mis,
                pricetype: PriceType::Market,
                price: 0.0,
                trigger_price: 0.0,
            },
        )
        .await
        .unwrap();
    assert_eq!(order.margin_blocked, 50_000.0);

    let fills = engine.check_cycle().await.unwrap();
    assert_eq!(fills, 1);

    let filled = store.order("u1", &order.id).await.unwrap().unwrap();
    assert_eq!(filled.status, OrderStatus::Completed);
    assert_eq!(filled.fill_price, Some(2500.0));

    let positions = store.positions("u1").await.unwrap();
    assert_eq!(positions[0].quantity, 100);
    assert_eq!(positions[0].avg_price, 2500.0);

    let funds = store.funds("u1").await.unwrap().unwrap();
    assert_eq!(funds.used_margin, 50_000.0);
    assert_eq!(funds.available, 9_950_000.0);
    assert!(funds.invariant_holds());
}

#[tokio::test]
async fn depth_truncation_is_reported_not_errored() {
    let fx = fixture().await;
    attach_client(&fx, 1);

    let result = fx
        .proxy
        .subscribe_symbol(1, "u1", &sbin(), Mode::Depth, 50)
        .await;
    assert_eq!(result.status, "success");
    assert_eq!(result.actual_depth, Some(20));
    assert_eq!(result.broker_supported, Some(false));
}
