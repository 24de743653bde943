//! tradegate — broker-unifying market-data gateway with a paper-trading
//! execution engine on live quotes.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use dotenv::dotenv;
use std::{env, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradegate::{
    api::{self, ApiContext},
    auth::ApiKeyStore,
    broker::BrokerRegistry,
    bus::Bus,
    config::{AppConfig, SandboxConfig},
    engine::{AdapterQuoteSource, ExecutionEngine},
    orders::OrderService,
    proxy::{server::ws_handler, ProxyServer},
    schedule::Scheduler,
    store::SandboxStore,
    symbols::SymbolResolver,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let app_cfg = AppConfig::from_env();
    let sandbox_cfg = SandboxConfig::from_env();
    info!(db = %app_cfg.db_path, "tradegate starting");

    // Stores share one sqlite database file.
    let store = Arc::new(SandboxStore::new(&app_cfg.db_path)?);
    store.persist_config(&sandbox_cfg).await?;

    let resolver = Arc::new(SymbolResolver::new(&app_cfg.db_path)?);
    let auth = Arc::new(ApiKeyStore::new(&app_cfg.db_path)?);

    let registry = Arc::new(BrokerRegistry::from_env());
    resolver.seed_if_empty("wsfeed")?;
    if let Ok(dev_key) = env::var("TRADEGATE_DEV_API_KEY") {
        auth.seed_dev_key(&dev_key, "dev", "wsfeed")?;
    }

    // Periodic master-contract reload.
    {
        let resolver = resolver.clone();
        let every = std::time::Duration::from_secs(app_cfg.symbol_reload_secs.max(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick already loaded at startup
            loop {
                ticker.tick().await;
                match resolver.reload() {
                    Ok(n) => info!(contracts = n, "symbol map reloaded"),
                    Err(e) => tracing::warn!(error = %e, "symbol map reload failed"),
                }
            }
        });
    }

    // Ingestion → bus → proxy fan-out.
    let bus = Bus::new(8192);
    let proxy = ProxyServer::new(auth.clone(), registry, resolver.clone(), bus.clone());
    proxy.spawn_fanout();

    // Simulated execution on the same live quotes.
    let quotes = AdapterQuoteSource::new(proxy.state.clone());
    let order_service = OrderService::new(
        store.clone(),
        resolver.clone(),
        quotes.clone(),
        sandbox_cfg.clone(),
    );
    let engine = ExecutionEngine::new(store.clone(), quotes, sandbox_cfg.clone());
    let _engine_task = engine.spawn();

    let scheduler = Scheduler::new(store.clone(), engine, sandbox_cfg);
    scheduler.run_catchup().await?;
    let _scheduler_task = scheduler.spawn();

    // HTTP surface: /ws for market data, /api/v1 for the order service.
    let api_ctx = ApiContext {
        auth,
        orders: order_service,
        store,
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(proxy)
        .nest("/api/v1", api::router(api_ctx))
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&app_cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", app_cfg.bind_addr))?;
    info!(addr = %app_cfg.bind_addr, "gateway listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradegate=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();
    // Also try the crate dir so --manifest-path runs pick up the same .env.
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
