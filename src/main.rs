use alloy::primitives::address;
use alloy::providers::ProviderBuilder;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use arb_engine::adapters::binance::BinanceWsFeed;
use arb_engine::adapters::chain::{ChainPoller, PoolSpec};
use arb_engine::adapters::database::Database;
use arb_engine::adapters::execution::PaperBackend;
use arb_engine::api::{self, AppState};
use arb_engine::config::Config;
use arb_engine::domain::{ChainId, Token};
use arb_engine::engine::performance::PerformanceTracker;
use arb_engine::engine::registry::{RegistryContext, StrategyRegistry, StrategySettings};
use arb_engine::engine::Engine;
use arb_engine::feeds::{MarketFeed, MarketUpdate, SnapshotStore};
use arb_engine::strategy::cross_dex::{CrossDexArbStrategy, CrossDexParams};
use arb_engine::strategy::flash_loan::{FlashLoanArbStrategy, FlashLoanParams};
use arb_engine::strategy::Strategy;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Arb engine starting up...");

    let config = Arc::new(Config::load()?);
    info!(
        "Config loaded ({}). Starting balance: {:.4} ETH",
        config.server.environment, config.risk.starting_balance_eth
    );

    // Database
    let db = Database::new(&config.db_path)
        .await
        .wrap_err_with(|| format!("opening database at {}", config.db_path))?;
    info!("Database initialized at {}", config.db_path);

    // Shared state
    let store = SnapshotStore::new();
    let (market_tx, market_rx) = broadcast::channel::<Vec<MarketUpdate>>(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let backend = Arc::new(PaperBackend::new(
        store.clone(),
        "ETH",
        config.risk.starting_balance_eth,
    ));

    // --- Strategies ---
    let registry = RegistryContext::new(build_registry(&config, backend.clone()));
    let tracker = PerformanceTracker::new(registry.clone(), Some(db))
        .with_capacity(config.engine.history_capacity);

    let engine = Engine::new(Arc::clone(&config), store.clone(), registry, tracker, backend);
    engine
        .restore()
        .await
        .wrap_err("restoring persisted engine state")?;
    let engine = Arc::new(engine);

    // --- Market data feeds ---
    tokio::spawn(MarketFeed::new(market_rx, store.clone()).run());

    if !config.feed.symbols.is_empty() {
        let binance_ws = BinanceWsFeed::new(market_tx.clone(), config.feed.clone());
        tokio::spawn(binance_ws.run());
    }

    match &config.chain.rpc_url {
        Some(url) => {
            let pools = config
                .chain
                .pools
                .iter()
                .map(|p| p.parse::<PoolSpec>())
                .collect::<Result<Vec<_>>>()
                .wrap_err("parsing DEX_POOLS")?;
            let provider = ProviderBuilder::new().connect_http(url.parse().wrap_err("parsing RPC_URL")?);
            let poller = ChainPoller::new(
                provider,
                ChainId::Ethereum,
                pools,
                Duration::from_millis(config.chain.poll_interval_ms),
                market_tx.clone(),
            );
            tokio::spawn(poller.run());
        }
        None => warn!("RPC_URL not set; no DEX quotes or gas prices will arrive"),
    }

    // --- Engine + rotator ---
    let engine_task = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };
    tokio::spawn(
        engine
            .rotator()
            .run(config.strategies.rotation_interval(), shutdown_rx.clone()),
    );

    // --- Status API + WebSocket ---
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });

    let ws_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.ws_port)).await?;
    info!("Status stream on ws://0.0.0.0:{}/ws", config.server.ws_port);
    let ws_app = api::ws_router(Arc::clone(&state));
    let mut ws_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let served = axum::serve(ws_listener, ws_app)
            .with_graceful_shutdown(async move {
                let _ = ws_shutdown.changed().await;
            })
            .await;
        if let Err(e) = served {
            error!("WebSocket server failed: {:?}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port)).await?;
    info!("Status API running on http://0.0.0.0:{}", config.server.port);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    engine_task.await.wrap_err("engine task panicked")?;
    info!("Engine shut down gracefully");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "arb_engine=info,engine=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_registry(config: &Config, backend: Arc<PaperBackend>) -> StrategyRegistry {
    let weth = Token::new(
        address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"),
        "WETH",
        18,
        ChainId::Ethereum,
    );
    let usdc = Token::new(
        address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
        "USDC",
        6,
        ChainId::Ethereum,
    );

    // Venues come from the configured pools; two defaults keep the strategies valid.
    let mut dexes: Vec<String> = config
        .chain
        .pools
        .iter()
        .filter_map(|p| p.split(':').next())
        .map(|d| d.trim().to_ascii_lowercase())
        .collect();
    dexes.sort();
    dexes.dedup();
    if dexes.len() < 2 {
        dexes = vec!["uniswap".into(), "sushiswap".into()];
    }

    let cross_dex = CrossDexArbStrategy::new(
        "cross_dex_usdc",
        CrossDexParams::new(weth.clone(), vec![usdc.clone()], dexes.clone()),
        backend.clone(),
    );

    let mut flash_params = FlashLoanParams::new(weth, vec![usdc], dexes);
    flash_params.loan_amount_eth = flash_params
        .loan_amount_eth
        .min(config.trading.flash_loan_amount_eth);
    let flash_loan = FlashLoanArbStrategy::new("flash_loan_usdc", flash_params, backend);

    let mut registry = StrategyRegistry::new(config.strategies.clone());
    let strategies: Vec<(Arc<dyn Strategy>, StrategySettings)> = vec![
        (
            Arc::new(cross_dex),
            StrategySettings {
                priority: 10,
                min_profit_usd: config.trading.min_profit_threshold_usd,
                max_gas_price_gwei: config.trading.max_gas_price_gwei,
                ..Default::default()
            },
        ),
        (
            Arc::new(flash_loan),
            StrategySettings {
                enabled: config.trading.enable_flash_loans,
                priority: 5,
                min_profit_usd: config.trading.min_profit_threshold_usd * 2.0,
                max_gas_price_gwei: config.trading.max_gas_price_gwei,
            },
        ),
    ];

    for (strategy, settings) in strategies {
        let id = strategy.id().to_string();
        if let Err(e) = registry.register(strategy, settings) {
            warn!("Strategy {} not enabled: {}", id, e);
        }
    }
    registry
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {:?}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
}
