#![allow(dead_code)]

use alloy::primitives::address;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arb_engine::adapters::database::Database;
use arb_engine::adapters::execution::BalanceSource;
use arb_engine::config::Config;
use arb_engine::domain::{
    ChainId, ExecutionPlan, Opportunity, RiskLevel, StrategyType, Token, TradeResult,
};
use arb_engine::engine::performance::PerformanceTracker;
use arb_engine::engine::registry::{RegistryContext, StrategyRegistry, StrategySettings};
use arb_engine::engine::Engine;
use arb_engine::error::{EngineError, EngineResult};
use arb_engine::feeds::{MarketSnapshot, SnapshotStore};
use arb_engine::strategy::Strategy;

pub fn weth() -> Token {
    Token::new(
        address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"),
        "WETH",
        18,
        ChainId::Ethereum,
    )
}

pub fn usdc() -> Token {
    Token::new(
        address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
        "USDC",
        6,
        ChainId::Ethereum,
    )
}

/// A plain WETH/USDC swap on uniswap and sushiswap, live for 30s.
pub fn opportunity(id: &str, strategy_id: &str, profit_usd: f64) -> Opportunity {
    let now = Utc::now();
    Opportunity {
        id: id.into(),
        strategy_id: strategy_id.into(),
        kind: StrategyType::CrossDex,
        risk_level: RiskLevel::Low,
        estimated_profit: profit_usd / 2_000.0,
        estimated_profit_usd: profit_usd,
        confidence: 0.9,
        gas_estimate: 200_000,
        gas_price_gwei: 20.0,
        position_size_eth: 1.0,
        tokens: vec![weth(), usdc()],
        dexes: vec!["uniswap".into(), "sushiswap".into()],
        chain_id: ChainId::Ethereum,
        timestamp: now,
        expires_at: now + ChronoDuration::seconds(30),
        plan: ExecutionPlan::Swap,
    }
}

pub struct Fixed(pub f64);

#[async_trait::async_trait]
impl BalanceSource for Fixed {
    async fn balance_eth(&self) -> eyre::Result<f64> {
        Ok(self.0)
    }
}

/// Replays one batch of opportunities per scan and settles each execution for a
/// fixed ETH profit after `delay`.
pub struct Scripted {
    id: String,
    batches: Mutex<VecDeque<Vec<Opportunity>>>,
    delay: Duration,
    scan_delay: Duration,
    profit_eth: f64,
    runs: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl Scripted {
    pub fn new(id: &str, batches: Vec<Vec<Opportunity>>) -> Self {
        Self {
            id: id.into(),
            batches: Mutex::new(batches.into()),
            delay: Duration::ZERO,
            scan_delay: Duration::ZERO,
            profit_eth: 0.01,
            runs: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    /// When each execution began, in order.
    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_profit(mut self, profit_eth: f64) -> Self {
        self.profit_eth = profit_eth;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Strategy for Scripted {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        "scripted"
    }
    fn kind(&self) -> StrategyType {
        StrategyType::CrossDex
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }
    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn scan(&self, _snapshot: &MarketSnapshot) -> Vec<Opportunity> {
        tokio::time::sleep(self.scan_delay).await;
        self.batches.lock().unwrap().pop_front().unwrap_or_default()
    }

    async fn execute(&self, opportunity: &Opportunity) -> TradeResult {
        self.starts.lock().unwrap().push(Instant::now());
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let mut result = TradeResult::failed(
            opportunity,
            &EngineError::ExecutionReverted("losing fill".into()),
            self.delay.as_millis() as u64,
        );
        result.success = self.profit_eth > 0.0;
        if result.success {
            result.error = None;
            result.transaction_hash = Some(format!("0x{}", opportunity.id));
        }
        result.profit = Some(self.profit_eth);
        result.profit_usd = Some(self.profit_eth * 2_000.0);
        result
    }
}

/// Permissive defaults: no profit floor, no overlay, no rate throttling.
pub fn config() -> Config {
    let mut config = Config::default();
    config.ai.enable_optimization = false;
    config.trading.min_profit_threshold_usd = 0.0;
    config.trading.max_trades_per_second = 100;
    config
}

pub fn registry(config: &Config, strategies: Vec<Arc<dyn Strategy>>) -> RegistryContext {
    let mut registry = StrategyRegistry::new(config.strategies.clone());
    for strategy in strategies {
        registry
            .register(
                strategy,
                StrategySettings {
                    min_profit_usd: 0.0,
                    ..Default::default()
                },
            )
            .unwrap();
    }
    RegistryContext::new(registry)
}

pub fn engine(config: Config, strategies: Vec<Arc<dyn Strategy>>) -> Engine {
    engine_with(config, SnapshotStore::new(), strategies, Arc::new(Fixed(20.0)))
}

pub fn engine_with(
    config: Config,
    store: SnapshotStore,
    strategies: Vec<Arc<dyn Strategy>>,
    balance: Arc<dyn BalanceSource>,
) -> Engine {
    let registry = registry(&config, strategies);
    let tracker = PerformanceTracker::new(registry.clone(), None);
    Engine::new(Arc::new(config), store, registry, tracker, balance)
}

/// An engine checkpointing to `db`, as after a restart over an existing database.
pub fn engine_with_db(config: Config, db: Database, strategies: Vec<Arc<dyn Strategy>>) -> Engine {
    let registry = registry(&config, strategies);
    let tracker = PerformanceTracker::new(registry.clone(), Some(db));
    Engine::new(
        Arc::new(config),
        SnapshotStore::new(),
        registry,
        tracker,
        Arc::new(Fixed(20.0)),
    )
}

/// A settled result for `opportunity_id` with the given ETH profit.
pub fn settled(opportunity_id: &str, strategy_id: &str, profit_eth: f64) -> TradeResult {
    let mut result = TradeResult::failed(
        &opportunity(opportunity_id, strategy_id, 100.0),
        &EngineError::ExecutionReverted("losing fill".into()),
        25,
    );
    result.success = profit_eth > 0.0;
    if result.success {
        result.error = None;
    }
    result.profit = Some(profit_eth);
    result.profit_usd = Some(profit_eth * 2_000.0);
    result
}
