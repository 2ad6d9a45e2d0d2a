mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arb_engine::adapters::database::Database;
use arb_engine::adapters::execution::{BalanceSource, PaperBackend};
use arb_engine::config::LockGranularity;
use arb_engine::domain::{ChainId, Opportunity, PriceData, RiskLevel, StrategyType, TradeResult};
use arb_engine::engine::locks::{ResourceKey, ResourceLockManager};
use arb_engine::engine::performance::PerformanceTracker;
use arb_engine::error::{EngineError, EngineResult};
use arb_engine::feeds::{MarketSnapshot, MarketUpdate, SnapshotStore};
use arb_engine::strategy::flash_loan::{FlashLoanArbStrategy, FlashLoanParams};
use arb_engine::strategy::Strategy;

use common::{
    config, engine, engine_with, engine_with_db, opportunity, registry, settled, usdc, weth,
    Scripted,
};

const DEXES: [&str; 4] = ["uniswap", "sushiswap", "curve", "balancer"];

#[tokio::test]
async fn test_higher_profit_runs_first_and_blocked_opportunity_expires() {
    let big = opportunity("big", "xdex", 800.0);
    let mut small = opportunity("small", "xdex", 500.0);
    small.expires_at = Utc::now() + ChronoDuration::milliseconds(150);

    let strategy = Arc::new(
        Scripted::new("xdex", vec![vec![small, big]]).with_delay(Duration::from_millis(400)),
    );
    let engine = engine(config(), vec![strategy.clone() as Arc<dyn Strategy>]);

    let report = engine.run_cycle().await;
    assert_eq!(report.found, 2);
    assert_eq!(report.dispatch.dispatched, vec!["big".to_string()]);
    assert_eq!(report.dispatch.deferred, 1);
    assert!(matches!(
        report.dispatch.dropped_with("small"),
        Some(EngineError::OpportunityExpired(_))
    ));

    engine.drain().await;
    assert_eq!(strategy.runs(), 1);
    assert_eq!(engine.tracker().trades_executed().await, 1);
}

#[tokio::test]
async fn test_disjoint_opportunities_run_concurrently() {
    let a = opportunity("a", "xdex", 300.0);
    let mut b = opportunity("b", "xdex", 200.0);
    b.dexes = vec!["curve".into(), "balancer".into()];

    let strategy = Arc::new(
        Scripted::new("xdex", vec![vec![a, b]]).with_delay(Duration::from_millis(100)),
    );
    let engine = engine(config(), vec![strategy.clone() as Arc<dyn Strategy>]);

    let report = engine.run_cycle().await;
    assert_eq!(report.dispatch.dispatched, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(report.dispatch.deferred, 0);
    engine.drain().await;
    assert_eq!(strategy.runs(), 2);
}

#[tokio::test]
async fn test_rescanned_opportunity_executes_at_most_once() {
    let opp = opportunity("dup", "xdex", 250.0);
    let strategy = Arc::new(Scripted::new("xdex", vec![vec![opp.clone()], vec![opp]]));
    let engine = engine(config(), vec![strategy.clone() as Arc<dyn Strategy>]);

    let first = engine.run_cycle().await;
    assert_eq!(first.dispatch.dispatched.len(), 1);
    engine.drain().await;

    let second = engine.run_cycle().await;
    assert!(second.dispatch.dispatched.is_empty());
    assert!(matches!(
        second.dispatch.dropped_with("dup"),
        Some(EngineError::AlreadyConsumed(_))
    ));
    engine.drain().await;
    assert_eq!(strategy.runs(), 1);
}

#[tokio::test]
async fn test_slow_execution_times_out_as_failure() {
    let mut cfg = config();
    cfg.engine.execution_timeout_ms = 50;
    let strategy = Arc::new(
        Scripted::new("xdex", vec![vec![opportunity("slow", "xdex", 100.0)]])
            .with_delay(Duration::from_secs(5)),
    );
    let engine = engine(cfg, vec![strategy as Arc<dyn Strategy>]);

    engine.run_cycle().await;
    engine.drain().await;

    let recent = engine.tracker().recent(Some("xdex"), 10).await;
    assert_eq!(recent.len(), 1);
    assert!(!recent[0].success);
    assert_eq!(
        recent[0].error.as_deref(),
        Some("execution timed out after 50ms")
    );
}

#[tokio::test]
async fn test_daily_loss_halts_further_dispatch() {
    let mut cfg = config();
    cfg.risk.max_daily_loss_eth = 5.0;
    let strategy = Arc::new(
        Scripted::new(
            "xdex",
            vec![
                vec![opportunity("loss", "xdex", 100.0)],
                vec![opportunity("next", "xdex", 100.0)],
            ],
        )
        .with_profit(-6.0),
    );
    let engine = engine(cfg, vec![strategy.clone() as Arc<dyn Strategy>]);

    engine.run_cycle().await;
    engine.drain().await;
    assert!(engine.risk().is_halted());
    assert!(engine.risk().halt_reason().unwrap().contains("daily loss"));

    let report = engine.run_cycle().await;
    assert!(report.dispatch.dispatched.is_empty());
    assert!(matches!(
        report.dispatch.dropped_with("next"),
        Some(EngineError::RiskLimitBreached(_))
    ));
    assert_eq!(strategy.runs(), 1);

    let status = engine.status().await;
    assert!(status.halted);
    assert!((status.profit_today + 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_flash_loan_slippage_revert_yields_one_failed_result() {
    let store = SnapshotStore::new();
    store
        .update(&[
            MarketUpdate::Price(PriceData::new("ETH", 2_000.0, "binance")),
            MarketUpdate::GasPrice {
                chain: ChainId::Ethereum,
                gwei: 20.0,
            },
            MarketUpdate::DexQuote {
                token: "USDC".into(),
                dex: "uniswap".into(),
                price: 1.000,
            },
            MarketUpdate::DexQuote {
                token: "USDC".into(),
                dex: "curve".into(),
                price: 1.008,
            },
            // 50 ETH * $2000 over $40M of depth: 0.25% expected slippage
            MarketUpdate::Liquidity {
                token: "USDC".into(),
                liquidity: 40_000_000.0,
            },
        ])
        .unwrap();

    let mut paper = PaperBackend::new(store.clone(), "ETH", 20.0);
    paper.max_slippage = 0.002;
    let backend = Arc::new(paper);

    let params = FlashLoanParams::new(
        weth(),
        vec![usdc()],
        vec!["uniswap".into(), "curve".into()],
    );
    let strategy = Arc::new(FlashLoanArbStrategy::new("flash", params, backend.clone()));
    let engine = engine_with(
        config(),
        store,
        vec![strategy as Arc<dyn Strategy>],
        backend.clone(),
    );

    let report = engine.run_cycle().await;
    assert_eq!(report.dispatch.dispatched.len(), 1);
    engine.drain().await;

    let results = engine.tracker().recent(None, 10).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(!result.success);
    assert!(result.transaction_hash.is_none());
    let error = result.error.as_deref().unwrap();
    assert!(error.starts_with("execution reverted"));
    assert!(error.contains("SWAP"));

    // Only the gas is lost: 450k units at 20 gwei.
    let gas = 450_000.0 * 20.0 * 1e-9;
    assert!((result.profit.unwrap() + gas).abs() < 1e-12);
    assert!((backend.balance_eth().await.unwrap() - (20.0 - gas)).abs() < 1e-9);
}

#[tokio::test]
async fn test_success_rate_over_ten_trades() {
    let cfg = config();
    let strategy = Arc::new(Scripted::new("xdex", Vec::new()));
    let registry = registry(&cfg, vec![strategy as Arc<dyn Strategy>]);
    let tracker = PerformanceTracker::new(registry.clone(), None);

    for i in 0..10 {
        let mut result = TradeResult::failed(
            &opportunity(&format!("t{}", i), "xdex", 50.0),
            &EngineError::ExecutionReverted("reverted".into()),
            120,
        );
        if i < 6 {
            result.success = true;
            result.error = None;
            result.profit = Some(0.01);
            result.profit_usd = Some(20.0);
        }
        tracker.record(result).await;
    }

    let metrics = tracker.metrics().await;
    assert_eq!(metrics.total_trades, 10);
    assert_eq!(metrics.successful_trades, 6);
    assert!((metrics.success_rate - 0.6).abs() < 1e-12);

    let registry = registry.read().await;
    let stats = &registry.get("xdex").unwrap().stats;
    assert_eq!(stats.total_trades, 10);
    assert!((stats.success_rate - 0.6).abs() < 1e-12);
}

#[tokio::test]
async fn test_rate_limit_spaces_out_launches() {
    let mut cfg = config();
    cfg.trading.max_trades_per_second = 2;
    let batch: Vec<Opportunity> = (0..6)
        .map(|i| {
            let mut opp = opportunity(&format!("r{}", i), "xdex", 100.0 + i as f64);
            opp.dexes = vec![format!("dex{}a", i), format!("dex{}b", i)];
            opp
        })
        .collect();
    let strategy = Arc::new(Scripted::new("xdex", vec![batch]));
    let engine = engine(cfg, vec![strategy.clone() as Arc<dyn Strategy>]);

    let report = engine.run_cycle().await;
    engine.drain().await;

    assert_eq!(report.dispatch.dispatched.len(), 6);
    let starts = strategy.starts();
    assert_eq!(starts.len(), 6);
    // Burst of two, then one every 500ms.
    let span = starts[5].duration_since(starts[0]);
    assert!(span >= Duration::from_millis(1_900), "launches spanned only {:?}", span);
}

/// Holds the lock keys of every running execution and counts overlaps.
struct KeyTracking {
    locks: ResourceLockManager,
    batch: Mutex<VecDeque<Vec<Opportunity>>>,
    held: Mutex<HashSet<ResourceKey>>,
    collisions: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait::async_trait]
impl Strategy for KeyTracking {
    fn id(&self) -> &str {
        "keys"
    }
    fn name(&self) -> &str {
        "key tracking"
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
        self.batch.lock().unwrap().pop_front().unwrap_or_default()
    }

    async fn execute(&self, opportunity: &Opportunity) -> TradeResult {
        let keys = self.locks.keys_for(opportunity);
        {
            let mut held = self.held.lock().unwrap();
            for key in &keys {
                if !held.insert(key.clone()) {
                    self.collisions.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        {
            let mut held = self.held.lock().unwrap();
            for key in &keys {
                held.remove(key);
            }
        }
        let mut result = TradeResult::failed(
            opportunity,
            &EngineError::ExecutionReverted(String::new()),
            20,
        );
        result.success = true;
        result.error = None;
        result.profit = Some(0.001);
        result.profit_usd = Some(2.0);
        result
    }
}

#[tokio::test]
async fn test_overlapping_candidates_never_hold_the_same_pool_at_once() {
    let mut cfg = config();
    cfg.engine.lock_granularity = LockGranularity::TokenDex;
    cfg.engine.lock_wait_ms = 5_000;
    cfg.engine.lock_retry_ms = 5;

    // Every dex pair twice: plenty of overlap and some disjoint pairs.
    let mut batch = Vec::new();
    for round in 0..2 {
        for i in 0..DEXES.len() {
            for j in (i + 1)..DEXES.len() {
                let mut opp = opportunity(&format!("k{}-{}{}", round, i, j), "keys", 100.0);
                opp.dexes = vec![DEXES[i].into(), DEXES[j].into()];
                batch.push(opp);
            }
        }
    }
    let total = batch.len();

    let strategy = Arc::new(KeyTracking {
        locks: ResourceLockManager::new(LockGranularity::TokenDex),
        batch: Mutex::new(VecDeque::from(vec![batch])),
        held: Mutex::new(HashSet::new()),
        collisions: AtomicUsize::new(0),
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        runs: AtomicUsize::new(0),
    });
    let engine = engine(cfg, vec![strategy.clone() as Arc<dyn Strategy>]);

    let report = engine.run_cycle().await;
    engine.drain().await;

    assert_eq!(report.dispatch.dispatched.len(), total);
    assert_eq!(strategy.runs.load(Ordering::SeqCst), total);
    assert_eq!(strategy.collisions.load(Ordering::SeqCst), 0);
    assert!(strategy.peak.load(Ordering::SeqCst) >= 2);
    assert!(strategy.held.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_scan_times_out_and_its_opportunities_are_dropped() {
    let mut cfg = config();
    cfg.engine.scan_timeout_ms = 50;
    let mut late = opportunity("late", "slow", 900.0);
    late.dexes = vec!["curve".into(), "balancer".into()];
    let slow = Arc::new(
        Scripted::new("slow", vec![vec![late]]).with_scan_delay(Duration::from_millis(300)),
    );
    let fast = Arc::new(Scripted::new("fast", vec![vec![opportunity("quick", "fast", 100.0)]]));
    let engine = engine(
        cfg,
        vec![
            slow.clone() as Arc<dyn Strategy>,
            fast.clone() as Arc<dyn Strategy>,
        ],
    );

    let report = engine.run_cycle().await;
    engine.drain().await;

    assert_eq!(report.timed_out, vec!["slow".to_string()]);
    assert_eq!(report.found, 1);
    assert_eq!(report.dispatch.dispatched, vec!["quick".to_string()]);
    assert_eq!(slow.runs(), 0);
    assert_eq!(fast.runs(), 1);
}

#[tokio::test]
async fn test_restart_keeps_todays_loss_halt() {
    let db = Database::in_memory().await.unwrap();
    db.insert_trade_result(&settled("lost", "xdex", -6.0)).await.unwrap();

    let mut cfg = config();
    cfg.risk.max_daily_loss_eth = 5.0;
    let strategy = Arc::new(Scripted::new(
        "xdex",
        vec![vec![opportunity("next", "xdex", 100.0)]],
    ));
    let engine = engine_with_db(cfg, db, vec![strategy.clone() as Arc<dyn Strategy>]);
    engine.restore().await.unwrap();

    assert!(engine.risk().is_halted());
    assert!(engine.risk().halt_reason().unwrap().contains("daily loss"));
    assert!((engine.risk().realized_today() + 6.0).abs() < 1e-9);

    let report = engine.run_cycle().await;
    assert!(matches!(
        report.dispatch.dropped_with("next"),
        Some(EngineError::RiskLimitBreached(_))
    ));
    assert_eq!(strategy.runs(), 0);
    assert_eq!(engine.status().await.trades_executed, 1);
}

#[tokio::test]
async fn test_restart_remembers_consumed_opportunities() {
    let db = Database::in_memory().await.unwrap();
    db.insert_trade_result(&settled("done", "xdex", 0.01)).await.unwrap();

    let strategy = Arc::new(Scripted::new(
        "xdex",
        vec![vec![opportunity("done", "xdex", 100.0)]],
    ));
    let engine = engine_with_db(config(), db, vec![strategy.clone() as Arc<dyn Strategy>]);
    engine.restore().await.unwrap();
    assert!(!engine.risk().is_halted());

    let report = engine.run_cycle().await;
    assert!(report.dispatch.dispatched.is_empty());
    assert!(matches!(
        report.dispatch.dropped_with("done"),
        Some(EngineError::AlreadyConsumed(_))
    ));
    assert_eq!(strategy.runs(), 0);
}
