pub mod aggregator;
pub mod dispatcher;
pub mod locks;
pub mod performance;
pub mod registry;
pub mod risk;
pub mod rotator;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::adapters::execution::BalanceSource;
use crate::config::Config;
use crate::domain::SystemStatus;
use crate::feeds::SnapshotStore;

use self::aggregator::{DecisionOverlay, ExpectedValueOverlay, OpportunityAggregator};
use self::dispatcher::{DispatchReport, Dispatcher};
use self::locks::ResourceLockManager;
use self::performance::PerformanceTracker;
use self::registry::RegistryContext;
use self::risk::RiskGate;
use self::rotator::StrategyRotator;

/// What one scan-rank-dispatch cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub snapshot_version: u64,
    pub found: usize,
    pub rejected: usize,
    pub timed_out: Vec<String>,
    pub dispatch: DispatchReport,
}

/// The scheduling core: scans every enabled strategy against one snapshot, ranks
/// the results and dispatches them through the risk gate.
pub struct Engine {
    config: Arc<Config>,
    store: SnapshotStore,
    registry: RegistryContext,
    aggregator: OpportunityAggregator,
    dispatcher: Dispatcher,
    tracker: PerformanceTracker,
    risk: RiskGate,
    balance: Arc<dyn BalanceSource>,
    opportunities_found: AtomicU64,
    running: AtomicBool,
    started: Instant,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        store: SnapshotStore,
        registry: RegistryContext,
        tracker: PerformanceTracker,
        balance: Arc<dyn BalanceSource>,
    ) -> Self {
        let overlay: Option<Arc<dyn DecisionOverlay>> = if config.ai.enable_optimization {
            Some(Arc::new(ExpectedValueOverlay {
                confidence_threshold: config.ai.confidence_threshold,
            }))
        } else {
            None
        };
        let risk = RiskGate::new(Arc::clone(&config));
        let dispatcher = Dispatcher::new(
            &config,
            registry.clone(),
            risk.clone(),
            ResourceLockManager::new(config.engine.lock_granularity),
            tracker.clone(),
            Arc::clone(&balance),
        );

        Self {
            aggregator: OpportunityAggregator::new(config.engine.scan_timeout(), overlay),
            config,
            store,
            registry,
            dispatcher,
            tracker,
            risk,
            balance,
            opportunities_found: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Replaces the decision overlay chosen from config.
    pub fn with_overlay(mut self, overlay: Option<Arc<dyn DecisionOverlay>>) -> Self {
        self.aggregator = OpportunityAggregator::new(self.config.engine.scan_timeout(), overlay);
        self
    }

    pub fn registry(&self) -> &RegistryContext {
        &self.registry
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    pub fn risk(&self) -> &RiskGate {
        &self.risk
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn rotator(&self) -> StrategyRotator {
        StrategyRotator::new(&self.config, self.registry.clone(), self.tracker.clone())
    }

    /// Reloads persisted state after a restart: strategy stats and recent history,
    /// the consumed-id ledger and today's realized P&L. A no-op without a database.
    pub async fn restore(&self) -> eyre::Result<()> {
        let db = match self.tracker.db() {
            Some(db) => db.clone(),
            None => return Ok(()),
        };
        let engine = &self.config.engine;
        self.tracker.restore(engine.history_capacity as i64).await?;

        let ids = db.recent_opportunity_ids(engine.consumed_capacity as i64).await?;
        let seeded = self.dispatcher.seed_consumed(ids);

        let now = Utc::now();
        let today = db.trade_results_since(self.risk.day_start(now)).await?;
        self.risk.replay(&today, now);
        info!(
            "Restored {} consumed ids; {} results from today, realized {:+.4} ETH{}",
            seeded,
            today.len(),
            self.risk.realized_today(),
            if self.risk.is_halted() { " (halted)" } else { "" }
        );
        Ok(())
    }

    pub async fn run_cycle(&self) -> CycleReport {
        match self.balance.balance_eth().await {
            Ok(balance) => {
                self.risk.observe_balance(balance, Utc::now());
            }
            Err(e) => warn!("Balance check failed: {:?}", e),
        }

        let snapshot = self.store.current();
        let version = snapshot.version;
        let aggregation = self.aggregator.collect(&self.registry, snapshot).await;
        self.opportunities_found
            .fetch_add(aggregation.found as u64, Ordering::Relaxed);

        let dispatch = if aggregation.candidates.is_empty() {
            DispatchReport::default()
        } else {
            debug!(
                "Snapshot v{}: {} candidates ({} rejected)",
                version,
                aggregation.candidates.len(),
                aggregation.rejected
            );
            self.dispatcher.dispatch(aggregation.candidates).await
        };

        CycleReport {
            snapshot_version: version,
            found: aggregation.found,
            rejected: aggregation.rejected,
            timed_out: aggregation.timed_out,
            dispatch,
        }
    }

    /// Runs cycles on the configured interval until `shutdown` flips, then waits for
    /// in-flight executions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Engine started: cycle every {:?}, up to {} concurrent executions",
            self.config.engine.cycle_interval(),
            self.config.engine.max_concurrent_executions
        );

        let mut ticker = tokio::time::interval(self.config.engine.cycle_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if !report.dispatch.dispatched.is_empty() {
                        info!(
                            "Cycle v{}: dispatched {}, dropped {}",
                            report.snapshot_version,
                            report.dispatch.dispatched.len(),
                            report.dispatch.dropped.len()
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Engine stopping, draining in-flight executions");
        self.dispatcher.drain().await;
        self.running.store(false, Ordering::SeqCst);
    }

    /// Waits for every execution dispatched so far.
    pub async fn drain(&self) {
        self.dispatcher.drain().await;
    }

    pub async fn status(&self) -> SystemStatus {
        let (active, total) = {
            let registry = self.registry.read().await;
            (registry.active_count(), registry.len())
        };
        let current_balance = self.balance.balance_eth().await.unwrap_or_else(|e| {
            warn!("Balance unavailable for status: {:?}", e);
            0.0
        });

        SystemStatus {
            is_running: self.running.load(Ordering::SeqCst),
            halted: self.risk.is_halted(),
            halt_reason: self.risk.halt_reason(),
            active_strategies: active,
            total_strategies: total,
            trades_executed: self.tracker.trades_executed().await,
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            current_balance,
            profit_today: self.risk.realized_today(),
            uptime_secs: self.started.elapsed().as_secs(),
            performance: self.tracker.metrics().await,
            last_update: Utc::now(),
        }
    }
}
