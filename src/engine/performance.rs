use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::adapters::database::Database;
use crate::domain::{PerformanceMetrics, TradeResult};
use crate::engine::registry::RegistryContext;

/// Default number of results kept in memory.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// Aggregates folded one result at a time, so metrics cover every trade recorded
/// even after the in-memory history has dropped the oldest ones.
#[derive(Debug, Clone, Default)]
pub struct RunningMetrics {
    total: u64,
    successful: u64,
    wins: u64,
    gross_profit: f64,
    gross_loss: f64,
    time_sum_ms: f64,
    /// Welford accumulators over per-trade P&L.
    mean: f64,
    m2: f64,
    equity: f64,
    peak: f64,
    max_drawdown: f64,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl RunningMetrics {
    pub fn push(&mut self, result: &TradeResult) {
        let pnl = result.pnl_usd();
        self.total += 1;
        if result.success {
            self.successful += 1;
        }
        if pnl > 0.0 {
            self.wins += 1;
            self.gross_profit += pnl;
        } else if pnl < 0.0 {
            self.gross_loss -= pnl;
        }
        self.time_sum_ms += result.execution_time_ms as f64;

        let delta = pnl - self.mean;
        self.mean += delta / self.total as f64;
        self.m2 += delta * (pnl - self.mean);

        // Drawdown of cumulative P&L, starting from zero.
        self.equity += pnl;
        self.peak = self.peak.max(self.equity);
        self.max_drawdown = self.max_drawdown.max(self.peak - self.equity);

        self.first = Some(self.first.map_or(result.timestamp, |t| t.min(result.timestamp)));
        self.last = Some(self.last.map_or(result.timestamp, |t| t.max(result.timestamp)));
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Per-trade Sharpe: mean over sample standard deviation. Zero below two trades.
    fn sharpe(&self) -> f64 {
        if self.total < 2 {
            return 0.0;
        }
        let std = (self.m2 / (self.total - 1) as f64).sqrt();
        if std > 0.0 {
            self.mean / std
        } else {
            0.0
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PerformanceMetrics {
        if self.total == 0 {
            return PerformanceMetrics {
                timestamp: Some(now),
                ..Default::default()
            };
        }
        let total = self.total as f64;
        let span_secs = match (self.first, self.last) {
            (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1_000.0,
            _ => 0.0,
        };

        PerformanceMetrics {
            total_trades: self.total,
            successful_trades: self.successful,
            failed_trades: self.total - self.successful,
            total_profit_usd: self.gross_profit,
            total_loss_usd: self.gross_loss,
            net_profit_usd: self.gross_profit - self.gross_loss,
            average_trade_time_ms: self.time_sum_ms / total,
            trades_per_second: if span_secs > 0.0 { total / span_secs } else { 0.0 },
            success_rate: self.successful as f64 / total,
            sharpe_ratio: self.sharpe(),
            max_drawdown: self.max_drawdown,
            win_rate: self.wins as f64 / total,
            profit_factor: (self.gross_loss > 0.0).then(|| self.gross_profit / self.gross_loss),
            timestamp: Some(now),
        }
    }
}

#[derive(Default)]
struct Ledger {
    history: VecDeque<TradeResult>,
    totals: RunningMetrics,
}

/// Records every trade result: strategy stats, a bounded in-memory history, running
/// totals and the database checkpoint.
#[derive(Clone)]
pub struct PerformanceTracker {
    registry: RegistryContext,
    ledger: Arc<RwLock<Ledger>>,
    capacity: usize,
    db: Option<Database>,
}

impl PerformanceTracker {
    pub fn new(registry: RegistryContext, db: Option<Database>) -> Self {
        Self {
            registry,
            ledger: Arc::new(RwLock::new(Ledger::default())),
            capacity: DEFAULT_HISTORY_CAPACITY,
            db,
        }
    }

    /// Caps how many results stay in memory.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn db(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    /// Loads persisted stats into the registry and up to `history_limit` persisted
    /// results into history and the running totals.
    pub async fn restore(&self, history_limit: i64) -> eyre::Result<()> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()),
        };

        let stats = db.load_strategy_stats().await?;
        let mut restored = 0;
        {
            let mut registry = self.registry.write().await;
            for (id, s) in stats {
                if registry.restore_stats(&id, s).is_ok() {
                    restored += 1;
                }
            }
        }
        let results = db.recent_trade_results(history_limit).await?;
        info!(
            "Restored stats for {} strategies and {} trade results",
            restored,
            results.len()
        );

        let mut ledger = self.ledger.write().await;
        *ledger = Ledger::default();
        for result in results {
            self.push(&mut ledger, result);
        }
        Ok(())
    }

    fn push(&self, ledger: &mut Ledger, result: TradeResult) {
        ledger.totals.push(&result);
        if ledger.history.len() >= self.capacity {
            ledger.history.pop_front();
        }
        ledger.history.push_back(result);
    }

    pub async fn record(&self, result: TradeResult) {
        let stats = match self.registry.write().await.apply_result(&result) {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!("Dropping stats for result {}: {}", result.opportunity_id, e);
                None
            }
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.insert_trade_result(&result).await {
                error!("Failed to persist trade result: {:?}", e);
            }
            if let Some(stats) = &stats {
                if let Err(e) = db.upsert_strategy_stats(&result.strategy_id, stats).await {
                    error!("Failed to persist strategy stats: {:?}", e);
                }
            }
        }

        let mut ledger = self.ledger.write().await;
        self.push(&mut ledger, result);
    }

    pub async fn metrics(&self) -> PerformanceMetrics {
        self.ledger.read().await.totals.snapshot(Utc::now())
    }

    pub async fn trades_executed(&self) -> u64 {
        self.ledger.read().await.totals.total()
    }

    /// Up to `n` most recent results, newest last. `None` selects every strategy.
    pub async fn recent(&self, strategy_id: Option<&str>, n: usize) -> Vec<TradeResult> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<TradeResult> = ledger
            .history
            .iter()
            .rev()
            .filter(|r| strategy_id.map_or(true, |id| r.strategy_id == id))
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::result;
    use crate::domain::RiskLevel;
    use crate::engine::registry::test_support::stub;
    use crate::engine::registry::{StrategyRegistry, StrategySettings};

    fn fold(pnl: &[f64]) -> RunningMetrics {
        let mut totals = RunningMetrics::default();
        for p in pnl {
            totals.push(&result("s", *p > 0.0, *p));
        }
        totals
    }

    #[test]
    fn test_metrics_fold_history() {
        let m = fold(&[10.0, -5.0, 20.0, -5.0]).snapshot(Utc::now());
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.successful_trades, 2);
        assert_eq!(m.failed_trades, 2);
        assert_eq!(m.total_profit_usd, 30.0);
        assert_eq!(m.total_loss_usd, 10.0);
        assert_eq!(m.net_profit_usd, 20.0);
        assert_eq!(m.profit_factor, Some(3.0));
        assert_eq!(m.win_rate, 0.5);
        assert_eq!(m.max_drawdown, 5.0);
        assert_eq!(m.average_trade_time_ms, 100.0);
    }

    #[test]
    fn test_profit_factor_undefined_without_losses() {
        let m = fold(&[1.0, 2.0]).snapshot(Utc::now());
        assert_eq!(m.profit_factor, None);
        assert_eq!(m.max_drawdown, 0.0);

        let empty = RunningMetrics::default().snapshot(Utc::now());
        assert_eq!(empty.total_trades, 0);
        assert_eq!(empty.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_sharpe_and_drawdown() {
        // mean 1, sample std 1
        assert!((fold(&[0.0, 1.0, 2.0]).sharpe() - 1.0).abs() < 1e-12);
        assert_eq!(fold(&[5.0, 5.0]).sharpe(), 0.0);
        assert_eq!(fold(&[-3.0, 1.0, 4.0, -6.0, 1.0]).max_drawdown, 6.0);
    }

    #[tokio::test]
    async fn test_history_is_capped_but_totals_cover_every_trade() {
        let mut registry = StrategyRegistry::new(Default::default());
        registry.register(stub("s", RiskLevel::Low), StrategySettings::default()).unwrap();
        let tracker = PerformanceTracker::new(RegistryContext::new(registry), None).with_capacity(3);

        for p in [5.0, -1.0, 2.0, 4.0, -3.0] {
            tracker.record(result("s", p > 0.0, p)).await;
        }

        let recent = tracker.recent(None, 10).await;
        let pnl: Vec<f64> = recent.iter().map(TradeResult::pnl_usd).collect();
        assert_eq!(pnl, vec![2.0, 4.0, -3.0]);

        assert_eq!(tracker.trades_executed().await, 5);
        let m = tracker.metrics().await;
        assert_eq!(m.total_trades, 5);
        assert_eq!(m.total_profit_usd, 11.0);
        assert_eq!(m.total_loss_usd, 4.0);
        assert_eq!(m.net_profit_usd, 7.0);
    }

    #[tokio::test]
    async fn test_record_updates_registry_history_and_db() {
        let mut registry = StrategyRegistry::new(Default::default());
        registry.register(stub("s", RiskLevel::Low), StrategySettings::default()).unwrap();
        let registry = RegistryContext::new(registry);
        let db = Database::in_memory().await.unwrap();
        let tracker = PerformanceTracker::new(registry.clone(), Some(db.clone()));

        tracker.record(result("s", true, 12.0)).await;
        tracker.record(result("s", false, -3.0)).await;

        assert_eq!(tracker.trades_executed().await, 2);
        assert_eq!(registry.read().await.get("s").unwrap().stats.total_trades, 2);
        assert_eq!(db.recent_trade_results(10).await.unwrap().len(), 2);
        assert_eq!(tracker.metrics().await.net_profit_usd, 9.0);

        // A fresh tracker over a fresh registry picks the checkpoint back up.
        let mut registry = StrategyRegistry::new(Default::default());
        registry.register(stub("s", RiskLevel::Low), StrategySettings::default()).unwrap();
        let registry = RegistryContext::new(registry);
        let restored = PerformanceTracker::new(registry.clone(), Some(db));
        restored.restore(100).await.unwrap();
        assert_eq!(restored.trades_executed().await, 2);
        let stats = registry.read().await.get("s").unwrap().stats.clone();
        assert_eq!(stats.total_trades, 2);
        assert!((stats.success_rate - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_recent_filters_by_strategy() {
        let mut registry = StrategyRegistry::new(Default::default());
        registry.register(stub("a", RiskLevel::Low), StrategySettings::default()).unwrap();
        registry.register(stub("b", RiskLevel::Low), StrategySettings::default()).unwrap();
        let tracker = PerformanceTracker::new(RegistryContext::new(registry), None);
        for (id, p) in [("a", 1.0), ("b", 2.0), ("a", 3.0), ("a", 4.0)] {
            tracker.record(result(id, true, p)).await;
        }
        let recent = tracker.recent(Some("a"), 2).await;
        let pnl: Vec<f64> = recent.iter().map(TradeResult::pnl_usd).collect();
        assert_eq!(pnl, vec![3.0, 4.0]);
    }
}
