use chrono::Utc;
use eyre::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ExecutionPlan, Opportunity, StepAction, TradeResult};
use crate::error::EngineError;
use crate::feeds::SnapshotStore;

/// Submits an opportunity to a chain and reports the outcome. Flash-loan plans are
/// all-or-nothing: a backend returns one result for the whole plan.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, opportunity: &Opportunity) -> TradeResult;
}

/// Wallet inventory used for position-size checks.
#[async_trait::async_trait]
pub trait BalanceSource: Send + Sync {
    async fn balance_eth(&self) -> Result<f64>;
}

/// Fills against the current snapshot without touching a chain. Realizes a fixed
/// fraction of the estimated profit; reverts flash-loan plans whose swap slippage
/// exceeds `max_slippage` and charges the gas.
#[derive(Clone)]
pub struct PaperBackend {
    store: SnapshotStore,
    native_symbol: String,
    balance: Arc<RwLock<f64>>,
    pub realization: f64,
    pub max_slippage: f64,
    pub latency: Duration,
}

impl PaperBackend {
    pub fn new(store: SnapshotStore, native_symbol: &str, starting_balance_eth: f64) -> Self {
        Self {
            store,
            native_symbol: native_symbol.to_ascii_uppercase(),
            balance: Arc::new(RwLock::new(starting_balance_eth)),
            realization: 0.9,
            max_slippage: 0.01,
            latency: Duration::from_millis(0),
        }
    }

    fn native_usd(&self, opportunity: &Opportunity) -> f64 {
        self.store
            .current()
            .price(&self.native_symbol)
            .or_else(|| {
                (opportunity.estimated_profit != 0.0)
                    .then(|| opportunity.estimated_profit_usd / opportunity.estimated_profit)
            })
            .unwrap_or(0.0)
    }

    fn revert_reason(&self, opportunity: &Opportunity, balance: f64) -> Option<String> {
        match &opportunity.plan {
            ExecutionPlan::FlashLoan(plan) => plan
                .steps
                .iter()
                .enumerate()
                .find(|(_, step)| {
                    step.action == StepAction::Swap
                        && step.slippage.unwrap_or(0.0) > self.max_slippage
                })
                .map(|(i, step)| {
                    format!(
                        "step {} SWAP on {} slipped {:.2}% (max {:.2}%)",
                        i,
                        step.dex.as_deref().unwrap_or("?"),
                        step.slippage.unwrap_or(0.0) * 100.0,
                        self.max_slippage * 100.0
                    )
                }),
            ExecutionPlan::Swap => (opportunity.position_size_eth > balance).then(|| {
                format!(
                    "insufficient balance: need {:.4} ETH, have {:.4} ETH",
                    opportunity.position_size_eth, balance
                )
            }),
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for PaperBackend {
    async fn execute(&self, opportunity: &Opportunity) -> TradeResult {
        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let native_usd = self.native_usd(opportunity);
        let gas_cost = opportunity.gas_cost_eth();
        let mut balance = self.balance.write().await;

        if let Some(reason) = self.revert_reason(opportunity, *balance) {
            *balance -= gas_cost;
            warn!("Paper execution of {} reverted: {}", opportunity.id, reason);
            let mut result = TradeResult::failed(
                opportunity,
                &EngineError::ExecutionReverted(reason),
                started.elapsed().as_millis() as u64,
            );
            result.profit = Some(-gas_cost);
            result.profit_usd = Some(-gas_cost * native_usd);
            result.gas_used = Some(opportunity.gas_estimate);
            return result;
        }

        let profit = opportunity.estimated_profit * self.realization;
        *balance += profit;
        let tx = format!("0x{}", Uuid::new_v4().simple());
        info!(
            "Paper fill {} for {}: {:+.5} ETH (${:+.2})",
            tx,
            opportunity.id,
            profit,
            profit * native_usd
        );

        TradeResult {
            strategy_id: opportunity.strategy_id.clone(),
            opportunity_id: opportunity.id.clone(),
            success: true,
            transaction_hash: Some(tx),
            profit: Some(profit),
            profit_usd: Some(profit * native_usd),
            gas_used: Some(opportunity.gas_estimate),
            execution_time_ms: started.elapsed().as_millis() as u64,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl BalanceSource for PaperBackend {
    async fn balance_eth(&self) -> Result<f64> {
        Ok(*self.balance.read().await)
    }
}
