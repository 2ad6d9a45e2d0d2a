use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Ethereum,
    Bsc,
    Polygon,
    Arbitrum,
    Optimism,
    Avalanche,
    Fantom,
}

impl ChainId {
    pub fn id(&self) -> u64 {
        match self {
            ChainId::Ethereum => 1,
            ChainId::Bsc => 56,
            ChainId::Polygon => 137,
            ChainId::Arbitrum => 42161,
            ChainId::Optimism => 10,
            ChainId::Avalanche => 43114,
            ChainId::Fantom => 250,
        }
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Extreme => write!(f, "EXTREME"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    Arbitrage,
    Mev,
    Liquidation,
    FlashLoan,
    MarketMaking,
    TrendFollowing,
    MeanReversion,
    Momentum,
    StatisticalArbitrage,
    TriangularArbitrage,
    CrossDex,
    CrossChain,
    Sandwich,
    Frontrun,
    Backrun,
    JitLiquidity,
    VolumeAnalysis,
    OrderbookImbalance,
    FundingRate,
    BasisTrading,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde spelling so logs match the API.
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

/// Chain-scoped asset identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Token {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    pub chain_id: ChainId,
    pub name: Option<String>,
}

impl Token {
    pub fn new(address: Address, symbol: &str, decimals: u8, chain_id: ChainId) -> Self {
        Self {
            address,
            symbol: symbol.to_string(),
            decimals,
            chain_id,
            name: None,
        }
    }

    /// Key used by the market snapshot maps.
    pub fn key(&self) -> String {
        self.symbol.to_ascii_uppercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceData {
    pub token: String,
    /// USD price.
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub volume_24h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub liquidity: Option<f64>,
}

impl PriceData {
    pub fn new(token: &str, price: f64, source: &str) -> Self {
        Self {
            token: token.to_ascii_uppercase(),
            price,
            timestamp: Utc::now(),
            source: source.to_string(),
            volume_24h: None,
            price_change_24h: None,
            liquidity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepAction {
    Borrow,
    Swap,
    Repay,
    Transfer,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Borrow => write!(f, "BORROW"),
            StepAction::Swap => write!(f, "SWAP"),
            StepAction::Repay => write!(f, "REPAY"),
            StepAction::Transfer => write!(f, "TRANSFER"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlashLoanStep {
    pub action: StepAction,
    pub dex: Option<String>,
    pub token_in: Option<Token>,
    pub token_out: Option<Token>,
    pub amount_in: Option<f64>,
    pub expected_amount_out: Option<f64>,
    /// Expected slippage as a fraction, e.g. 0.003.
    pub slippage: Option<f64>,
}

impl FlashLoanStep {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            dex: None,
            token_in: None,
            token_out: None,
            amount_in: None,
            expected_amount_out: None,
            slippage: None,
        }
    }
}

/// A borrow → swaps → repay chain. The backend executes it atomically, so the
/// scheduler treats the whole plan as one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlashLoanPlan {
    pub loan_token: Token,
    pub loan_amount: f64,
    pub risk_score: f64,
    pub steps: Vec<FlashLoanStep>,
}

impl FlashLoanPlan {
    pub fn validate(&self) -> EngineResult<()> {
        let first = self.steps.first().map(|s| s.action);
        let last = self.steps.last().map(|s| s.action);
        if first != Some(StepAction::Borrow) {
            return Err(EngineError::InvalidOpportunity(
                "flash loan must start with BORROW".into(),
            ));
        }
        if last != Some(StepAction::Repay) || self.steps.len() < 2 {
            return Err(EngineError::InvalidOpportunity(
                "flash loan must end with REPAY".into(),
            ));
        }
        let borrows = self.steps.iter().filter(|s| s.action == StepAction::Borrow).count();
        let repays = self.steps.iter().filter(|s| s.action == StepAction::Repay).count();
        if borrows != 1 || repays != 1 {
            return Err(EngineError::InvalidOpportunity(format!(
                "flash loan needs exactly one BORROW and one REPAY, got {} and {}",
                borrows, repays
            )));
        }
        if !self.loan_amount.is_finite() || self.loan_amount <= 0.0 {
            return Err(EngineError::InvalidOpportunity(format!(
                "flash loan amount must be positive, got {}",
                self.loan_amount
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPlan {
    /// A plain swap route across `Opportunity::dexes`.
    Swap,
    FlashLoan(FlashLoanPlan),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opportunity {
    pub id: String,
    pub strategy_id: String,
    pub kind: StrategyType,
    pub risk_level: RiskLevel,
    /// Native (ETH) profit estimate.
    pub estimated_profit: f64,
    pub estimated_profit_usd: f64,
    pub confidence: f64,
    pub gas_estimate: u64,
    /// Gas price the strategy intends to bid.
    pub gas_price_gwei: f64,
    /// Own capital the trade puts at risk. Flash loans only risk gas.
    pub position_size_eth: f64,
    pub tokens: Vec<Token>,
    pub dexes: Vec<String>,
    pub chain_id: ChainId,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub plan: ExecutionPlan,
}

impl Opportunity {
    /// Boundary check applied to everything a strategy emits.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidOpportunity("empty id".into()));
        }
        if self.expires_at <= self.timestamp {
            return Err(EngineError::InvalidOpportunity(format!(
                "{} expires at or before its creation",
                self.id
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::InvalidOpportunity(format!(
                "{} confidence {} outside [0, 1]",
                self.id, self.confidence
            )));
        }
        let numbers = [
            self.estimated_profit,
            self.estimated_profit_usd,
            self.gas_price_gwei,
            self.position_size_eth,
        ];
        if numbers.iter().any(|n| !n.is_finite()) {
            return Err(EngineError::InvalidOpportunity(format!(
                "{} carries a non-finite estimate",
                self.id
            )));
        }
        if self.gas_price_gwei < 0.0 || self.position_size_eth < 0.0 {
            return Err(EngineError::InvalidOpportunity(format!(
                "{} carries a negative gas price or position size",
                self.id
            )));
        }
        if let ExecutionPlan::FlashLoan(plan) = &self.plan {
            plan.validate()?;
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn gas_cost_eth(&self) -> f64 {
        self.gas_estimate as f64 * self.gas_price_gwei * 1e-9
    }

    pub fn flash_loan(&self) -> Option<&FlashLoanPlan> {
        match &self.plan {
            ExecutionPlan::FlashLoan(plan) => Some(plan),
            ExecutionPlan::Swap => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeResult {
    pub strategy_id: String,
    pub opportunity_id: String,
    pub success: bool,
    pub transaction_hash: Option<String>,
    /// Realized native profit; negative when gas was burnt on a revert.
    pub profit: Option<f64>,
    pub profit_usd: Option<f64>,
    pub gas_used: Option<u64>,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TradeResult {
    pub fn failed(opportunity: &Opportunity, error: &EngineError, execution_time_ms: u64) -> Self {
        Self {
            strategy_id: opportunity.strategy_id.clone(),
            opportunity_id: opportunity.id.clone(),
            success: false,
            transaction_hash: None,
            profit: None,
            profit_usd: None,
            gas_used: None,
            execution_time_ms,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_profitable(&self) -> bool {
        self.success && self.profit_usd.unwrap_or(0.0) > 0.0
    }

    /// USD outcome used for P&L series; failures without a figure count as zero.
    pub fn pnl_usd(&self) -> f64 {
        self.profit_usd.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    pub factors: Vec<String>,
    pub score: f64,
}

/// Advisory verdict from the decision overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AIDecision {
    pub should_execute: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub recommended_strategies: Vec<String>,
    pub risk_assessment: RiskAssessment,
    pub expected_profit: f64,
    pub timestamp: DateTime<Utc>,
}

/// A ranked opportunity on its way to dispatch.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub opportunity: Arc<Opportunity>,
    pub decision: Option<AIDecision>,
}

impl Candidate {
    pub fn new(opportunity: Opportunity) -> Self {
        Self {
            opportunity: Arc::new(opportunity),
            decision: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.opportunity.id
    }
}

/// Running per-strategy statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StrategyStats {
    pub success_rate: f64,
    pub total_trades: u64,
    pub profitable_trades: u64,
    pub total_profit_usd: f64,
    pub average_execution_time_ms: f64,
    pub last_executed: Option<DateTime<Utc>>,
}

impl StrategyStats {
    pub fn fold(&mut self, result: &TradeResult) {
        self.total_trades += 1;
        if result.is_profitable() {
            self.profitable_trades += 1;
        }
        self.total_profit_usd += result.pnl_usd();
        let n = self.total_trades as f64;
        self.average_execution_time_ms +=
            (result.execution_time_ms as f64 - self.average_execution_time_ms) / n;
        self.last_executed = Some(result.timestamp);
        self.recompute_success_rate();
    }

    pub fn recompute_success_rate(&mut self) {
        self.success_rate = if self.total_trades == 0 {
            0.0
        } else {
            self.profitable_trades as f64 / self.total_trades as f64
        };
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub total_trades: u64,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub total_profit_usd: f64,
    pub total_loss_usd: f64,
    pub net_profit_usd: f64,
    pub average_trade_time_ms: f64,
    pub trades_per_second: f64,
    pub success_rate: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    /// Gross profit / gross loss. `None` while there are no losses to divide by.
    pub profit_factor: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub is_running: bool,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub active_strategies: usize,
    pub total_strategies: usize,
    pub trades_executed: u64,
    pub opportunities_found: u64,
    pub current_balance: f64,
    pub profit_today: f64,
    pub uptime_secs: u64,
    pub performance: PerformanceMetrics,
    pub last_update: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use alloy::primitives::address;
    use chrono::Duration;

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
            expires_at: now + Duration::seconds(30),
            plan: ExecutionPlan::Swap,
        }
    }

    pub fn result(strategy_id: &str, success: bool, profit_usd: f64) -> TradeResult {
        TradeResult {
            strategy_id: strategy_id.into(),
            opportunity_id: format!("opp-{}", profit_usd),
            success,
            transaction_hash: None,
            profit: Some(profit_usd / 2_000.0),
            profit_usd: Some(profit_usd),
            gas_used: Some(150_000),
            execution_time_ms: 100,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn plan(actions: &[StepAction]) -> FlashLoanPlan {
        FlashLoanPlan {
            loan_token: weth(),
            loan_amount: 10.0,
            risk_score: 0.2,
            steps: actions.iter().map(|a| FlashLoanStep::new(*a)).collect(),
        }
    }

    #[test]
    fn test_flash_loan_plan_shape() {
        use StepAction::*;
        assert!(plan(&[Borrow, Swap, Swap, Repay]).validate().is_ok());
        assert!(plan(&[Borrow, Swap, Transfer, Repay]).validate().is_ok());
        assert!(plan(&[Swap, Borrow, Repay]).validate().is_err());
        assert!(plan(&[Borrow, Swap]).validate().is_err());
        assert!(plan(&[Borrow, Borrow, Repay]).validate().is_err());
        assert!(plan(&[Borrow, Repay, Swap, Repay]).validate().is_err());
    }

    #[test]
    fn test_opportunity_window_and_confidence_checked() {
        let mut opp = opportunity("a", "s", 100.0);
        assert!(opp.validate().is_ok());

        opp.expires_at = opp.timestamp;
        assert!(opp.validate().is_err());

        let mut opp = opportunity("b", "s", 100.0);
        opp.confidence = 1.2;
        assert!(opp.validate().is_err());
    }

    #[test]
    fn test_success_rate_recomputed_from_counts() {
        let mut stats = StrategyStats {
            total_trades: 9,
            profitable_trades: 5,
            ..Default::default()
        };
        stats.fold(&result("s", true, 25.0));
        assert_eq!(stats.total_trades, 10);
        assert_eq!(stats.profitable_trades, 6);
        assert!((stats.success_rate - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_failed_or_flat_trades_are_not_profitable() {
        let mut stats = StrategyStats::default();
        assert_eq!(stats.success_rate, 0.0);
        stats.fold(&result("s", false, 50.0));
        stats.fold(&result("s", true, 0.0));
        assert_eq!(stats.profitable_trades, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.total_trades, 2);
    }

    #[test]
    fn test_average_execution_time_is_running_mean() {
        let mut stats = StrategyStats::default();
        let mut r = result("s", true, 1.0);
        r.execution_time_ms = 100;
        stats.fold(&r);
        r.execution_time_ms = 300;
        stats.fold(&r);
        assert!((stats.average_execution_time_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_type_display_matches_serde() {
        assert_eq!(StrategyType::FlashLoan.to_string(), "FLASH_LOAN");
        assert_eq!(StrategyType::CrossDex.to_string(), "CROSS_DEX");
    }
}
