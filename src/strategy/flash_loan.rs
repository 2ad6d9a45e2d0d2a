use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::adapters::execution::ExecutionBackend;
use crate::domain::{
    ExecutionPlan, FlashLoanPlan, FlashLoanStep, Opportunity, RiskLevel, StepAction,
    StrategyType, Token, TradeResult,
};
use crate::error::{EngineError, EngineResult};
use crate::feeds::MarketSnapshot;
use crate::strategy::{best_spread, Spread, Strategy};

/// Parameters for flash-loan funded cross-venue arbitrage.
#[derive(Debug, Clone)]
pub struct FlashLoanParams {
    /// Asset borrowed and repaid.
    pub loan_token: Token,
    pub targets: Vec<Token>,
    pub dexes: Vec<String>,
    pub native_symbol: String,
    /// Loan size in ETH, default 50. Never above the configured flash-loan cap.
    pub loan_amount_eth: f64,
    /// Lender fee, default 9 bps.
    pub fee_bps: f64,
    /// Minimum gross spread, default 40 bps.
    pub min_spread_bps: f64,
    /// Gas units for borrow + two swaps + repay, default 450k.
    pub gas_units: u64,
    pub fallback_gas_gwei: f64,
    /// Skip routes whose estimated price impact exceeds this fraction, default 0.5%.
    pub max_slippage: f64,
    pub ttl_ms: i64,
}

impl FlashLoanParams {
    pub fn new(loan_token: Token, targets: Vec<Token>, dexes: Vec<String>) -> Self {
        Self {
            loan_token,
            targets,
            dexes,
            native_symbol: "ETH".into(),
            loan_amount_eth: 50.0,
            fee_bps: 9.0,
            min_spread_bps: 40.0,
            gas_units: 450_000,
            fallback_gas_gwei: 30.0,
            max_slippage: 0.005,
            ttl_ms: 3_000,
        }
    }
}

/// Borrows `loan_token`, buys a target on the cheap venue, sells it on the dear one
/// and repays, all inside one atomic plan.
pub struct FlashLoanArbStrategy {
    id: String,
    params: FlashLoanParams,
    backend: Arc<dyn ExecutionBackend>,
}

impl FlashLoanArbStrategy {
    pub fn new(id: &str, params: FlashLoanParams, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            id: id.to_string(),
            params,
            backend,
        }
    }

    /// Price impact proxy: notional over pool depth.
    fn slippage(&self, snapshot: &MarketSnapshot, token: &str, notional_usd: f64) -> f64 {
        match snapshot.liquidity(token) {
            Some(liquidity) if liquidity > 0.0 => notional_usd / liquidity,
            _ => self.params.max_slippage,
        }
    }

    fn build_plan(&self, target: &Token, spread: &Spread, native_usd: f64, slippage: f64) -> FlashLoanPlan {
        let loan = self.params.loan_amount_eth;
        let bought = loan * native_usd / spread.buy_price;
        let sold_back = bought * spread.sell_price / native_usd;

        let borrow = FlashLoanStep {
            token_out: Some(self.params.loan_token.clone()),
            amount_in: Some(loan),
            ..FlashLoanStep::new(StepAction::Borrow)
        };
        let buy = FlashLoanStep {
            dex: Some(spread.buy_dex.clone()),
            token_in: Some(self.params.loan_token.clone()),
            token_out: Some(target.clone()),
            amount_in: Some(loan),
            expected_amount_out: Some(bought),
            slippage: Some(slippage),
            ..FlashLoanStep::new(StepAction::Swap)
        };
        let sell = FlashLoanStep {
            dex: Some(spread.sell_dex.clone()),
            token_in: Some(target.clone()),
            token_out: Some(self.params.loan_token.clone()),
            amount_in: Some(bought),
            expected_amount_out: Some(sold_back),
            slippage: Some(slippage),
            ..FlashLoanStep::new(StepAction::Swap)
        };
        let repay = FlashLoanStep {
            token_in: Some(self.params.loan_token.clone()),
            amount_in: Some(loan * (1.0 + self.params.fee_bps / 10_000.0)),
            ..FlashLoanStep::new(StepAction::Repay)
        };

        FlashLoanPlan {
            loan_token: self.params.loan_token.clone(),
            loan_amount: loan,
            risk_score: (slippage / self.params.max_slippage).clamp(0.0, 1.0),
            steps: vec![borrow, buy, sell, repay],
        }
    }
}

#[async_trait::async_trait]
impl Strategy for FlashLoanArbStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "flash_loan_arb"
    }

    fn kind(&self) -> StrategyType {
        StrategyType::FlashLoan
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn validate(&self) -> EngineResult<()> {
        let p = &self.params;
        let invalid = |msg: &str| Err(EngineError::InvalidStrategyConfig(format!("{}: {}", self.id, msg)));
        if p.targets.is_empty() || p.dexes.len() < 2 {
            return invalid("needs targets and at least two dexes");
        }
        if !(p.loan_amount_eth > 0.0) || !(p.min_spread_bps > 0.0) {
            return invalid("loan_amount_eth and min_spread_bps must be positive");
        }
        if !(0.0..1_000.0).contains(&p.fee_bps) || !(p.max_slippage > 0.0) {
            return invalid("fee_bps must be within [0, 1000) and max_slippage positive");
        }
        if p.ttl_ms <= 0 {
            return invalid("ttl_ms must be positive");
        }
        Ok(())
    }

    async fn scan(&self, snapshot: &MarketSnapshot) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();

        let native_usd = match snapshot.price(&self.params.native_symbol) {
            Some(p) => p,
            None => return opportunities,
        };
        let chain = self.params.loan_token.chain_id;
        let gas_gwei = snapshot.gas_price(chain).unwrap_or(self.params.fallback_gas_gwei);
        let gas_cost_eth = self.params.gas_units as f64 * gas_gwei * 1e-9;
        let loan = self.params.loan_amount_eth;
        let fee_eth = loan * self.params.fee_bps / 10_000.0;

        for target in &self.params.targets {
            let key = target.key();
            let spread = match best_spread(snapshot, &key, &self.params.dexes) {
                Some(s) if s.bps() >= self.params.min_spread_bps => s,
                _ => continue,
            };

            let slippage = self.slippage(snapshot, &key, loan * native_usd);
            if slippage > self.params.max_slippage {
                continue;
            }

            let profit_eth = loan * spread.ratio() - fee_eth - gas_cost_eth;
            if profit_eth <= 0.0 {
                continue;
            }

            let plan = self.build_plan(target, &spread, native_usd, slippage);
            let now = Utc::now();
            tracing::info!(
                "Flash-loan route {}: borrow {:.2} {} via {} -> {} ({:.1} bps, {:.4} ETH)",
                key,
                loan,
                self.params.loan_token.symbol,
                spread.buy_dex,
                spread.sell_dex,
                spread.bps(),
                profit_eth
            );

            opportunities.push(Opportunity {
                id: format!(
                    "{}:{}:{}>{}:{}",
                    self.id, key, spread.buy_dex, spread.sell_dex, snapshot.tag()
                ),
                strategy_id: self.id.clone(),
                kind: self.kind(),
                risk_level: self.risk_level(),
                estimated_profit: profit_eth,
                estimated_profit_usd: profit_eth * native_usd,
                confidence: (1.0 - plan.risk_score * 0.5).clamp(0.0, 1.0),
                gas_estimate: self.params.gas_units,
                gas_price_gwei: gas_gwei,
                // Borrowed capital is not ours; only the gas is at risk.
                position_size_eth: gas_cost_eth,
                tokens: vec![self.params.loan_token.clone(), target.clone()],
                dexes: vec![spread.buy_dex.clone(), spread.sell_dex.clone()],
                chain_id: chain,
                timestamp: now,
                expires_at: now + Duration::milliseconds(self.params.ttl_ms),
                plan: ExecutionPlan::FlashLoan(plan),
            });
        }

        opportunities
    }

    async fn execute(&self, opportunity: &Opportunity) -> TradeResult {
        // The backend runs the whole plan atomically and reports one result.
        self.backend.execute(opportunity).await
    }
}
