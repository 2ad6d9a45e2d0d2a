use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::adapters::execution::ExecutionBackend;
use crate::domain::{
    ChainId, ExecutionPlan, Opportunity, RiskLevel, StrategyType, Token, TradeResult,
};
use crate::error::{EngineError, EngineResult};
use crate::feeds::MarketSnapshot;
use crate::strategy::{best_spread, Strategy};

/// Parameters for cross-DEX arbitrage.
#[derive(Debug, Clone)]
pub struct CrossDexParams {
    /// Quote asset every trade starts and ends in (usually WETH).
    pub base: Token,
    /// Tokens to watch across venues.
    pub tokens: Vec<Token>,
    /// Venues to compare. At least two.
    pub dexes: Vec<String>,
    /// Symbol whose reference price converts ETH to USD.
    pub native_symbol: String,
    /// Minimum gross spread, default 30 bps.
    pub min_spread_bps: f64,
    /// Notional per trade in ETH, default 1.
    pub trade_size_eth: f64,
    /// Gas units per round trip, default 250k.
    pub gas_units: u64,
    /// Used when the snapshot has no gas price for the chain, default 30 gwei.
    pub fallback_gas_gwei: f64,
    /// Opportunity lifetime, default 4s.
    pub ttl_ms: i64,
}

impl CrossDexParams {
    pub fn new(base: Token, tokens: Vec<Token>, dexes: Vec<String>) -> Self {
        Self {
            base,
            tokens,
            dexes,
            native_symbol: "ETH".into(),
            min_spread_bps: 30.0,
            trade_size_eth: 1.0,
            gas_units: 250_000,
            fallback_gas_gwei: 30.0,
            ttl_ms: 4_000,
        }
    }
}

/// Buys a token on the cheapest watched venue and sells it on the dearest.
pub struct CrossDexArbStrategy {
    id: String,
    params: CrossDexParams,
    backend: Arc<dyn ExecutionBackend>,
}

impl CrossDexArbStrategy {
    pub fn new(id: &str, params: CrossDexParams, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            id: id.to_string(),
            params,
            backend,
        }
    }

    fn chain(&self) -> ChainId {
        self.params.base.chain_id
    }

    /// Depth-based confidence: a trade that is small relative to the pool scores high.
    fn confidence(&self, snapshot: &MarketSnapshot, token: &str, notional_usd: f64) -> f64 {
        match snapshot.liquidity(token) {
            Some(liquidity) if liquidity > 0.0 => {
                (1.0 - notional_usd / liquidity * 10.0).clamp(0.05, 0.99)
            }
            _ => 0.5,
        }
    }
}

#[async_trait::async_trait]
impl Strategy for CrossDexArbStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "cross_dex_arb"
    }

    fn kind(&self) -> StrategyType {
        StrategyType::CrossDex
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    fn validate(&self) -> EngineResult<()> {
        let p = &self.params;
        let invalid = |msg: &str| Err(EngineError::InvalidStrategyConfig(format!("{}: {}", self.id, msg)));
        if p.tokens.is_empty() {
            return invalid("no tokens to watch");
        }
        if p.dexes.len() < 2 {
            return invalid("needs at least two dexes");
        }
        if p.tokens.iter().any(|t| t.chain_id != p.base.chain_id) {
            return invalid("tokens must share the base token's chain");
        }
        if !(p.min_spread_bps > 0.0) || !(p.trade_size_eth > 0.0) {
            return invalid("min_spread_bps and trade_size_eth must be positive");
        }
        if p.ttl_ms <= 0 || !(p.fallback_gas_gwei >= 0.0) {
            return invalid("ttl_ms must be positive and fallback gas non-negative");
        }
        Ok(())
    }

    async fn scan(&self, snapshot: &MarketSnapshot) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();

        let native_usd = match snapshot.price(&self.params.native_symbol) {
            Some(p) => p,
            None => return opportunities,
        };
        let gas_gwei = snapshot
            .gas_price(self.chain())
            .unwrap_or(self.params.fallback_gas_gwei);
        let gas_cost_eth = self.params.gas_units as f64 * gas_gwei * 1e-9;

        for token in &self.params.tokens {
            let key = token.key();
            let spread = match best_spread(snapshot, &key, &self.params.dexes) {
                Some(s) if s.bps() >= self.params.min_spread_bps => s,
                _ => continue,
            };

            let notional_usd = self.params.trade_size_eth * native_usd;
            let profit_usd = notional_usd * spread.ratio() - gas_cost_eth * native_usd;
            if profit_usd <= 0.0 {
                continue;
            }

            let now = Utc::now();
            opportunities.push(Opportunity {
                id: format!(
                    "{}:{}:{}>{}:{}",
                    self.id, key, spread.buy_dex, spread.sell_dex, snapshot.tag()
                ),
                strategy_id: self.id.clone(),
                kind: self.kind(),
                risk_level: self.risk_level(),
                estimated_profit: profit_usd / native_usd,
                estimated_profit_usd: profit_usd,
                confidence: self.confidence(snapshot, &key, notional_usd),
                gas_estimate: self.params.gas_units,
                gas_price_gwei: gas_gwei,
                position_size_eth: self.params.trade_size_eth,
                tokens: vec![self.params.base.clone(), token.clone()],
                dexes: vec![spread.buy_dex.clone(), spread.sell_dex.clone()],
                chain_id: self.chain(),
                timestamp: now,
                expires_at: now + Duration::milliseconds(self.params.ttl_ms),
                plan: ExecutionPlan::Swap,
            });

            tracing::debug!(
                "Cross-dex spread {}: {} @ {:.4} -> {} @ {:.4} ({:.1} bps, ${:.2})",
                key,
                spread.buy_dex,
                spread.buy_price,
                spread.sell_dex,
                spread.sell_price,
                spread.bps(),
                profit_usd
            );
        }

        opportunities
    }

    async fn execute(&self, opportunity: &Opportunity) -> TradeResult {
        self.backend.execute(opportunity).await
    }
}
