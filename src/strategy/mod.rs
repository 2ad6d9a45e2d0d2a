pub mod cross_dex;
pub mod flash_loan;

use crate::domain::{Opportunity, RiskLevel, StrategyType, TradeResult};
use crate::error::EngineResult;
use crate::feeds::MarketSnapshot;

/// A trading strategy: finds opportunities in a snapshot and executes the ones the
/// scheduler hands back. Scans must not mutate shared state.
#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> StrategyType;
    fn risk_level(&self) -> RiskLevel;

    /// Checks the strategy's parameters. Called once at registration.
    fn validate(&self) -> EngineResult<()>;

    async fn scan(&self, snapshot: &MarketSnapshot) -> Vec<Opportunity>;

    /// Runs one opportunity to completion. Failures come back as a failed
    /// `TradeResult`, never as a panic or error.
    async fn execute(&self, opportunity: &Opportunity) -> TradeResult;
}

/// Cheapest and dearest venue for a token among the watched dexes.
#[derive(Debug, Clone, PartialEq)]
pub struct Spread {
    pub buy_dex: String,
    pub buy_price: f64,
    pub sell_dex: String,
    pub sell_price: f64,
}

impl Spread {
    pub fn bps(&self) -> f64 {
        (self.sell_price - self.buy_price) / self.buy_price * 10_000.0
    }

    pub fn ratio(&self) -> f64 {
        (self.sell_price - self.buy_price) / self.buy_price
    }
}

pub fn best_spread(snapshot: &MarketSnapshot, token: &str, dexes: &[String]) -> Option<Spread> {
    let quotes = snapshot.quotes(token)?;
    let watched: Vec<(&String, f64)> = quotes
        .iter()
        .filter(|(dex, _)| dexes.is_empty() || dexes.contains(dex))
        .map(|(dex, &p)| (dex, p))
        .collect();

    if watched.len() < 2 {
        return None;
    }

    let (buy_dex, buy_price) = watched
        .iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .copied()?;
    let (sell_dex, sell_price) = watched
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .copied()?;

    if sell_price <= buy_price {
        return None;
    }

    Some(Spread {
        buy_dex: buy_dex.clone(),
        buy_price,
        sell_dex: sell_dex.clone(),
        sell_price,
    })
}
