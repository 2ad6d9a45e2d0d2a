use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use crate::config::StrategiesConfig;
use crate::domain::{RiskLevel, StrategyStats, StrategyType, TradeResult};
use crate::error::{EngineError, EngineResult};
use crate::strategy::Strategy;

/// Operator-facing knobs supplied when a strategy is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySettings {
    pub enabled: bool,
    pub priority: u32,
    pub min_profit_usd: f64,
    pub max_gas_price_gwei: f64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
            min_profit_usd: 10.0,
            max_gas_price_gwei: 100.0,
        }
    }
}

pub struct StrategyEntry {
    pub strategy: Arc<dyn Strategy>,
    pub enabled: bool,
    pub priority: u32,
    pub min_profit_usd: f64,
    pub max_gas_price_gwei: f64,
    pub stats: StrategyStats,
    pub registered_at: DateTime<Utc>,
    /// Disabled by the rotator rather than by an operator; eligible for re-enable.
    pub benched: bool,
}

impl StrategyEntry {
    pub fn id(&self) -> &str {
        self.strategy.id()
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.strategy.risk_level()
    }

    pub fn kind(&self) -> StrategyType {
        self.strategy.kind()
    }

    pub fn info(&self) -> StrategyInfo {
        StrategyInfo {
            id: self.id().to_string(),
            name: self.strategy.name().to_string(),
            kind: self.kind(),
            risk_level: self.risk_level(),
            enabled: self.enabled,
            priority: self.priority,
            min_profit_usd: self.min_profit_usd,
            max_gas_price_gwei: self.max_gas_price_gwei,
            stats: self.stats.clone(),
        }
    }
}

/// Serializable view of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub id: String,
    pub name: String,
    pub kind: StrategyType,
    pub risk_level: RiskLevel,
    pub enabled: bool,
    pub priority: u32,
    pub min_profit_usd: f64,
    pub max_gas_price_gwei: f64,
    pub stats: StrategyStats,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyFilter {
    pub enabled: Option<bool>,
    pub risk_level: Option<RiskLevel>,
    pub kind: Option<StrategyType>,
}

impl StrategyFilter {
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &StrategyEntry) -> bool {
        self.enabled.map_or(true, |e| entry.enabled == e)
            && self.risk_level.map_or(true, |r| entry.risk_level() == r)
            && self.kind.map_or(true, |k| entry.kind() == k)
    }
}

/// Owns every strategy entry. Stats change only through `apply_result`; enablement
/// and priority only through the setters below.
pub struct StrategyRegistry {
    limits: StrategiesConfig,
    entries: HashMap<String, StrategyEntry>,
}

impl StrategyRegistry {
    pub fn new(limits: StrategiesConfig) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
        }
    }

    /// Validates parameters and inserts the strategy disabled, then enables it if asked.
    /// A failed enable leaves the strategy registered but disabled.
    pub fn register(
        &mut self,
        strategy: Arc<dyn Strategy>,
        settings: StrategySettings,
    ) -> EngineResult<()> {
        strategy.validate()?;
        let id = strategy.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(EngineError::DuplicateStrategy(id));
        }
        if !settings.min_profit_usd.is_finite() || !(settings.max_gas_price_gwei >= 0.0) {
            return Err(EngineError::InvalidStrategyConfig(format!(
                "{}: thresholds must be finite and non-negative",
                id
            )));
        }

        info!(
            "Registered strategy {} ({}, {})",
            id,
            strategy.kind(),
            strategy.risk_level()
        );
        self.entries.insert(
            id.clone(),
            StrategyEntry {
                strategy,
                enabled: false,
                priority: settings.priority,
                min_profit_usd: settings.min_profit_usd,
                max_gas_price_gwei: settings.max_gas_price_gwei,
                stats: StrategyStats::default(),
                registered_at: Utc::now(),
                benched: false,
            },
        );

        if settings.enabled {
            self.set_enabled(&id, true)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&StrategyEntry> {
        self.entries.get(id)
    }

    /// Matching entries, highest priority first.
    pub fn list(&self, filter: StrategyFilter) -> Vec<&StrategyEntry> {
        let mut out: Vec<&StrategyEntry> =
            self.entries.values().filter(|e| filter.matches(e)).collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id().cmp(b.id())));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.enabled).count()
    }

    pub fn max_active(&self) -> usize {
        self.limits.max_active_strategies
    }

    /// Changes the capacity bound. Lowering it disables nothing; the rotator brings
    /// the enabled set back within the new bound.
    pub fn set_max_active(&mut self, max: usize) {
        self.limits.max_active_strategies = max;
    }

    fn check_enable(&self, entry: &StrategyEntry, active_after: usize) -> EngineResult<()> {
        if !self.limits.allows(entry.risk_level()) {
            return Err(EngineError::RiskLevelDisabled(entry.risk_level()));
        }
        if active_after > self.limits.max_active_strategies {
            return Err(EngineError::CapacityExceeded {
                limit: self.limits.max_active_strategies,
            });
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> EngineResult<()> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
        if entry.enabled == enabled {
            return Ok(());
        }
        if enabled {
            self.check_enable(entry, self.active_count() + 1)?;
        }

        if let Some(entry) = self.entries.get_mut(id) {
            entry.enabled = enabled;
            entry.benched = false;
        }
        info!("Strategy {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Enables `enable_id` while disabling `disable_id` in one step, so a full
    /// registry can swap strategies without tripping the capacity bound.
    pub fn replace(&mut self, enable_id: &str, disable_id: &str) -> EngineResult<()> {
        let incoming = self
            .entries
            .get(enable_id)
            .ok_or_else(|| EngineError::UnknownStrategy(enable_id.to_string()))?;
        let outgoing = self
            .entries
            .get(disable_id)
            .ok_or_else(|| EngineError::UnknownStrategy(disable_id.to_string()))?;
        if incoming.enabled {
            return self.set_enabled(disable_id, false);
        }

        let freed = usize::from(outgoing.enabled);
        self.check_enable(incoming, self.active_count() + 1 - freed)?;

        if let Some(e) = self.entries.get_mut(disable_id) {
            e.enabled = false;
        }
        if let Some(e) = self.entries.get_mut(enable_id) {
            e.enabled = true;
            e.benched = false;
        }
        info!("Strategy {} replaced {}", enable_id, disable_id);
        Ok(())
    }

    pub fn set_priority(&mut self, id: &str, priority: u32) -> EngineResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
        entry.priority = priority;
        Ok(())
    }

    pub(crate) fn set_benched(&mut self, id: &str, benched: bool) -> EngineResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
        entry.benched = benched;
        Ok(())
    }

    /// Folds a result into the owning strategy's stats and returns the new stats.
    pub fn apply_result(&mut self, result: &TradeResult) -> EngineResult<StrategyStats> {
        let entry = self
            .entries
            .get_mut(&result.strategy_id)
            .ok_or_else(|| EngineError::UnknownStrategy(result.strategy_id.clone()))?;
        entry.stats.fold(result);
        Ok(entry.stats.clone())
    }

    /// Restores persisted statistics; the success rate is recomputed, not trusted.
    pub fn restore_stats(&mut self, id: &str, mut stats: StrategyStats) -> EngineResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
        stats.recompute_success_rate();
        entry.stats = stats;
        Ok(())
    }
}

/// Shared handle to the registry, passed explicitly to the scheduler and rotator.
#[derive(Clone)]
pub struct RegistryContext {
    inner: Arc<RwLock<StrategyRegistry>>,
}

impl RegistryContext {
    pub fn new(registry: StrategyRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, StrategyRegistry> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, StrategyRegistry> {
        self.inner.write().await
    }

    /// Enabled strategies, highest priority first.
    pub async fn enabled_strategies(&self) -> Vec<Arc<dyn Strategy>> {
        self.read()
            .await
            .list(StrategyFilter::enabled())
            .into_iter()
            .map(|e| Arc::clone(&e.strategy))
            .collect()
    }

    pub async fn infos(&self) -> Vec<StrategyInfo> {
        self.read()
            .await
            .list(StrategyFilter::default())
            .into_iter()
            .map(StrategyEntry::info)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::{Opportunity, TradeResult};
    use crate::feeds::MarketSnapshot;

    /// Strategy stub with fixed identity and no behaviour.
    pub struct StubStrategy {
        pub id: String,
        pub risk: RiskLevel,
    }

    pub fn stub(id: &str, risk: RiskLevel) -> Arc<dyn Strategy> {
        Arc::new(StubStrategy { id: id.into(), risk })
    }

    #[async_trait::async_trait]
    impl Strategy for StubStrategy {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn kind(&self) -> StrategyType {
            StrategyType::Arbitrage
        }
        fn risk_level(&self) -> RiskLevel {
            self.risk
        }
        fn validate(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn scan(&self, _snapshot: &MarketSnapshot) -> Vec<Opportunity> {
            Vec::new()
        }
        async fn execute(&self, opportunity: &Opportunity) -> TradeResult {
            TradeResult::failed(opportunity, &EngineError::ExecutionReverted("stub".into()), 0)
        }
    }
}
