use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::TradeResult;
use crate::engine::performance::PerformanceTracker;
use crate::engine::registry::{RegistryContext, StrategyFilter, StrategyRegistry};

/// Profit factor ceiling, also used when a strategy has profits and no losses.
const PF_CAP: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyScore {
    pub id: String,
    pub score: f64,
    pub protected: bool,
}

#[derive(Debug, Default, PartialEq)]
pub struct RotationReport {
    pub benched: Vec<String>,
    pub reinstated: Vec<String>,
    /// (enabled, disabled) pairs swapped in one step.
    pub swapped: Vec<(String, String)>,
}

/// Periodically re-ranks strategies by recent results and keeps the enabled set
/// within capacity, benching weak performers and bringing benched ones back.
pub struct StrategyRotator {
    registry: RegistryContext,
    tracker: PerformanceTracker,
    min_sample: u64,
    grace: ChronoDuration,
    window: usize,
}

impl StrategyRotator {
    pub fn new(config: &Config, registry: RegistryContext, tracker: PerformanceTracker) -> Self {
        Self {
            registry,
            tracker,
            min_sample: config.engine.rotation_min_sample,
            grace: ChronoDuration::milliseconds(config.engine.rotation_grace_ms as i64),
            window: config.engine.rotation_window,
        }
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Strategy rotator started (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so fresh strategies get a window.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.rotate(Utc::now()).await;
                    if report != RotationReport::default() {
                        info!("Rotation: {:?}", report);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Strategy rotator shutting down");
                    break;
                }
            }
        }
    }

    pub async fn rotate(&self, now: DateTime<Utc>) -> RotationReport {
        let ids: Vec<String> = self
            .registry
            .read()
            .await
            .list(StrategyFilter::default())
            .iter()
            .map(|e| e.id().to_string())
            .collect();

        let mut recent = HashMap::new();
        for id in &ids {
            recent.insert(id.clone(), self.tracker.recent(Some(id.as_str()), self.window).await);
        }

        let mut registry = self.registry.write().await;
        let scores = self.score_all(&registry, &recent, now);
        apply(&mut registry, &scores)
    }

    fn score_all(
        &self,
        registry: &StrategyRegistry,
        recent: &HashMap<String, Vec<TradeResult>>,
        now: DateTime<Utc>,
    ) -> Vec<StrategyScore> {
        let mut scores: Vec<StrategyScore> = registry
            .list(StrategyFilter::default())
            .into_iter()
            .map(|entry| {
                let results = recent.get(entry.id()).map(Vec::as_slice).unwrap_or(&[]);
                let protected = entry.stats.total_trades < self.min_sample
                    || now - entry.registered_at < self.grace;
                StrategyScore {
                    id: entry.id().to_string(),
                    score: score(results, self.min_sample),
                    protected,
                }
            })
            .collect();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scores
    }
}

/// Capped profit factor of `results`, shrunk toward zero for small samples.
pub fn score(results: &[TradeResult], min_sample: u64) -> f64 {
    let gross_profit: f64 = results.iter().map(TradeResult::pnl_usd).filter(|p| *p > 0.0).sum();
    let gross_loss: f64 = -results
        .iter()
        .map(TradeResult::pnl_usd)
        .filter(|p| *p < 0.0)
        .sum::<f64>();
    let pf = if gross_profit <= 0.0 {
        0.0
    } else if gross_loss <= 0.0 {
        PF_CAP
    } else {
        (gross_profit / gross_loss).min(PF_CAP)
    };
    let n = results.len() as f64;
    pf * n / (n + min_sample as f64)
}

/// Applies one rotation to `registry` given scores sorted best first.
fn apply(registry: &mut StrategyRegistry, scores: &[StrategyScore]) -> RotationReport {
    let mut report = RotationReport::default();
    let count = scores.len() as u32;
    for (rank, s) in scores.iter().enumerate() {
        if let Err(e) = registry.set_priority(&s.id, count - rank as u32) {
            warn!("Rotation could not re-rank {}: {}", s.id, e);
        }
    }

    let median = median(&scores.iter().map(|s| s.score).collect::<Vec<_>>());
    let enabled = |registry: &StrategyRegistry, id: &str| registry.get(id).map_or(false, |e| e.enabled);
    let benched = |registry: &StrategyRegistry, id: &str| registry.get(id).map_or(false, |e| e.benched);

    // Over capacity: bench the weakest unprotected strategies, below-median first.
    let excess = registry.active_count().saturating_sub(registry.max_active());
    if excess > 0 {
        let mut victims: Vec<&StrategyScore> = scores
            .iter()
            .rev()
            .filter(|s| !s.protected && enabled(registry, &s.id))
            .collect();
        victims.sort_by_key(|s| s.score >= median);
        for victim in victims.into_iter().take(excess) {
            if let Err(e) = registry
                .set_enabled(&victim.id, false)
                .and_then(|_| registry.set_benched(&victim.id, true))
            {
                warn!("Rotation could not bench {}: {}", victim.id, e);
                continue;
            }
            report.benched.push(victim.id.clone());
        }
        if registry.active_count() > registry.max_active() {
            warn!(
                "{} strategies enabled above the limit of {}; the rest are protected",
                registry.active_count(),
                registry.max_active()
            );
        }
    }

    // Free slots go to benched strategies, best first.
    let waiting: Vec<&StrategyScore> = scores.iter().filter(|s| benched(registry, &s.id)).collect();
    for s in waiting {
        if registry.active_count() >= registry.max_active() {
            break;
        }
        if registry.set_enabled(&s.id, true).is_ok() {
            report.reinstated.push(s.id.clone());
        }
    }

    // Full: a benched strategy that outscores a below-median active one takes its slot.
    let waiting: Vec<&StrategyScore> = scores.iter().filter(|s| benched(registry, &s.id)).collect();
    for incoming in waiting {
        let outgoing = scores.iter().rev().find(|s| {
            !s.protected
                && enabled(registry, &s.id)
                && s.score < median
                && s.score < incoming.score
        });
        if let Some(outgoing) = outgoing {
            match registry
                .replace(&incoming.id, &outgoing.id)
                .and_then(|_| registry.set_benched(&outgoing.id, true))
            {
                Ok(()) => report.swapped.push((incoming.id.clone(), outgoing.id.clone())),
                Err(e) => warn!(
                    "Rotation could not swap {} in for {}: {}",
                    incoming.id, outgoing.id, e
                ),
            }
        }
    }

    report
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
