use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::{AIDecision, Candidate, Opportunity, RiskAssessment, RiskLevel};
use crate::engine::registry::RegistryContext;
use crate::feeds::MarketSnapshot;

/// Attaches an advisory verdict to a candidate before it reaches the risk gate.
pub trait DecisionOverlay: Send + Sync {
    fn assess(&self, opportunity: &Opportunity) -> Option<AIDecision>;
}

/// Vetoes opportunities whose expected profit does not survive a haircut for gas
/// and confidence. Stands in for an external model.
pub struct ExpectedValueOverlay {
    pub confidence_threshold: f64,
}

impl DecisionOverlay for ExpectedValueOverlay {
    fn assess(&self, opportunity: &Opportunity) -> Option<AIDecision> {
        let expected = opportunity.estimated_profit * opportunity.confidence;
        let mut factors = Vec::new();
        if opportunity.confidence < self.confidence_threshold {
            factors.push(format!("confidence {:.2} below threshold", opportunity.confidence));
        }
        if expected <= opportunity.gas_cost_eth() {
            factors.push("expected profit does not cover gas".to_string());
        }
        let score = 1.0 - opportunity.confidence;
        let overall_risk = match score {
            s if s < 0.2 => RiskLevel::Low,
            s if s < 0.5 => RiskLevel::Medium,
            s if s < 0.8 => RiskLevel::High,
            _ => RiskLevel::Extreme,
        };

        Some(AIDecision {
            should_execute: factors.is_empty(),
            confidence: opportunity.confidence,
            reasoning: if factors.is_empty() {
                "expected value positive after gas".into()
            } else {
                factors.join("; ")
            },
            recommended_strategies: vec![opportunity.strategy_id.clone()],
            risk_assessment: RiskAssessment {
                overall_risk,
                factors,
                score,
            },
            expected_profit: expected,
            timestamp: Utc::now(),
        })
    }
}

/// Result of one aggregation pass.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub candidates: Vec<Candidate>,
    /// Valid opportunities reported by scans, before dedup and expiry.
    pub found: usize,
    pub rejected: usize,
    pub timed_out: Vec<String>,
}

pub struct OpportunityAggregator {
    scan_timeout: Duration,
    overlay: Option<Arc<dyn DecisionOverlay>>,
}

impl OpportunityAggregator {
    pub fn new(scan_timeout: Duration, overlay: Option<Arc<dyn DecisionOverlay>>) -> Self {
        Self {
            scan_timeout,
            overlay,
        }
    }

    /// Runs every enabled strategy's scan concurrently against one snapshot and waits
    /// for all of them (or their timeout) before ranking.
    pub async fn collect(
        &self,
        registry: &RegistryContext,
        snapshot: Arc<MarketSnapshot>,
    ) -> Aggregation {
        let strategies = registry.enabled_strategies().await;
        let mut scans = JoinSet::new();

        for strategy in strategies {
            let snapshot = Arc::clone(&snapshot);
            let timeout = self.scan_timeout;
            scans.spawn(async move {
                let id = strategy.id().to_string();
                let found = tokio::time::timeout(timeout, strategy.scan(&snapshot)).await;
                (id, found)
            });
        }

        let mut batches = Vec::new();
        let mut timed_out = Vec::new();
        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok((id, Ok(found))) => batches.push((id, found)),
                Ok((id, Err(_))) => {
                    warn!("Scan of {} timed out after {:?}", id, self.scan_timeout);
                    timed_out.push(id);
                }
                Err(e) => warn!("Scan task failed: {:?}", e),
            }
        }

        let mut aggregation = merge(batches, Utc::now());
        aggregation.timed_out = timed_out;
        if let Some(overlay) = &self.overlay {
            for candidate in &mut aggregation.candidates {
                candidate.decision = overlay.assess(&candidate.opportunity);
            }
        }
        aggregation
    }
}

/// Validates, dedups by id (later timestamp wins), drops expired entries and ranks
/// by USD profit desc, confidence desc, then age (oldest first).
pub fn merge(batches: Vec<(String, Vec<Opportunity>)>, now: DateTime<Utc>) -> Aggregation {
    let mut by_id: HashMap<String, Opportunity> = HashMap::new();
    let mut found = 0;
    let mut rejected = 0;

    for (strategy_id, opportunities) in batches {
        for opp in opportunities {
            if opp.strategy_id != strategy_id {
                warn!(
                    "Dropping {}: claims strategy {} but came from {}",
                    opp.id, opp.strategy_id, strategy_id
                );
                rejected += 1;
                continue;
            }
            if let Err(e) = opp.validate() {
                warn!("Dropping opportunity from {}: {}", strategy_id, e);
                rejected += 1;
                continue;
            }
            found += 1;
            match by_id.get(&opp.id) {
                Some(existing) if existing.timestamp >= opp.timestamp => {}
                _ => {
                    by_id.insert(opp.id.clone(), opp);
                }
            }
        }
    }

    let mut ranked: Vec<Opportunity> = by_id
        .into_values()
        .filter(|opp| {
            let live = !opp.is_expired(now);
            if !live {
                debug!("Dropping {} at merge: expired", opp.id);
            }
            live
        })
        .collect();
    ranked.sort_by(rank);

    Aggregation {
        candidates: ranked.into_iter().map(Candidate::new).collect(),
        found,
        rejected,
        timed_out: Vec::new(),
    }
}

fn rank(a: &Opportunity, b: &Opportunity) -> Ordering {
    b.estimated_profit_usd
        .total_cmp(&a.estimated_profit_usd)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}
