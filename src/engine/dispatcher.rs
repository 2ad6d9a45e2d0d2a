use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::execution::BalanceSource;
use crate::config::Config;
use crate::domain::{Candidate, Opportunity, TradeResult};
use crate::engine::locks::{LockGuard, ResourceLockManager};
use crate::engine::performance::PerformanceTracker;
use crate::engine::registry::RegistryContext;
use crate::engine::risk::RiskGate;
use crate::error::{EngineError, EngineResult};
use crate::strategy::Strategy;

/// Outcome of one dispatch pass.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Opportunity ids handed to an execution task, in launch order.
    pub dispatched: Vec<String>,
    pub dropped: Vec<(String, EngineError)>,
    /// Candidates that hit a lock conflict at least once.
    pub deferred: usize,
}

impl DispatchReport {
    fn drop_candidate(&mut self, id: &str, err: EngineError) {
        match &err {
            EngineError::ThresholdNotMet(_) => debug!("Dropped {}: {}", id, err),
            _ => warn!("Dropped {}: {}", id, err),
        }
        self.dropped.push((id.to_string(), err));
    }

    pub fn dropped_with(&self, id: &str) -> Option<&EngineError> {
        self.dropped.iter().find(|(d, _)| d == id).map(|(_, e)| e)
    }
}

/// Ids that reached an execution. Entries never age out; past `capacity` the oldest
/// are evicted. Ids embed the snapshot session tag, so a later snapshot cannot
/// reproduce an evicted one.
struct ConsumedLedger {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ConsumedLedger {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// False when `id` was already consumed.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.ids.remove(&oldest);
                }
                None => break,
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Deferred {
    candidate: Candidate,
    strategy: Arc<dyn Strategy>,
    since: Instant,
}

/// Turns ranked candidates into executions: risk admission, resource locks, rate
/// and concurrency limits, then a spawned task per execution.
pub struct Dispatcher {
    registry: RegistryContext,
    risk: RiskGate,
    locks: ResourceLockManager,
    tracker: PerformanceTracker,
    balance: Arc<dyn BalanceSource>,
    limiter: Arc<DefaultDirectRateLimiter>,
    permits: Arc<Semaphore>,
    consumed: Mutex<ConsumedLedger>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    execution_timeout: Duration,
    lock_wait: Duration,
    lock_retry: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        registry: RegistryContext,
        risk: RiskGate,
        locks: ResourceLockManager,
        tracker: PerformanceTracker,
        balance: Arc<dyn BalanceSource>,
    ) -> Self {
        let per_second =
            NonZeroU32::new(config.trading.max_trades_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            registry,
            risk,
            locks,
            tracker,
            balance,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            permits: Arc::new(Semaphore::new(config.engine.max_concurrent_executions.max(1))),
            consumed: Mutex::new(ConsumedLedger::new(config.engine.consumed_capacity)),
            in_flight: Mutex::new(Vec::new()),
            execution_timeout: config.engine.execution_timeout(),
            lock_wait: config.engine.lock_wait(),
            lock_retry: config.engine.lock_retry(),
        }
    }

    /// Processes candidates in the given (ranked) order. Returns once every candidate
    /// was launched or dropped; launched executions keep running in the background.
    pub async fn dispatch(&self, candidates: Vec<Candidate>) -> DispatchReport {
        let mut report = DispatchReport::default();

        let mut available = match self.balance.balance_eth().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Balance unavailable, admitting nothing that needs capital: {:?}", e);
                0.0
            }
        };

        let mut deferred = Vec::new();
        for candidate in candidates {
            let strategy = match self.admit(&candidate, available).await {
                Ok(s) => s,
                Err(e) => {
                    report.drop_candidate(candidate.id(), e);
                    continue;
                }
            };
            match self.locks.try_acquire(&candidate.opportunity) {
                Some(guard) => {
                    if self.launch(candidate.clone(), strategy, guard, &mut report).await {
                        available -= candidate.opportunity.position_size_eth;
                    }
                }
                None => {
                    debug!("Deferring {}: resources busy", candidate.id());
                    report.deferred += 1;
                    deferred.push(Deferred {
                        candidate,
                        strategy,
                        since: Instant::now(),
                    });
                }
            }
        }

        while !deferred.is_empty() {
            self.locks.wait_for_release(self.lock_retry).await;
            let now = Utc::now();
            let mut waiting = Vec::with_capacity(deferred.len());

            for d in deferred {
                let id = d.candidate.id().to_string();
                if d.candidate.opportunity.is_expired(now) {
                    report.drop_candidate(&id, EngineError::OpportunityExpired(id.clone()));
                } else if d.since.elapsed() >= self.lock_wait {
                    report.drop_candidate(&id, EngineError::LockTimeout(id.clone()));
                } else if let Err(e) = self.risk.check_capital(&d.candidate.opportunity, available) {
                    // Capital went to candidates launched while this one waited.
                    report.drop_candidate(&id, e);
                } else if let Some(guard) = self.locks.try_acquire(&d.candidate.opportunity) {
                    let size = d.candidate.opportunity.position_size_eth;
                    if self.launch(d.candidate, d.strategy, guard, &mut report).await {
                        available -= size;
                    }
                } else {
                    waiting.push(d);
                }
            }
            deferred = waiting;
        }

        report
    }

    async fn admit(&self, candidate: &Candidate, available: f64) -> EngineResult<Arc<dyn Strategy>> {
        if self.is_consumed(candidate.id()) {
            return Err(EngineError::AlreadyConsumed(candidate.id().to_string()));
        }
        let registry = self.registry.read().await;
        let entry = registry
            .get(&candidate.opportunity.strategy_id)
            .ok_or_else(|| EngineError::UnknownStrategy(candidate.opportunity.strategy_id.clone()))?;
        if !entry.enabled {
            return Err(EngineError::InvalidOpportunity(format!(
                "strategy {} is disabled",
                entry.id()
            )));
        }
        self.risk.admit(candidate, entry, available, Utc::now())?;
        Ok(Arc::clone(&entry.strategy))
    }

    /// Waits for a rate token and an execution slot, re-checks expiry and halt, marks
    /// the id consumed and spawns the execution. Returns whether it was launched.
    async fn launch(
        &self,
        candidate: Candidate,
        strategy: Arc<dyn Strategy>,
        guard: LockGuard,
        report: &mut DispatchReport,
    ) -> bool {
        let id = candidate.id().to_string();
        self.limiter.until_ready().await;
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                report.drop_candidate(&id, EngineError::CapacityExceeded { limit: 0 });
                return false;
            }
        };

        if self.risk.is_halted() {
            let reason = self.risk.halt_reason().unwrap_or_default();
            report.drop_candidate(&id, EngineError::RiskLimitBreached(reason));
            return false;
        }
        if candidate.opportunity.is_expired(Utc::now()) {
            report.drop_candidate(&id, EngineError::OpportunityExpired(id.clone()));
            return false;
        }
        if !self.mark_consumed(&candidate.opportunity) {
            report.drop_candidate(&id, EngineError::AlreadyConsumed(id.clone()));
            return false;
        }

        info!(
            "Dispatching {} ({}, ${:.2}, confidence {:.2})",
            id,
            candidate.opportunity.strategy_id,
            candidate.opportunity.estimated_profit_usd,
            candidate.opportunity.confidence
        );

        let opportunity = Arc::clone(&candidate.opportunity);
        let risk = self.risk.clone();
        let tracker = self.tracker.clone();
        let timeout = self.execution_timeout;
        let handle = tokio::spawn(async move {
            let result = execute_with_timeout(strategy.as_ref(), &opportunity, timeout).await;
            // Locks and the slot go back before bookkeeping.
            drop(guard);
            drop(permit);

            if result.success {
                info!(
                    "Executed {}: {:+.2} USD in {}ms",
                    result.opportunity_id,
                    result.pnl_usd(),
                    result.execution_time_ms
                );
            } else {
                warn!(
                    "Execution of {} failed: {}",
                    result.opportunity_id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            risk.record_result(&result, Utc::now());
            tracker.record(result).await;
        });

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
        report.dispatched.push(id);
        true
    }

    /// Awaits every execution launched so far.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Execution task ended abnormally: {:?}", e);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Marks ids executed before a restart as consumed. Returns how many were new.
    pub fn seed_consumed<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut consumed = self.consumed.lock().unwrap_or_else(|e| e.into_inner());
        let added = ids.into_iter().filter(|id| consumed.insert(id)).count();
        debug!("Consumed ledger seeded with {} ids ({} held)", added, consumed.len());
        added
    }

    fn is_consumed(&self, id: &str) -> bool {
        self.consumed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    fn mark_consumed(&self, opportunity: &Opportunity) -> bool {
        self.consumed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&opportunity.id)
    }
}

async fn execute_with_timeout(
    strategy: &dyn Strategy,
    opportunity: &Opportunity,
    timeout: Duration,
) -> TradeResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, strategy.execute(opportunity)).await {
        Ok(result) => result,
        Err(_) => {
            let ms = timeout.as_millis() as u64;
            TradeResult::failed(
                opportunity,
                &EngineError::ExecutionTimeout(ms),
                started.elapsed().as_millis() as u64,
            )
        }
    }
}
