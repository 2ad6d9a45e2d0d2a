use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::{Candidate, Opportunity, TradeResult};
use crate::engine::registry::StrategyEntry;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltCause {
    DailyLoss,
    StopLoss,
    Manual,
}

#[derive(Debug)]
struct DailyLedger {
    /// Start of the current trading day.
    day_start: DateTime<Utc>,
    realized_eth: f64,
    opening_balance: Option<f64>,
    halt: Option<(HaltCause, String)>,
}

/// Admission control. Per-candidate checks always run; portfolio checks (daily loss,
/// stop loss, position size) only when risk limits are enabled.
#[derive(Clone)]
pub struct RiskGate {
    config: Arc<Config>,
    ledger: Arc<Mutex<DailyLedger>>,
    halted: Arc<AtomicBool>,
}

impl RiskGate {
    pub fn new(config: Arc<Config>) -> Self {
        let day_start = day_start(Utc::now(), config.engine.daily_reset_hour_utc);
        Self {
            config,
            ledger: Arc::new(Mutex::new(DailyLedger {
                day_start,
                realized_eth: 0.0,
                opening_balance: None,
                halt: None,
            })),
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, DailyLedger> {
        // A panic while holding the lock cannot leave the ledger half-written.
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rolls the ledger over at the daily boundary. Daily-loss and stop-loss halts
    /// clear at the reset; a manual halt does not.
    fn roll(&self, ledger: &mut DailyLedger, now: DateTime<Utc>) {
        let today = day_start(now, self.config.engine.daily_reset_hour_utc);
        if today <= ledger.day_start {
            return;
        }
        info!(
            "Daily risk reset: realized {:+.4} ETH on the previous day",
            ledger.realized_eth
        );
        ledger.day_start = today;
        ledger.realized_eth = 0.0;
        ledger.opening_balance = None;
        if matches!(ledger.halt, Some((HaltCause::DailyLoss | HaltCause::StopLoss, _))) {
            ledger.halt = None;
            self.halted.store(false, Ordering::SeqCst);
            warn!("Trading resumed by daily reset");
        }
    }

    fn engage(&self, ledger: &mut DailyLedger, cause: HaltCause, reason: String) {
        error!("KILL SWITCH: {}. HALTING ALL TRADING.", reason);
        ledger.halt = Some((cause, reason));
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Checks one candidate against its strategy's thresholds and the portfolio limits.
    pub fn admit(
        &self,
        candidate: &Candidate,
        strategy: &StrategyEntry,
        balance_eth: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let opp = &candidate.opportunity;
        let trading = &self.config.trading;

        // Loss halts are only ever engaged with limits on; a manual halt always applies.
        {
            let mut ledger = self.ledger();
            self.roll(&mut ledger, now);
            if let Some((_, reason)) = &ledger.halt {
                return Err(EngineError::RiskLimitBreached(format!("trading halted: {}", reason)));
            }
        }

        if opp.is_expired(now) {
            return Err(EngineError::OpportunityExpired(opp.id.clone()));
        }
        let floor = strategy.min_profit_usd.max(trading.min_profit_threshold_usd);
        if opp.estimated_profit_usd < floor {
            return Err(EngineError::ThresholdNotMet(format!(
                "{} profit ${:.2} below ${:.2}",
                opp.id, opp.estimated_profit_usd, floor
            )));
        }
        let gas_cap = strategy.max_gas_price_gwei.min(trading.max_gas_price_gwei);
        if opp.gas_price_gwei > gas_cap {
            return Err(EngineError::ThresholdNotMet(format!(
                "{} gas {:.1} gwei above {:.1} gwei",
                opp.id, opp.gas_price_gwei, gas_cap
            )));
        }
        if self.config.ai.enable_optimization {
            if opp.confidence < self.config.ai.confidence_threshold {
                return Err(EngineError::ThresholdNotMet(format!(
                    "{} confidence {:.2} below {:.2}",
                    opp.id, opp.confidence, self.config.ai.confidence_threshold
                )));
            }
            if let Some(decision) = candidate.decision.as_ref().filter(|d| !d.should_execute) {
                return Err(EngineError::ThresholdNotMet(format!(
                    "{} vetoed by overlay: {}",
                    opp.id, decision.reasoning
                )));
            }
        }
        if let Some(plan) = opp.flash_loan() {
            if !trading.enable_flash_loans {
                return Err(EngineError::ThresholdNotMet(format!(
                    "{} needs a flash loan but flash loans are disabled",
                    opp.id
                )));
            }
            if plan.loan_amount > trading.flash_loan_amount_eth {
                return Err(EngineError::ThresholdNotMet(format!(
                    "{} loan {:.2} ETH above cap {:.2} ETH",
                    opp.id, plan.loan_amount, trading.flash_loan_amount_eth
                )));
            }
        }

        if self.config.risk.enable_risk_limits {
            let max_position = self.config.risk.max_position_size_eth;
            if opp.position_size_eth > max_position {
                return Err(EngineError::RiskLimitBreached(format!(
                    "{} position {:.4} ETH exceeds max {:.4} ETH",
                    opp.id, opp.position_size_eth, max_position
                )));
            }
        }
        self.check_capital(opp, balance_eth)
    }

    /// Whether `opp` still fits in the capital left for this dispatch pass. Only
    /// enforced with risk limits on.
    pub fn check_capital(&self, opp: &Opportunity, available_eth: f64) -> EngineResult<()> {
        if self.config.risk.enable_risk_limits && opp.position_size_eth > available_eth {
            return Err(EngineError::RiskLimitBreached(format!(
                "{} position {:.4} ETH exceeds available balance {:.4} ETH",
                opp.id, opp.position_size_eth, available_eth
            )));
        }
        Ok(())
    }

    /// Adds a realized result to today's P&L and halts once the loss limit is reached.
    pub fn record_result(&self, result: &TradeResult, now: DateTime<Utc>) {
        let profit = match result.profit {
            Some(p) if p.is_finite() => p,
            _ => return,
        };
        let mut ledger = self.ledger();
        self.roll(&mut ledger, now);
        ledger.realized_eth += profit;

        if !self.config.risk.enable_risk_limits || ledger.halt.is_some() {
            return;
        }
        let loss = -ledger.realized_eth;
        let limit = self.config.risk.max_daily_loss_eth;
        if loss >= limit {
            let reason = format!("daily loss {:.4} ETH reached limit {:.4} ETH", loss, limit);
            self.engage(&mut ledger, HaltCause::DailyLoss, reason);
        }
    }

    /// Re-applies persisted results that fall in the current trading day, so a restart
    /// does not reset the daily loss. Returns how many results were counted.
    pub fn replay(&self, results: &[TradeResult], now: DateTime<Utc>) -> usize {
        let today = day_start(now, self.config.engine.daily_reset_hour_utc);
        let mut counted = 0;
        for result in results.iter().filter(|r| r.timestamp >= today) {
            self.record_result(result, now);
            counted += 1;
        }
        if counted > 0 {
            info!(
                "Replayed {} results from today: realized {:+.4} ETH",
                counted,
                self.realized_today()
            );
        }
        counted
    }

    /// Start of the trading day containing `now`.
    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        day_start(now, self.config.engine.daily_reset_hour_utc)
    }

    /// Feeds the latest wallet balance; halts when it falls more than the stop-loss
    /// percentage below the day's opening balance.
    pub fn observe_balance(&self, balance_eth: f64, now: DateTime<Utc>) -> bool {
        let mut ledger = self.ledger();
        self.roll(&mut ledger, now);
        let opening = *ledger.opening_balance.get_or_insert(balance_eth);

        if !self.config.risk.enable_risk_limits || ledger.halt.is_some() || opening <= 0.0 {
            return ledger.halt.is_none();
        }
        let drawdown_pct = (opening - balance_eth) / opening * 100.0;
        if drawdown_pct > self.config.risk.stop_loss_percent {
            let reason = format!(
                "balance {:.4} ETH is {:.1}% below opening {:.4} ETH (stop loss {:.1}%)",
                balance_eth, drawdown_pct, opening, self.config.risk.stop_loss_percent
            );
            self.engage(&mut ledger, HaltCause::StopLoss, reason);
            return false;
        }
        true
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.ledger().halt.as_ref().map(|(_, reason)| reason.clone())
    }

    pub fn realized_today(&self) -> f64 {
        self.ledger().realized_eth
    }

    /// Manual kill switch. Survives the daily reset; only `resume` clears it.
    pub fn kill(&self, reason: &str) {
        let mut ledger = self.ledger();
        self.engage(&mut ledger, HaltCause::Manual, format!("manual halt: {}", reason));
    }

    /// Clears any halt. The day's realized P&L is kept, so a further loss halts again.
    pub fn resume(&self) {
        let mut ledger = self.ledger();
        ledger.halt = None;
        self.halted.store(false, Ordering::SeqCst);
        warn!("Trading resumed manually");
    }
}

/// Most recent reset boundary at or before `now`.
fn day_start(now: DateTime<Utc>, reset_hour: u32) -> DateTime<Utc> {
    let reset = NaiveTime::from_hms_opt(reset_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let candidate = now.date_naive().and_time(reset).and_utc();
    if candidate <= now {
        candidate
    } else {
        candidate - Duration::days(1)
    }
}
