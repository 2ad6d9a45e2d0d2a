use thiserror::Error;

use crate::domain::RiskLevel;

/// Errors raised inside the scheduling core. Most of them are local: the scheduler
/// logs them and moves on to the next candidate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("opportunity {0} expired")]
    OpportunityExpired(String),

    #[error("risk limit breached: {0}")]
    RiskLimitBreached(String),

    #[error("threshold not met: {0}")]
    ThresholdNotMet(String),

    #[error("capacity exceeded: at most {limit} active strategies")]
    CapacityExceeded { limit: usize },

    #[error("risk level {0} is disabled")]
    RiskLevelDisabled(RiskLevel),

    #[error("resource locks for {0} not acquired in time")]
    LockTimeout(String),

    #[error("execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("execution reverted: {0}")]
    ExecutionReverted(String),

    #[error("malformed market data: {0}")]
    MalformedMarketData(String),

    #[error("invalid opportunity: {0}")]
    InvalidOpportunity(String),

    #[error("invalid strategy config: {0}")]
    InvalidStrategyConfig(String),

    #[error("unknown strategy {0}")]
    UnknownStrategy(String),

    #[error("strategy {0} already registered")]
    DuplicateStrategy(String),

    #[error("opportunity {0} already consumed")]
    AlreadyConsumed(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
