use chrono::{DateTime, SecondsFormat, Utc};
use eyre::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::domain::{StrategyStats, TradeResult};

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection, since every new
    /// connection to `sqlite::memory:` opens a fresh empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                opportunity_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                transaction_hash TEXT,
                profit REAL,
                profit_usd REAL,
                gas_used INTEGER,
                execution_time_ms INTEGER NOT NULL,
                error TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trade_results_timestamp
                ON trade_results (timestamp);

            CREATE TABLE IF NOT EXISTS strategy_stats (
                strategy_id TEXT PRIMARY KEY,
                total_trades INTEGER NOT NULL,
                profitable_trades INTEGER NOT NULL,
                total_profit_usd REAL NOT NULL,
                average_execution_time_ms REAL NOT NULL,
                last_executed TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- Trade results ---

    pub async fn insert_trade_result(&self, result: &TradeResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO trade_results (strategy_id, opportunity_id, success, transaction_hash, profit, profit_usd, gas_used, execution_time_ms, error, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.strategy_id)
        .bind(&result.opportunity_id)
        .bind(result.success)
        .bind(&result.transaction_hash)
        .bind(result.profit)
        .bind(result.profit_usd)
        .bind(result.gas_used.map(|g| g as i64))
        .bind(result.execution_time_ms as i64)
        .bind(&result.error)
        .bind(ts(result.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent results, returned oldest first.
    pub async fn recent_trade_results(&self, limit: i64) -> Result<Vec<TradeResult>> {
        let rows = sqlx::query_as::<_, TradeResultRow>(
            "SELECT strategy_id, opportunity_id, success, transaction_hash, profit, profit_usd, gas_used, execution_time_ms, error, timestamp
             FROM trade_results ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().rev().map(|r| r.into()).collect())
    }

    /// Results stamped at or after `since`, oldest first.
    pub async fn trade_results_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeResult>> {
        let rows = sqlx::query_as::<_, TradeResultRow>(
            "SELECT strategy_id, opportunity_id, success, transaction_hash, profit, profit_usd, gas_used, execution_time_ms, error, timestamp
             FROM trade_results WHERE timestamp >= ? ORDER BY id ASC",
        )
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    /// Opportunity ids of the most recent results, oldest first.
    pub async fn recent_opportunity_ids(&self, limit: i64) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT opportunity_id FROM trade_results ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().rev().map(|(id,)| id).collect())
    }

    // --- Strategy stats ---

    pub async fn upsert_strategy_stats(&self, strategy_id: &str, stats: &StrategyStats) -> Result<()> {
        sqlx::query(
            "INSERT INTO strategy_stats (strategy_id, total_trades, profitable_trades, total_profit_usd, average_execution_time_ms, last_executed)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(strategy_id) DO UPDATE SET
                total_trades = excluded.total_trades,
                profitable_trades = excluded.profitable_trades,
                total_profit_usd = excluded.total_profit_usd,
                average_execution_time_ms = excluded.average_execution_time_ms,
                last_executed = excluded.last_executed",
        )
        .bind(strategy_id)
        .bind(stats.total_trades as i64)
        .bind(stats.profitable_trades as i64)
        .bind(stats.total_profit_usd)
        .bind(stats.average_execution_time_ms)
        .bind(stats.last_executed.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_strategy_stats(&self) -> Result<Vec<(String, StrategyStats)>> {
        let rows = sqlx::query_as::<_, StrategyStatsRow>(
            "SELECT strategy_id, total_trades, profitable_trades, total_profit_usd, average_execution_time_ms, last_executed FROM strategy_stats",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

/// Fixed-width UTC timestamps, so text comparison in SQL orders them correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// --- Row types for sqlx ---

#[derive(sqlx::FromRow)]
struct TradeResultRow {
    strategy_id: String,
    opportunity_id: String,
    success: bool,
    transaction_hash: Option<String>,
    profit: Option<f64>,
    profit_usd: Option<f64>,
    gas_used: Option<i64>,
    execution_time_ms: i64,
    error: Option<String>,
    timestamp: String,
}

impl From<TradeResultRow> for TradeResult {
    fn from(r: TradeResultRow) -> Self {
        TradeResult {
            strategy_id: r.strategy_id,
            opportunity_id: r.opportunity_id,
            success: r.success,
            transaction_hash: r.transaction_hash,
            profit: r.profit,
            profit_usd: r.profit_usd,
            gas_used: r.gas_used.map(|g| g.max(0) as u64),
            execution_time_ms: r.execution_time_ms.max(0) as u64,
            error: r.error,
            timestamp: parse_ts(&r.timestamp).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StrategyStatsRow {
    strategy_id: String,
    total_trades: i64,
    profitable_trades: i64,
    total_profit_usd: f64,
    average_execution_time_ms: f64,
    last_executed: Option<String>,
}

impl From<StrategyStatsRow> for (String, StrategyStats) {
    fn from(r: StrategyStatsRow) -> Self {
        let mut stats = StrategyStats {
            success_rate: 0.0,
            total_trades: r.total_trades.max(0) as u64,
            profitable_trades: r.profitable_trades.max(0) as u64,
            total_profit_usd: r.total_profit_usd,
            average_execution_time_ms: r.average_execution_time_ms,
            last_executed: r.last_executed.as_deref().and_then(parse_ts),
        };
        stats.recompute_success_rate();
        (r.strategy_id, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::result;

    #[tokio::test]
    async fn test_trade_results_round_trip_in_order() {
        let db = Database::in_memory().await.unwrap();
        for profit in [10.0, -4.0, 7.5] {
            db.insert_trade_result(&result("xdex", profit > 0.0, profit)).await.unwrap();
        }

        let recent = db.recent_trade_results(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].profit_usd, Some(-4.0));
        assert_eq!(recent[1].profit_usd, Some(7.5));
        assert!(recent[1].success);
    }

    #[tokio::test]
    async fn test_results_since_and_opportunity_ids() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        for (i, age_hours) in [30, 2, 0].into_iter().enumerate() {
            let mut r = result("xdex", true, 1.0 + i as f64);
            r.opportunity_id = format!("opp-{}", i);
            r.timestamp = now - chrono::Duration::hours(age_hours);
            db.insert_trade_result(&r).await.unwrap();
        }

        let since = db
            .trade_results_since(now - chrono::Duration::hours(3))
            .await
            .unwrap();
        let ids: Vec<&str> = since.iter().map(|r| r.opportunity_id.as_str()).collect();
        assert_eq!(ids, vec!["opp-1", "opp-2"]);

        assert_eq!(
            db.recent_opportunity_ids(2).await.unwrap(),
            vec!["opp-1".to_string(), "opp-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_strategy_stats_upsert_overwrites() {
        let db = Database::in_memory().await.unwrap();
        let mut stats = StrategyStats::default();
        stats.fold(&result("xdex", true, 10.0));
        db.upsert_strategy_stats("xdex", &stats).await.unwrap();
        stats.fold(&result("xdex", false, -2.0));
        db.upsert_strategy_stats("xdex", &stats).await.unwrap();

        let loaded = db.load_strategy_stats().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let (id, restored) = &loaded[0];
        assert_eq!(id, "xdex");
        assert_eq!(restored.total_trades, 2);
        assert_eq!(restored.profitable_trades, 1);
        assert!((restored.success_rate - 0.5).abs() < 1e-12);
        assert!(restored.last_executed.is_some());
    }
}
