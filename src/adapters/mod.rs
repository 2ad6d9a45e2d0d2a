pub mod binance;
pub mod chain;
pub mod database;
pub mod execution;
