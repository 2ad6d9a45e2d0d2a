pub mod adapters;
pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feeds;
pub mod strategy;
