//! Pitfolio Runner — drives point-in-time rebalancing over a history table.
//!
//! This crate builds on `pitfolio-core` to provide:
//! - TOML configuration with validation
//! - Rebalance schedules (daily, weekly, monthly, quarterly)
//! - Wide CSV data loading
//! - A two-tier deterministic cache (LRU memory + JSON files) with single-flight
//! - Portfolio construction (equal weight, inverse volatility)
//! - The stepwise rebalance orchestrator and batch runs
//! - JSON/CSV report export

pub mod batch;
pub mod cache;
pub mod config;
pub mod data_loader;
pub mod export;
pub mod optimizer;
pub mod orchestrator;
pub mod schedule;

pub use batch::{BatchJob, BatchOutcome, BatchRunner};
pub use cache::{CacheError, CacheOptions, CacheStats, RebalanceCache};
pub use config::{ConfigError, FailurePolicy, RebalanceConfig, ValidatedConfig};
pub use data_loader::{load_wide_csv, read_wide_csv, save_wide_csv, write_wide_csv, LoadError};
pub use export::{report_from_json, report_to_json, write_report, REPORT_SCHEMA_VERSION};
pub use optimizer::{ConstructionError, OptimizerError, PortfolioOptimizer};
pub use orchestrator::{run_rebalancing, Orchestrator, RebalanceEvent, RunError, RunReport};
pub use schedule::{Frequency, RebalanceSchedule};
