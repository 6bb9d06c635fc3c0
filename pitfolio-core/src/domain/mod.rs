//! Domain types for Pitfolio

pub mod ids;
pub mod portfolio;
pub mod table;

pub use ids::{AssetId, DatasetHash, Fingerprint};
pub use portfolio::{PortfolioState, WeightError, WEIGHT_SUM_TOLERANCE, ZERO_WEIGHT_EPSILON};
pub use table::{HistoryTable, PrefixHashes, SeriesKind, TableError};
