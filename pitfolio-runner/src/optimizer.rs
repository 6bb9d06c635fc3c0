//! Portfolio construction contract and reference optimizers.
//!
//! The orchestrator hands an optimizer the trailing returns of the selected
//! assets and receives long-only weights. Anything that can produce weights
//! from returns (mean-variance, risk parity, an external solver) plugs in
//! through [`PortfolioOptimizer`].

use std::collections::BTreeMap;

use chrono::NaiveDate;
use thiserror::Error;

use pitfolio_core::domain::{AssetId, HistoryTable, WeightError, ZERO_WEIGHT_EPSILON};

use crate::config::{OptimizerKind, OptimizerSection};

pub type Weights = BTreeMap<AssetId, f64>;

/// Volatility floor so a flat series cannot produce an infinite weight.
const VOL_FLOOR: f64 = 1e-8;

const MAX_WATER_FILL_ROUNDS: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    #[error("no assets to allocate")]
    EmptyUniverse,

    #[error("max_weight {max_weight} cannot be met with {assets} assets")]
    InfeasibleMaxWeight { max_weight: f64, assets: usize },

    #[error("asset '{asset}' has {observations} valid returns in the window, need at least 2")]
    InsufficientData { asset: AssetId, observations: usize },
}

/// Why a set of weights could not become a portfolio.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstructionError {
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error("invalid weights: {0}")]
    Weights(#[from] WeightError),

    #[error("optimizer returned weight for unselected asset '{0}'")]
    UnknownAsset(AssetId),
}

/// Trailing returns of the selected assets, ending at the check date.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnWindow {
    pub check_date: NaiveDate,
    pub dates: Vec<NaiveDate>,
    /// Asset → returns aligned with `dates`; NaN where missing.
    pub returns: BTreeMap<AssetId, Vec<f64>>,
}

impl ReturnWindow {
    /// Slice the last `rows` rows dated on or before `check_date`.
    /// Assets absent from the table get an all-missing column.
    pub fn from_table(returns: &HistoryTable, assets: &[AssetId], check_date: NaiveDate, rows: usize) -> Self {
        let end = returns.rows_through(check_date);
        let start = end.saturating_sub(rows);
        let columns = assets
            .iter()
            .map(|asset| {
                let values = match returns.column(asset) {
                    Some(col) => col[start..end].to_vec(),
                    None => vec![f64::NAN; end - start],
                };
                (asset.clone(), values)
            })
            .collect();
        Self {
            check_date,
            dates: returns.dates()[start..end].to_vec(),
            returns: columns,
        }
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetId> {
        self.returns.keys()
    }

    pub fn asset_count(&self) -> usize {
        self.returns.len()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Sample standard deviation of the valid returns of `asset`.
    pub fn volatility(&self, asset: &str) -> Result<f64, OptimizerError> {
        let values: Vec<f64> = self
            .returns
            .get(asset)
            .map(|col| col.iter().copied().filter(|v| !v.is_nan()).collect())
            .unwrap_or_default();
        if values.len() < 2 {
            return Err(OptimizerError::InsufficientData {
                asset: asset.to_string(),
                observations: values.len(),
            });
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Ok(var.sqrt())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightConstraints {
    /// Per-asset upper bound.
    pub max_weight: Option<f64>,
}

/// Long-only weights from a window of returns.
///
/// Implementations must be deterministic: identical inputs, identical
/// weights. Returned weights must be finite, non-negative, sum to 1 and
/// cover only assets in the window.
pub trait PortfolioOptimizer: Send + Sync {
    fn name(&self) -> &str;

    fn construct(&self, window: &ReturnWindow, constraints: &WeightConstraints) -> Result<Weights, OptimizerError>;
}

/// 1/N across the window's assets.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualWeight;

impl PortfolioOptimizer for EqualWeight {
    fn name(&self) -> &str {
        "equal_weight"
    }

    fn construct(&self, window: &ReturnWindow, constraints: &WeightConstraints) -> Result<Weights, OptimizerError> {
        let raw = window.assets().map(|a| (a.clone(), 1.0)).collect();
        water_fill(raw, constraints.max_weight)
    }
}

/// Weights proportional to 1/σ over the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct InverseVolatility;

impl PortfolioOptimizer for InverseVolatility {
    fn name(&self) -> &str {
        "inverse_volatility"
    }

    fn construct(&self, window: &ReturnWindow, constraints: &WeightConstraints) -> Result<Weights, OptimizerError> {
        let mut raw = Weights::new();
        for asset in window.assets() {
            let vol = window.volatility(asset)?.max(VOL_FLOOR);
            raw.insert(asset.clone(), 1.0 / vol);
        }
        water_fill(raw, constraints.max_weight)
    }
}

/// Build the optimizer named in configuration.
pub fn from_config(section: &OptimizerSection) -> Box<dyn PortfolioOptimizer> {
    match section.kind {
        OptimizerKind::EqualWeight => Box::new(EqualWeight),
        OptimizerKind::InverseVolatility => Box::new(InverseVolatility),
    }
}

/// Normalize `raw` to sum to 1, then cap every weight at `max_weight` and
/// hand the excess to uncapped assets in proportion to their raw weight.
pub fn water_fill(raw: Weights, max_weight: Option<f64>) -> Result<Weights, OptimizerError> {
    if raw.is_empty() {
        return Err(OptimizerError::EmptyUniverse);
    }
    let total: f64 = raw.values().sum();
    let mut weights: Weights = raw.iter().map(|(a, w)| (a.clone(), w / total)).collect();

    let Some(cap) = max_weight else {
        return Ok(weights);
    };
    if cap * (raw.len() as f64) < 1.0 - ZERO_WEIGHT_EPSILON {
        return Err(OptimizerError::InfeasibleMaxWeight {
            max_weight: cap,
            assets: raw.len(),
        });
    }

    for _ in 0..MAX_WATER_FILL_ROUNDS {
        let capped: Vec<AssetId> = weights
            .iter()
            .filter(|(_, &w)| w >= cap - ZERO_WEIGHT_EPSILON)
            .map(|(a, _)| a.clone())
            .collect();
        let excess: f64 = weights.values().map(|w| (w - cap).max(0.0)).sum();
        if excess <= ZERO_WEIGHT_EPSILON {
            break;
        }
        let free_raw: f64 = raw
            .iter()
            .filter(|(a, _)| !capped.contains(a))
            .map(|(_, w)| w)
            .sum();
        let free_weight: f64 = weights
            .iter()
            .filter(|(a, _)| !capped.contains(a))
            .map(|(_, w)| w)
            .sum();
        for (asset, w) in weights.iter_mut() {
            if capped.contains(asset) {
                *w = cap;
            } else if free_raw > 0.0 {
                *w += excess * raw[asset] / free_raw;
            }
        }
        // Everything capped: spread evenly (only reachable when cap·n ≈ 1).
        if free_weight <= 0.0 {
            let n = weights.len() as f64;
            for w in weights.values_mut() {
                *w = 1.0 / n;
            }
            break;
        }
    }

    Ok(weights)
}
