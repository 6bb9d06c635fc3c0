//! Factor scoring and top-K preselection.
//!
//! Scores are computed on simple returns from rows dated on or before the
//! check date. Ranking is descending by score with ascending asset id as the
//! tie-break, so the shortlist never depends on iteration order.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AssetId, HistoryTable, SeriesKind};
use crate::eligibility::EligibilityResult;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreselectionError {
    #[error("top_k must be at least 1")]
    ZeroTopK,

    #[error("lookback must be at least 1")]
    ZeroLookback,

    #[error("factor weights must be finite and non-negative with a positive sum (momentum={momentum_weight}, low_vol={low_vol_weight})")]
    InvalidWeights {
        momentum_weight: f64,
        low_vol_weight: f64,
    },
}

/// Scoring method, tagged by `method` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FactorMethod {
    /// Cumulative return over the lookback window, skipping the most recent rows.
    Momentum,
    /// Negative realized volatility over the lookback window.
    LowVolatility,
    /// Weighted sum of cross-sectionally z-scored momentum and low-volatility.
    Combined {
        momentum_weight: f64,
        low_vol_weight: f64,
    },
}

impl FactorMethod {
    pub fn kind(&self) -> FactorKind {
        match self {
            FactorMethod::Momentum => FactorKind::Momentum,
            FactorMethod::LowVolatility => FactorKind::LowVolatility,
            FactorMethod::Combined { .. } => FactorKind::Combined,
        }
    }

    pub fn validate(&self) -> Result<(), PreselectionError> {
        if let FactorMethod::Combined {
            momentum_weight,
            low_vol_weight,
        } = *self
        {
            let ok = momentum_weight.is_finite()
                && low_vol_weight.is_finite()
                && momentum_weight >= 0.0
                && low_vol_weight >= 0.0
                && momentum_weight + low_vol_weight > 0.0;
            if !ok {
                return Err(PreselectionError::InvalidWeights {
                    momentum_weight,
                    low_vol_weight,
                });
            }
        }
        Ok(())
    }
}

/// Which factor produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Momentum,
    LowVolatility,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreselectionParams {
    #[serde(flatten)]
    pub method: FactorMethod,
    pub top_k: usize,
    /// Window length in rows.
    pub lookback: usize,
    /// Most recent rows excluded from the momentum window.
    #[serde(default)]
    pub skip: usize,
    /// Minimum valid returns inside the window for an asset to be scored.
    pub min_periods: usize,
}

impl PreselectionParams {
    pub fn validate(&self) -> Result<(), PreselectionError> {
        if self.top_k == 0 {
            return Err(PreselectionError::ZeroTopK);
        }
        if self.lookback == 0 {
            return Err(PreselectionError::ZeroLookback);
        }
        self.method.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub asset: AssetId,
    pub score: f64,
    pub kind: FactorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedAsset {
    pub asset: AssetId,
    pub score: f64,
    /// 1-based position in the ranking.
    pub rank: usize,
}

/// Ordered top-K selection for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortlist {
    pub check_date: NaiveDate,
    pub entries: Vec<RankedAsset>,
}

impl Shortlist {
    pub fn assets(&self) -> impl Iterator<Item = &AssetId> {
        self.entries.iter().map(|e| &e.asset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.entries.iter().any(|e| e.asset == asset)
    }
}

/// Full ranking of every scored asset plus its top-K shortlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preselection {
    pub check_date: NaiveDate,
    pub kind: FactorKind,
    pub top_k: usize,
    pub ranking: Vec<RankedAsset>,
    pub shortlist: Shortlist,
}

impl Preselection {
    /// Rank lookup, `None` for assets that were not scored.
    pub fn ranks(&self) -> BTreeMap<AssetId, usize> {
        self.ranking
            .iter()
            .map(|r| (r.asset.clone(), r.rank))
            .collect()
    }

    pub fn rank_of(&self, asset: &str) -> Option<usize> {
        self.ranking.iter().find(|r| r.asset == asset).map(|r| r.rank)
    }
}

/// Descending by score, ascending by asset id on ties. Non-finite scores
/// are dropped.
pub fn rank(scores: Vec<FactorScore>) -> Vec<RankedAsset> {
    let mut scores: Vec<FactorScore> = scores.into_iter().filter(|s| s.score.is_finite()).collect();
    scores.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.asset.cmp(&b.asset),
        other => other,
    });
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| RankedAsset {
            asset: s.asset,
            score: s.score,
            rank: i + 1,
        })
        .collect()
}

/// Valid (non-NaN) values of `column[start..end]`.
fn window(column: &[f64], start: usize, end: usize) -> Vec<f64> {
    column[start..end].iter().copied().filter(|v| !v.is_nan()).collect()
}

/// Cumulative return over `lookback` rows ending `skip` rows before row `rows`.
pub fn momentum_score(column: &[f64], rows: usize, lookback: usize, skip: usize, min_periods: usize) -> Option<f64> {
    let end = rows.saturating_sub(skip);
    let start = end.saturating_sub(lookback);
    let valid = window(column, start, end);
    if valid.is_empty() || valid.len() < min_periods {
        return None;
    }
    Some(valid.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0)
}

/// Negative sample standard deviation of the last `lookback` rows.
pub fn low_volatility_score(column: &[f64], rows: usize, lookback: usize, min_periods: usize) -> Option<f64> {
    let start = rows.saturating_sub(lookback);
    let valid = window(column, start, rows);
    if valid.len() < min_periods.max(2) {
        return None;
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let var = valid.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(-var.sqrt())
}

/// Cross-sectional z-scores (population std). Zero spread maps to 0.
fn zscores(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std == 0.0 || !std.is_finite() {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - mean) / std).collect()
}

/// Score every eligible asset. Output is ascending by asset id.
pub fn score_assets(
    returns: &HistoryTable,
    eligibility: &EligibilityResult,
    check_date: NaiveDate,
    params: &PreselectionParams,
) -> Vec<FactorScore> {
    let rows = returns.rows_through(check_date);
    let universe: Vec<(&AssetId, &[f64])> = eligibility
        .eligible_assets()
        .filter_map(|a| returns.column(a).map(|c| (a, c)))
        .collect();

    let kind = params.method.kind();
    let per_asset: Vec<(AssetId, Option<f64>, Option<f64>)> = universe
        .par_iter()
        .map(|(asset, column)| {
            let mom = match params.method {
                FactorMethod::LowVolatility => None,
                _ => momentum_score(column, rows, params.lookback, params.skip, params.min_periods),
            };
            let vol = match params.method {
                FactorMethod::Momentum => None,
                _ => low_volatility_score(column, rows, params.lookback, params.min_periods),
            };
            ((*asset).clone(), mom, vol)
        })
        .collect();

    match params.method {
        FactorMethod::Momentum => per_asset
            .into_iter()
            .filter_map(|(asset, mom, _)| mom.map(|score| FactorScore { asset, score, kind }))
            .collect(),
        FactorMethod::LowVolatility => per_asset
            .into_iter()
            .filter_map(|(asset, _, vol)| vol.map(|score| FactorScore { asset, score, kind }))
            .collect(),
        FactorMethod::Combined {
            momentum_weight,
            low_vol_weight,
        } => {
            let both: Vec<(AssetId, f64, f64)> = per_asset
                .into_iter()
                .filter_map(|(asset, mom, vol)| Some((asset, mom?, vol?)))
                .collect();
            let zm = zscores(&both.iter().map(|b| b.1).collect::<Vec<_>>());
            let zv = zscores(&both.iter().map(|b| b.2).collect::<Vec<_>>());
            both.into_iter()
                .enumerate()
                .map(|(i, (asset, _, _))| FactorScore {
                    asset,
                    score: momentum_weight * zm[i] + low_vol_weight * zv[i],
                    kind,
                })
                .collect()
        }
    }
}

/// Rank eligible assets and take the top `top_k`.
///
/// Fewer than `top_k` qualifying assets yields a shorter shortlist; no
/// qualifying assets yields an empty one. Neither is an error.
pub fn select(
    table: &HistoryTable,
    eligibility: &EligibilityResult,
    check_date: NaiveDate,
    params: &PreselectionParams,
) -> Result<Preselection, PreselectionError> {
    params.validate()?;

    let returns: Cow<'_, HistoryTable> = match table.kind() {
        SeriesKind::Returns => Cow::Borrowed(table),
        SeriesKind::Prices => Cow::Owned(table.to_returns()),
    };

    let ranking = rank(score_assets(&returns, eligibility, check_date, params));
    let shortlist = Shortlist {
        check_date,
        entries: ranking.iter().take(params.top_k).cloned().collect(),
    };

    debug!(
        "preselection {check_date}: {} scored, {} shortlisted ({:?})",
        ranking.len(),
        shortlist.len(),
        params.method.kind()
    );

    Ok(Preselection {
        check_date,
        kind: params.method.kind(),
        top_k: params.top_k,
        ranking,
        shortlist,
    })
}
