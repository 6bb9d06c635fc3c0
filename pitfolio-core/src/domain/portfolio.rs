//! Portfolio state — weights plus holding-period counters after a rebalance.

use super::ids::AssetId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Tolerance on the sum of weights.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Weights at or below this are treated as zero and dropped.
pub const ZERO_WEIGHT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightError {
    #[error("weight for '{asset}' is not finite")]
    NonFinite { asset: AssetId },

    #[error("weight for '{asset}' is negative ({weight})")]
    Negative { asset: AssetId, weight: f64 },

    #[error("weights sum to {sum}, expected 1")]
    BadSum { sum: f64 },

    #[error("no non-zero weights")]
    Empty,
}

/// Holdings after a rebalance.
///
/// Invariant: weights are positive, finite and sum to 1 (within
/// [`WEIGHT_SUM_TOLERANCE`]); `holding_periods` has exactly the keys of
/// `weights`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortfolioState {
    /// Rebalance date that produced this state (`None` before the first one).
    pub date: Option<NaiveDate>,
    pub weights: BTreeMap<AssetId, f64>,
    /// Consecutive rebalances each asset has been held, including this one.
    pub holding_periods: BTreeMap<AssetId, u32>,
}

impl PortfolioState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the state following `previous` from optimizer weights.
    ///
    /// Zero weights are dropped. Counters of assets carried over from
    /// `previous` are incremented; new entrants start at 1.
    pub fn from_weights(
        date: NaiveDate,
        weights: &BTreeMap<AssetId, f64>,
        previous: &PortfolioState,
    ) -> Result<Self, WeightError> {
        for (asset, &w) in weights {
            if !w.is_finite() {
                return Err(WeightError::NonFinite {
                    asset: asset.clone(),
                });
            }
            if w < -ZERO_WEIGHT_EPSILON {
                return Err(WeightError::Negative {
                    asset: asset.clone(),
                    weight: w,
                });
            }
        }

        let kept: BTreeMap<AssetId, f64> = weights
            .iter()
            .filter(|(_, &w)| w > ZERO_WEIGHT_EPSILON)
            .map(|(a, &w)| (a.clone(), w))
            .collect();

        if kept.is_empty() {
            return Err(WeightError::Empty);
        }

        let sum: f64 = kept.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(WeightError::BadSum { sum });
        }

        let holding_periods = kept
            .keys()
            .map(|a| (a.clone(), previous.holding_periods(a) + 1))
            .collect();

        Ok(Self {
            date: Some(date),
            weights: kept,
            holding_periods,
        })
    }

    /// Same holdings, stamped with a new date and counters advanced by one.
    pub fn held_through(&self, date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            weights: self.weights.clone(),
            holding_periods: self
                .holding_periods
                .iter()
                .map(|(a, n)| (a.clone(), n + 1))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn holds(&self, asset: &str) -> bool {
        self.weights.contains_key(asset)
    }

    pub fn weight(&self, asset: &str) -> f64 {
        self.weights.get(asset).copied().unwrap_or(0.0)
    }

    /// Zero for assets not currently held.
    pub fn holding_periods(&self, asset: &str) -> u32 {
        self.holding_periods.get(asset).copied().unwrap_or(0)
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetId> {
        self.weights.keys()
    }

    /// One-way turnover against `previous`: ½·Σ|w_new − w_old|.
    pub fn turnover_from(&self, previous: &PortfolioState) -> f64 {
        let mut total = 0.0;
        for (asset, &w) in &self.weights {
            total += (w - previous.weight(asset)).abs();
        }
        for (asset, &w) in &previous.weights {
            if !self.weights.contains_key(asset) {
                total += w;
            }
        }
        total / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<AssetId, f64> {
        pairs.iter().map(|(a, w)| (a.to_string(), *w)).collect()
    }

    #[test]
    fn counters_increment_for_carried_assets() {
        let first =
            PortfolioState::from_weights(d("2024-01-31"), &weights(&[("A", 0.5), ("B", 0.5)]), &PortfolioState::empty())
                .unwrap();
        assert_eq!(first.holding_periods("A"), 1);

        let second =
            PortfolioState::from_weights(d("2024-02-29"), &weights(&[("A", 0.5), ("C", 0.5)]), &first).unwrap();
        assert_eq!(second.holding_periods("A"), 2);
        assert_eq!(second.holding_periods("C"), 1);
        assert_eq!(second.holding_periods("B"), 0);
    }

    #[test]
    fn counters_reset_on_reentry() {
        let s1 = PortfolioState::from_weights(d("2024-01-31"), &weights(&[("A", 1.0)]), &PortfolioState::empty())
            .unwrap();
        let s2 = PortfolioState::from_weights(d("2024-02-29"), &weights(&[("B", 1.0)]), &s1).unwrap();
        let s3 = PortfolioState::from_weights(d("2024-03-29"), &weights(&[("A", 1.0)]), &s2).unwrap();
        assert_eq!(s3.holding_periods("A"), 1);
    }

    #[test]
    fn zero_weights_are_dropped() {
        let s = PortfolioState::from_weights(
            d("2024-01-31"),
            &weights(&[("A", 1.0), ("B", 0.0)]),
            &PortfolioState::empty(),
        )
        .unwrap();
        assert!(!s.holds("B"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn rejects_invalid_weights() {
        let empty = PortfolioState::empty();
        let date = d("2024-01-31");
        assert!(matches!(
            PortfolioState::from_weights(date, &weights(&[("A", 1.2), ("B", -0.2)]), &empty),
            Err(WeightError::Negative { .. })
        ));
        assert!(matches!(
            PortfolioState::from_weights(date, &weights(&[("A", 0.4)]), &empty),
            Err(WeightError::BadSum { .. })
        ));
        assert!(matches!(
            PortfolioState::from_weights(date, &weights(&[("A", f64::NAN)]), &empty),
            Err(WeightError::NonFinite { .. })
        ));
    }

    #[test]
    fn turnover_counts_exits_and_entries() {
        let empty = PortfolioState::empty();
        let s1 = PortfolioState::from_weights(d("2024-01-31"), &weights(&[("A", 0.5), ("B", 0.5)]), &empty)
            .unwrap();
        let s2 = PortfolioState::from_weights(d("2024-02-29"), &weights(&[("A", 0.5), ("C", 0.5)]), &s1)
            .unwrap();
        assert!((s2.turnover_from(&s1) - 0.5).abs() < 1e-12);
        assert!((s1.turnover_from(&empty) - 0.5).abs() < 1e-12);
    }
}
