//! Point-in-time eligibility.
//!
//! An asset is eligible at a check date when its *cumulative* history up to
//! and including that date is long enough in calendar days and deep enough in
//! observations. Both thresholds are inclusive and independent.
//!
//! Nothing here reads rows after the check date, with one exception:
//! [`detect_delistings`] looks forward past an asset's last observation and
//! therefore needs a [`LookaheadPermit`], which only backtests can obtain.

use crate::domain::{AssetId, HistoryTable};
use chrono::{Duration, NaiveDate};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EligibilityError {
    #[error("delisting detection reads future data and is not available in live mode")]
    LookaheadInLiveMode,
}

/// Thresholds for history sufficiency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EligibilityCriteria {
    pub min_history_days: u32,
    pub min_price_rows: u32,
}

/// Per-asset history summary as of a check date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetHistoryRecord {
    pub first_observation_date: NaiveDate,
    pub last_observation_date: NaiveDate,
    /// Non-missing observations up to the check date.
    pub observation_count: u32,
    pub calendar_days_since_first: i64,
    /// `observation_count / calendar_days_since_first`; 1.0 for a zero span.
    pub coverage_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    NoData,
    InsufficientHistoryDays,
    InsufficientRows,
    BelowCoverage,
    Delisted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEligibility {
    pub eligible: bool,
    pub record: Option<AssetHistoryRecord>,
    pub reason: Option<IneligibleReason>,
}

impl AssetEligibility {
    fn rejected(record: Option<AssetHistoryRecord>, reason: IneligibleReason) -> Self {
        Self {
            eligible: false,
            record,
            reason: Some(reason),
        }
    }
}

/// Eligibility of every asset in a table at one check date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub check_date: NaiveDate,
    pub assets: BTreeMap<AssetId, AssetEligibility>,
}

impl EligibilityResult {
    pub fn is_eligible(&self, asset: &str) -> bool {
        self.assets.get(asset).is_some_and(|a| a.eligible)
    }

    pub fn get(&self, asset: &str) -> Option<&AssetEligibility> {
        self.assets.get(asset)
    }

    /// Eligible assets, ascending by identifier.
    pub fn eligible_assets(&self) -> impl Iterator<Item = &AssetId> {
        self.assets
            .iter()
            .filter(|(_, a)| a.eligible)
            .map(|(id, _)| id)
    }

    pub fn eligible_count(&self) -> usize {
        self.assets.values().filter(|a| a.eligible).count()
    }

    pub fn is_empty(&self) -> bool {
        self.eligible_count() == 0
    }

    /// Secondary pass: drop eligible assets whose coverage is below
    /// `min_coverage`. Not applied by [`evaluate`].
    pub fn with_min_coverage(mut self, min_coverage: f64) -> Self {
        for entry in self.assets.values_mut() {
            let below = entry
                .record
                .as_ref()
                .is_some_and(|r| r.coverage_pct < min_coverage);
            if entry.eligible && below {
                entry.eligible = false;
                entry.reason = Some(IneligibleReason::BelowCoverage);
            }
        }
        self
    }

    /// Mark the given assets ineligible as delisted.
    pub fn with_delistings(mut self, delisted: &BTreeSet<AssetId>) -> Self {
        for asset in delisted {
            if let Some(entry) = self.assets.get_mut(asset) {
                entry.eligible = false;
                entry.reason = Some(IneligibleReason::Delisted);
            }
        }
        self
    }
}

/// Summarise an asset's observations dated on or before `check_date`.
///
/// `values` must already be truncated to those rows.
pub fn history_record(
    values: &[f64],
    dates: &[NaiveDate],
    check_date: NaiveDate,
) -> Option<AssetHistoryRecord> {
    let first = values.iter().position(|v| !v.is_nan())?;
    let last = values.iter().rposition(|v| !v.is_nan())?;
    let observation_count = values.iter().filter(|v| !v.is_nan()).count() as u32;
    let calendar_days_since_first = (check_date - dates[first]).num_days();
    let coverage_pct = if calendar_days_since_first > 0 {
        f64::from(observation_count) / calendar_days_since_first as f64
    } else {
        1.0
    };

    Some(AssetHistoryRecord {
        first_observation_date: dates[first],
        last_observation_date: dates[last],
        observation_count,
        calendar_days_since_first,
        coverage_pct,
    })
}

fn assess(record: Option<AssetHistoryRecord>, criteria: EligibilityCriteria) -> AssetEligibility {
    let Some(record) = record else {
        return AssetEligibility::rejected(None, IneligibleReason::NoData);
    };
    if record.calendar_days_since_first < i64::from(criteria.min_history_days) {
        return AssetEligibility::rejected(Some(record), IneligibleReason::InsufficientHistoryDays);
    }
    if record.observation_count < criteria.min_price_rows {
        return AssetEligibility::rejected(Some(record), IneligibleReason::InsufficientRows);
    }
    AssetEligibility {
        eligible: true,
        record: Some(record),
        reason: None,
    }
}

/// Evaluate PIT eligibility of every asset at `check_date`.
///
/// An empty table, or a check date before the first row, yields a result in
/// which every asset is ineligible. That is a valid result, not an error.
pub fn evaluate(
    table: &HistoryTable,
    check_date: NaiveDate,
    criteria: EligibilityCriteria,
) -> EligibilityResult {
    let rows = table.rows_through(check_date);
    let dates = &table.dates()[..rows];

    let assets: BTreeMap<AssetId, AssetEligibility> = table
        .columns()
        .par_iter()
        .map(|(asset, values)| {
            let record = history_record(&values[..rows], dates, check_date);
            (asset.clone(), assess(record, criteria))
        })
        .collect();

    let result = EligibilityResult { check_date, assets };
    debug!(
        "eligibility {check_date}: {}/{} eligible (min_days={}, min_rows={})",
        result.eligible_count(),
        result.assets.len(),
        criteria.min_history_days,
        criteria.min_price_rows
    );
    result
}

/// [`evaluate`] followed by delisting detection. Backtest-only.
pub fn evaluate_with_delistings(
    table: &HistoryTable,
    check_date: NaiveDate,
    criteria: EligibilityCriteria,
    lookforward_days: u32,
    permit: &LookaheadPermit,
) -> EligibilityResult {
    let delisted = detect_delistings(table, check_date, lookforward_days, permit);
    evaluate(table, check_date, criteria).with_delistings(&delisted)
}

/// Where the pipeline is running. Only backtests may read past a check date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Backtest,
    Live,
}

/// Capability token for functions that inspect data after the check date.
#[derive(Debug)]
pub struct LookaheadPermit {
    _private: (),
}

impl LookaheadPermit {
    pub fn for_mode(mode: ExecutionMode) -> Result<Self, EligibilityError> {
        match mode {
            ExecutionMode::Backtest => Ok(Self { _private: () }),
            ExecutionMode::Live => Err(EligibilityError::LookaheadInLiveMode),
        }
    }
}

/// Assets that stop trading on or before `as_of` and do not resume within
/// `lookforward_days` calendar days of their last observation.
///
/// A resumption inside the window is a temporary gap. When the table ends
/// before the window closes the outcome is unknown and the asset is not
/// flagged.
pub fn detect_delistings(
    table: &HistoryTable,
    as_of: NaiveDate,
    lookforward_days: u32,
    _permit: &LookaheadPermit,
) -> BTreeSet<AssetId> {
    let Some(table_end) = table.last_date() else {
        return BTreeSet::new();
    };
    let rows = table.rows_through(as_of);
    let dates = table.dates();
    let window = Duration::days(i64::from(lookforward_days));

    table
        .columns()
        .iter()
        .filter_map(|(asset, values)| {
            let last = values[..rows].iter().rposition(|v| !v.is_nan())?;
            let horizon = dates[last] + window;
            if table_end < horizon {
                return None;
            }
            let resumes = values[last + 1..]
                .iter()
                .zip(&dates[last + 1..])
                .take_while(|(_, d)| **d <= horizon)
                .any(|(v, _)| !v.is_nan());
            (!resumes).then(|| asset.clone())
        })
        .collect()
}
