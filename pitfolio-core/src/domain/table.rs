//! History table — the date × asset matrix every pipeline stage reads.
//!
//! Cells are `f64`; NaN marks a missing observation. Dates are strictly
//! increasing and asset columns are kept in a `BTreeMap` so iteration order
//! is always ascending by identifier.

use super::ids::{AssetId, DatasetHash};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// What the cells of a table hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    Prices,
    Returns,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error("dates must be strictly increasing (index {index}: {date})")]
    UnsortedDates { index: usize, date: NaiveDate },

    #[error("column '{asset}' has {len} values, expected {expected}")]
    LengthMismatch {
        asset: AssetId,
        len: usize,
        expected: usize,
    },

    #[error("infinite value in column '{asset}' at {date}")]
    InfiniteValue { asset: AssetId, date: NaiveDate },

    #[error("empty asset identifier")]
    EmptyAssetId,
}

/// Aligned historical observations for a universe of assets.
#[derive(Debug, Clone)]
pub struct HistoryTable {
    kind: SeriesKind,
    dates: Vec<NaiveDate>,
    columns: BTreeMap<AssetId, Vec<f64>>,
}

impl HistoryTable {
    /// Build a table, validating ordering and shape.
    pub fn new(
        kind: SeriesKind,
        dates: Vec<NaiveDate>,
        columns: BTreeMap<AssetId, Vec<f64>>,
    ) -> Result<Self, TableError> {
        for (index, pair) in dates.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(TableError::UnsortedDates {
                    index: index + 1,
                    date: pair[1],
                });
            }
        }

        for (asset, values) in &columns {
            if asset.is_empty() {
                return Err(TableError::EmptyAssetId);
            }
            if values.len() != dates.len() {
                return Err(TableError::LengthMismatch {
                    asset: asset.clone(),
                    len: values.len(),
                    expected: dates.len(),
                });
            }
            if let Some(i) = values.iter().position(|v| v.is_infinite()) {
                return Err(TableError::InfiniteValue {
                    asset: asset.clone(),
                    date: dates[i],
                });
            }
        }

        Ok(Self {
            kind,
            dates,
            columns,
        })
    }

    pub fn empty(kind: SeriesKind) -> Self {
        Self {
            kind,
            dates: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> SeriesKind {
        self.kind
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetId> {
        self.columns.keys()
    }

    pub fn asset_count(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn column(&self, asset: &str) -> Option<&[f64]> {
        self.columns.get(asset).map(|c| c.as_slice())
    }

    pub fn columns(&self) -> &BTreeMap<AssetId, Vec<f64>> {
        &self.columns
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Number of rows dated on or before `date`.
    pub fn rows_through(&self, date: NaiveDate) -> usize {
        self.dates.partition_point(|d| *d <= date)
    }

    /// Copy of the table restricted to rows dated on or before `date`.
    pub fn truncate_at(&self, date: NaiveDate) -> HistoryTable {
        let n = self.rows_through(date);
        HistoryTable {
            kind: self.kind,
            dates: self.dates[..n].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(a, v)| (a.clone(), v[..n].to_vec()))
                .collect(),
        }
    }

    /// Simple returns derived from prices. The first row and any row whose
    /// current or previous price is missing (or non-positive) is NaN.
    /// A returns table is returned unchanged.
    pub fn to_returns(&self) -> HistoryTable {
        if self.kind == SeriesKind::Returns {
            return self.clone();
        }

        let columns = self
            .columns
            .iter()
            .map(|(asset, prices)| {
                let mut returns = Vec::with_capacity(prices.len());
                for i in 0..prices.len() {
                    if i == 0 {
                        returns.push(f64::NAN);
                        continue;
                    }
                    let (prev, cur) = (prices[i - 1], prices[i]);
                    if prev.is_finite() && cur.is_finite() && prev > 0.0 {
                        returns.push(cur / prev - 1.0);
                    } else {
                        returns.push(f64::NAN);
                    }
                }
                (asset.clone(), returns)
            })
            .collect();

        HistoryTable {
            kind: SeriesKind::Returns,
            dates: self.dates.clone(),
            columns,
        }
    }

    /// Content hash of the whole table.
    pub fn content_hash(&self) -> DatasetHash {
        self.prefix_hashes().through(self.len())
    }

    /// Content hash of the rows dated on or before `date`.
    pub fn slice_hash(&self, date: NaiveDate) -> DatasetHash {
        let n = self.rows_through(date);
        let mut chain = self.header_hasher().finalize();
        for row in 0..n {
            chain = self.chain_row(&chain, row);
        }
        DatasetHash::from_digest(&chain)
    }

    /// Chained per-row hashes. The hash through row `i` covers the header
    /// (kind + asset names) and every cell of rows `0..i`, and is unaffected
    /// by rows appended later.
    pub fn prefix_hashes(&self) -> PrefixHashes {
        let mut chain = self.header_hasher().finalize();
        let mut hashes = Vec::with_capacity(self.len() + 1);
        hashes.push(DatasetHash::from_digest(&chain));
        for row in 0..self.len() {
            chain = self.chain_row(&chain, row);
            hashes.push(DatasetHash::from_digest(&chain));
        }
        PrefixHashes { hashes }
    }

    fn header_hasher(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        let tag: &[u8] = match self.kind {
            SeriesKind::Prices => b"prices",
            SeriesKind::Returns => b"returns",
        };
        hasher.update(tag);
        for asset in self.columns.keys() {
            hasher.update(asset.as_bytes());
            hasher.update(&[0]);
        }
        hasher
    }

    fn chain_row(&self, prev: &blake3::Hash, row: usize) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(prev.as_bytes());
        hasher.update(self.dates[row].to_string().as_bytes());
        for values in self.columns.values() {
            // Canonical NaN so differently-encoded missing cells hash alike.
            let v = values[row];
            let bits = if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() };
            hasher.update(&bits.to_le_bytes());
        }
        hasher.finalize()
    }
}

/// Precomputed slice hashes for a table; see [`HistoryTable::prefix_hashes`].
#[derive(Debug, Clone)]
pub struct PrefixHashes {
    hashes: Vec<DatasetHash>,
}

impl PrefixHashes {
    /// Hash of the first `rows` rows (clamped to the table length).
    pub fn through(&self, rows: usize) -> DatasetHash {
        let idx = rows.min(self.hashes.len() - 1);
        self.hashes[idx].clone()
    }
}
