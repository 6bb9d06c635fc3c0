//! Seeded synthetic price universes.
//!
//! Generates a wide price table with staggered listings, scattered missing
//! observations and occasional delistings, which is enough to exercise every
//! eligibility and membership rule without real market data.

use crate::domain::{AssetId, HistoryTable, SeriesKind, TableError};
use crate::rng::SeedHierarchy;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticUniverse {
    pub assets: usize,
    pub start: NaiveDate,
    /// Number of observation dates to generate.
    pub periods: usize,
    #[serde(default = "default_true")]
    pub weekdays_only: bool,
    /// Fraction of the calendar over which listing dates are spread.
    #[serde(default = "default_listing_spread")]
    pub listing_spread: f64,
    #[serde(default)]
    pub delisting_probability: f64,
    #[serde(default)]
    pub gap_probability: f64,
    #[serde(default = "default_annual_vol")]
    pub annual_volatility: f64,
}

fn default_true() -> bool {
    true
}

fn default_listing_spread() -> f64 {
    0.3
}

fn default_annual_vol() -> f64 {
    0.25
}

impl SyntheticUniverse {
    pub fn new(assets: usize, start: NaiveDate, periods: usize) -> Self {
        Self {
            assets,
            start,
            periods,
            weekdays_only: true,
            listing_spread: default_listing_spread(),
            delisting_probability: 0.0,
            gap_probability: 0.0,
            annual_volatility: default_annual_vol(),
        }
    }

    pub fn asset_ids(&self) -> Vec<AssetId> {
        let width = self.assets.max(1).to_string().len().max(3);
        (0..self.assets)
            .map(|i| format!("A{i:0width$}"))
            .collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates = Vec::with_capacity(self.periods);
        let mut day = self.start;
        while dates.len() < self.periods {
            let weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
            if !(self.weekdays_only && weekend) {
                dates.push(day);
            }
            day += Duration::days(1);
        }
        dates
    }

    /// Generate the price table. Same seed, same table.
    pub fn generate(&self, seed: u64) -> Result<HistoryTable, TableError> {
        let seeds = SeedHierarchy::new(seed);
        let dates = self.dates();
        let n = dates.len();
        let daily_vol = self.annual_volatility / 252f64.sqrt();

        let mut columns = BTreeMap::new();
        for asset in self.asset_ids() {
            let mut life = seeds.rng_for(&asset, "life");
            let spread = ((n as f64) * self.listing_spread.clamp(0.0, 1.0)) as usize;
            let listed_at = if spread > 0 { life.gen_range(0..spread) } else { 0 };
            let delisted_at = if n > listed_at + 2 && life.gen::<f64>() < self.delisting_probability {
                Some(life.gen_range(listed_at + (n - listed_at) / 2..n))
            } else {
                None
            };

            let mut walk = seeds.rng_for(&asset, "walk");
            let mut gaps = seeds.rng_for(&asset, "gaps");
            let drift = walk.gen_range(-0.0002..0.0006);
            let mut price = walk.gen_range(20.0..200.0);

            let mut values = Vec::with_capacity(n);
            for i in 0..n {
                let alive = i >= listed_at && delisted_at.map_or(true, |d| i < d);
                let shock = standard_normal(&mut walk);
                if !alive {
                    values.push(f64::NAN);
                    continue;
                }
                if i > listed_at {
                    price *= (drift + daily_vol * shock).exp();
                }
                // Never punch a hole into the listing date itself.
                if i > listed_at && gaps.gen::<f64>() < self.gap_probability {
                    values.push(f64::NAN);
                } else {
                    values.push(price);
                }
            }
            columns.insert(asset, values);
        }

        HistoryTable::new(SeriesKind::Prices, dates, columns)
    }
}

/// Box-Muller transform over two uniforms.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
