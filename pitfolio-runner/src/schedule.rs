//! Rebalance calendars derived from the dates a table actually has.

use chrono::{Datelike, NaiveDate};
use pitfolio_core::domain::HistoryTable;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
}

impl Frequency {
    /// Key identifying the calendar period `date` falls in.
    fn period(self, date: NaiveDate) -> (i32, u32) {
        match self {
            Frequency::Daily => (date.year(), date.ordinal()),
            Frequency::Weekly => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Frequency::Monthly => (date.year(), date.month()),
            Frequency::Quarterly => (date.year(), (date.month() - 1) / 3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RebalanceSchedule {
    #[serde(default)]
    pub frequency: Frequency,
    /// First date considered (inclusive).
    #[serde(default)]
    pub start: Option<NaiveDate>,
    /// Last date considered (inclusive).
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl RebalanceSchedule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            start: None,
            end: None,
        }
    }

    /// Last available table date of every period inside `[start, end]`.
    ///
    /// A trailing period that the table only partially covers still
    /// contributes its last available date.
    pub fn dates(&self, table: &HistoryTable) -> Vec<NaiveDate> {
        self.select(table.dates())
    }

    pub fn select(&self, dates: &[NaiveDate]) -> Vec<NaiveDate> {
        let in_range = dates.iter().copied().filter(|d| {
            self.start.map_or(true, |s| *d >= s) && self.end.map_or(true, |e| *d <= e)
        });

        let mut out: Vec<NaiveDate> = Vec::new();
        let mut current: Option<((i32, u32), NaiveDate)> = None;
        for date in in_range {
            let period = self.frequency.period(date);
            match current {
                Some((p, last)) if p != period => {
                    out.push(last);
                    current = Some((period, date));
                }
                _ => current = Some((period, date)),
            }
        }
        if let Some((_, last)) = current {
            out.push(last);
        }
        out
    }
}
