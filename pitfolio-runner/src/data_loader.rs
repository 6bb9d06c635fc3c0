//! Reading and writing history tables as wide CSV files.
//!
//! Layout: a header row `date,ASSET1,ASSET2,…` followed by one row per date
//! in ascending order. Dates are `YYYY-MM-DD`. An empty cell (or `NA`,
//! `NaN`, `null`) is a missing observation.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use log::info;
use thiserror::Error;

use pitfolio_core::domain::{AssetId, HistoryTable, SeriesKind, TableError};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("first column must be 'date', found '{0}'")]
    MissingDateColumn(String),

    #[error("duplicate asset column '{0}'")]
    DuplicateAsset(String),

    #[error("line {line}: invalid date '{value}'")]
    BadDate { line: u64, value: String },

    #[error("line {line}: invalid value '{value}' for '{asset}'")]
    BadValue { line: u64, asset: AssetId, value: String },

    #[error("invalid table: {0}")]
    Table(#[from] TableError),
}

/// Load a wide CSV from disk.
pub fn load_wide_csv(path: impl AsRef<Path>, kind: SeriesKind) -> Result<HistoryTable, LoadError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = read_wide_csv(file, kind)?;
    info!(
        "loaded {}: {} assets x {} dates",
        path.display(),
        table.asset_count(),
        table.len()
    );
    Ok(table)
}

/// Parse a wide CSV from any reader.
pub fn read_wide_csv<R: Read>(reader: R, kind: SeriesKind) -> Result<HistoryTable, LoadError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let headers = rdr.headers()?.clone();
    let first = headers.get(0).unwrap_or_default();
    if !first.eq_ignore_ascii_case("date") {
        return Err(LoadError::MissingDateColumn(first.to_string()));
    }
    let assets: Vec<AssetId> = headers.iter().skip(1).map(str::to_string).collect();
    let mut seen = std::collections::BTreeSet::new();
    for asset in &assets {
        if !seen.insert(asset.as_str()) {
            return Err(LoadError::DuplicateAsset(asset.clone()));
        }
    }

    let mut dates = Vec::new();
    let mut values: Vec<Vec<f64>> = vec![Vec::new(); assets.len()];
    for record in rdr.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line());
        let raw_date = record.get(0).unwrap_or_default();
        let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d").map_err(|_| LoadError::BadDate {
            line,
            value: raw_date.to_string(),
        })?;
        dates.push(date);

        for (i, asset) in assets.iter().enumerate() {
            let cell = record.get(i + 1).unwrap_or_default();
            values[i].push(parse_cell(cell).ok_or_else(|| LoadError::BadValue {
                line,
                asset: asset.clone(),
                value: cell.to_string(),
            })?);
        }
    }

    let columns: BTreeMap<AssetId, Vec<f64>> = assets.into_iter().zip(values).collect();
    Ok(HistoryTable::new(kind, dates, columns)?)
}

/// Write `table` in the layout [`read_wide_csv`] accepts. Missing
/// observations become empty cells.
pub fn write_wide_csv<W: Write>(table: &HistoryTable, writer: W) -> Result<(), LoadError> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec!["date".to_string()];
    header.extend(table.assets().cloned());
    wtr.write_record(&header)?;

    for (row, date) in table.dates().iter().enumerate() {
        let mut record = vec![date.to_string()];
        record.extend(table.columns().values().map(|col| {
            let v = col[row];
            if v.is_nan() {
                String::new()
            } else {
                v.to_string()
            }
        }));
        wtr.write_record(&record)?;
    }
    wtr.flush().map_err(|e| LoadError::Csv(e.into()))?;
    Ok(())
}

pub fn save_wide_csv(table: &HistoryTable, path: impl AsRef<Path>) -> Result<(), LoadError> {
    let path = path.as_ref();
    let file = std::fs::File::create(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    write_wide_csv(table, file)?;
    info!(
        "wrote {}: {} assets x {} dates",
        path.display(),
        table.asset_count(),
        table.len()
    );
    Ok(())
}

fn parse_cell(cell: &str) -> Option<f64> {
    if cell.is_empty() || ["na", "nan", "null"].contains(&cell.to_ascii_lowercase().as_str()) {
        return Some(f64::NAN);
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parses_wide_layout_with_gaps() {
        let csv = "date,SPY,QQQ\n2024-01-02,470.1,\n2024-01-03, 471.0 ,NA\n2024-01-04,472.5,400.0\n";
        let table = read_wide_csv(csv.as_bytes(), SeriesKind::Prices).unwrap();
        assert_eq!(table.dates(), &[d("2024-01-02"), d("2024-01-03"), d("2024-01-04")]);
        assert_eq!(table.column("SPY").unwrap(), &[470.1, 471.0, 472.5]);
        let qqq = table.column("QQQ").unwrap();
        assert!(qqq[0].is_nan() && qqq[1].is_nan());
        assert_eq!(qqq[2], 400.0);
    }

    #[test]
    fn rejects_bad_header_and_cells() {
        let err = read_wide_csv("day,A\n2024-01-02,1\n".as_bytes(), SeriesKind::Prices).unwrap_err();
        assert!(matches!(err, LoadError::MissingDateColumn(_)));

        let err = read_wide_csv("date,A,A\n2024-01-02,1,2\n".as_bytes(), SeriesKind::Prices).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateAsset(a) if a == "A"));

        let err = read_wide_csv("date,A\n2024-13-02,1\n".as_bytes(), SeriesKind::Prices).unwrap_err();
        assert!(matches!(err, LoadError::BadDate { .. }));

        let err = read_wide_csv("date,A\n2024-01-02,abc\n".as_bytes(), SeriesKind::Prices).unwrap_err();
        assert!(matches!(err, LoadError::BadValue { .. }));

        let err = read_wide_csv("date,A\n2024-01-02,inf\n".as_bytes(), SeriesKind::Prices).unwrap_err();
        assert!(matches!(err, LoadError::BadValue { .. }));
    }

    #[test]
    fn unsorted_dates_surface_as_table_error() {
        let err = read_wide_csv("date,A\n2024-01-03,1\n2024-01-02,2\n".as_bytes(), SeriesKind::Prices)
            .unwrap_err();
        assert!(matches!(err, LoadError::Table(TableError::UnsortedDates { .. })));
    }

    #[test]
    fn written_tables_read_back_identically() {
        let csv = "date,A,B\n2024-01-02,1.5,\n2024-01-03,0.1,2.25\n";
        let table = read_wide_csv(csv.as_bytes(), SeriesKind::Prices).unwrap();
        let mut out = Vec::new();
        write_wide_csv(&table, &mut out).unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), csv);
        let back = read_wide_csv(out.as_slice(), SeriesKind::Prices).unwrap();
        assert_eq!(back.content_hash(), table.content_hash());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = read_wide_csv("date,A,B\n2024-01-02,1\n".as_bytes(), SeriesKind::Prices).unwrap_err();
        assert!(matches!(err, LoadError::Csv(_)));
    }
}
