//! Timestamped multivariate series (one row per step, one column per feature).

use std::{fs::File, io::Read, path::Path};

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// Ordered, timestamped feature table. Rows are strictly increasing in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    timestamps: Vec<NaiveDateTime>,
    columns: Vec<String>,
    values: Array2<f64>,
}

impl TimeSeries {
    /// Builds a series after checking row counts, finiteness and time order.
    pub fn new(
        timestamps: Vec<NaiveDateTime>,
        columns: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self> {
        let (rows, cols) = values.dim();
        if timestamps.len() != rows {
            return Err(ForecastError::Series(format!(
                "{} timestamps for {rows} rows",
                timestamps.len()
            )));
        }
        if cols == 0 || columns.len() != cols {
            return Err(ForecastError::Series(format!(
                "{} column names for {cols} feature columns",
                columns.len()
            )));
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(ForecastError::Series(format!(
                "non-finite value at row {}, column {}",
                pos / cols,
                pos % cols
            )));
        }
        if let Some(idx) = timestamps.windows(2).position(|w| w[0] >= w[1]) {
            return Err(ForecastError::Series(format!(
                "timestamps not strictly increasing at row {}",
                idx + 1
            )));
        }
        Ok(Self {
            timestamps,
            columns,
            values,
        })
    }

    /// Loads a CSV table: first column timestamp, remaining columns numeric features.
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            ForecastError::Series(format!("cannot open {}: {err}", path.display()))
        })?;
        Self::from_csv_reader(file)
    }

    /// Parses a CSV table from any reader.
    pub fn from_csv_reader(reader: impl Read) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(ForecastError::Series(
                "expected a timestamp column followed by at least one feature".into(),
            ));
        }
        let columns: Vec<String> = headers.iter().skip(1).map(str::to_owned).collect();
        let mut timestamps = Vec::new();
        let mut flat = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            timestamps.push(parse_timestamp(&record[0]).ok_or_else(|| {
                ForecastError::Series(format!("row {}: bad timestamp {:?}", row + 1, &record[0]))
            })?);
            for (col, field) in record.iter().skip(1).enumerate() {
                let value = field.trim().parse::<f64>().map_err(|_| {
                    ForecastError::Series(format!(
                        "row {}, column {}: not a number {field:?}",
                        row + 1,
                        columns[col]
                    ))
                })?;
                flat.push(value);
            }
        }
        let values = Array2::from_shape_vec((timestamps.len(), columns.len()), flat)
            .map_err(|err| ForecastError::Series(err.to_string()))?;
        Self::new(timestamps, columns, values)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the series has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Number of feature columns.
    #[must_use]
    pub fn feature_count(&self) -> usize {
        self.columns.len()
    }

    /// Feature column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row timestamps.
    #[must_use]
    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    /// Raw values, rows x features.
    #[must_use]
    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Index of a feature by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Last `n` rows as an owned matrix.
    pub fn tail(&self, n: usize) -> Result<Array2<f64>> {
        if n > self.len() {
            return Err(ForecastError::InsufficientHistory {
                available: self.len(),
                required: n,
            });
        }
        Ok(self.values.slice(s![self.len() - n.., ..]).to_owned())
    }
}

fn parse_timestamp(field: &str) -> Option<NaiveDateTime> {
    let field = field.trim();
    NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(field, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
pub(crate) mod fixtures {
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use ndarray::Array2;

    use super::TimeSeries;

    /// Daily timestamps starting 2020-01-01.
    pub fn daily(n: usize) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n).map(|i| start + Duration::days(i as i64)).collect()
    }

    /// Deterministic wavy series with `features` columns.
    pub fn wave(n: usize, features: usize) -> TimeSeries {
        let values = Array2::from_shape_fn((n, features), |(t, f)| {
            let t = t as f64;
            100.0 + 10.0 * f as f64 + (t * 0.3 + f as f64).sin() * 5.0 + t * 0.1
        });
        let columns = (0..features).map(|f| format!("f{f}")).collect();
        TimeSeries::new(daily(n), columns, values).unwrap()
    }
}
