use std::{
    fs::File,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ForecastError, Result},
    persist,
};

/// Header of `loss_log.csv`.
pub const LOSS_LOG_HEADER: [&str; 3] = ["epoch", "mean_loss", "std_loss"];

/// One epoch's loss statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRow {
    /// 1-based epoch index.
    pub epoch: usize,
    /// Mean batch loss.
    pub mean_loss: f64,
    /// Population std of batch losses.
    pub std_loss: f64,
}

/// Append-only epoch loss table backed by a CSV file. Every append rewrites
/// the file atomically, so readers never observe a half-written row.
#[derive(Debug, Clone)]
pub struct LossLog {
    path: PathBuf,
    rows: Vec<LossRow>,
}

impl LossLog {
    /// Starts a fresh log at `path`, replacing any previous one.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let log = Self {
            path: path.into(),
            rows: Vec::new(),
        };
        log.flush()?;
        Ok(log)
    }

    /// Reopens `path`, keeping only rows with `epoch <= last_epoch`.
    pub fn reopen(path: impl Into<PathBuf>, last_epoch: usize) -> Result<Self> {
        let path = path.into();
        let mut rows = if path.exists() {
            Self::read(&path)?
        } else {
            Vec::new()
        };
        rows.retain(|row| row.epoch <= last_epoch);
        let log = Self { path, rows };
        log.flush()?;
        Ok(log)
    }

    /// Reads all rows of a loss log.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<LossRow>> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            ForecastError::Series(format!("cannot open {}: {err}", path.display()))
        })?;
        let mut reader = csv::Reader::from_reader(file);
        let headers = reader.headers()?;
        if headers.iter().ne(LOSS_LOG_HEADER) {
            return Err(ForecastError::Series(format!(
                "{} does not start with {}",
                path.display(),
                LOSS_LOG_HEADER.join(",")
            )));
        }
        let mut rows: Vec<LossRow> = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Appends a row and persists the table.
    pub fn append(&mut self, row: LossRow) -> Result<()> {
        self.rows.push(row);
        if let Err(err) = self.flush() {
            self.rows.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Rows in epoch order.
    #[must_use]
    pub fn rows(&self) -> &[LossRow] {
        &self.rows
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(LOSS_LOG_HEADER)?;
        for row in &self.rows {
            writer.write_record([
                row.epoch.to_string(),
                format!("{:.4}", row.mean_loss),
                format!("{:.4}", row.std_loss),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| ForecastError::persistence(&self.path, err.into_error()))?;
        persist::write_bytes(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn row(epoch: usize) -> LossRow {
        LossRow {
            epoch,
            mean_loss: 0.123_456,
            std_loss: 0.01,
        }
    }

    #[test]
    fn writes_header_and_four_decimals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loss_log.csv");
        let mut log = LossLog::create(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "epoch,mean_loss,std_loss\n");
        log.append(row(1)).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "epoch,mean_loss,std_loss\n1,0.1235,0.0100\n"
        );
        let rows = LossLog::read(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].mean_loss - 0.1235).abs() < 1e-12);
    }

    #[test]
    fn reopen_drops_rows_after_resume_point() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loss_log.csv");
        let mut log = LossLog::create(&path).unwrap();
        for epoch in 1..=7 {
            log.append(row(epoch)).unwrap();
        }
        let log = LossLog::reopen(&path, 5).unwrap();
        assert_eq!(log.rows().len(), 5);
        assert_eq!(LossLog::read(&path).unwrap().len(), 5);
    }

    #[test]
    fn foreign_header_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loss_log.csv");
        fs::write(&path, "step,loss\n1,0.5\n").unwrap();
        assert!(LossLog::read(&path).is_err());
    }
}
