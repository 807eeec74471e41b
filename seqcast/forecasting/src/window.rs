//! Sliding (input, target) windows over a normalized series.

use ndarray::{s, Array2, ArrayView2};

use crate::error::{ForecastError, Result};

/// One training pair. `target` starts at the row right after `input` ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Row offset of the first input row in the source series.
    pub offset: usize,
    /// `sample_size x features` input slice.
    pub input: Array2<f64>,
    /// `output_size x features` target slice.
    pub target: Array2<f64>,
}

/// Ordered windows produced from one normalized series.
#[derive(Debug, Clone, Default)]
pub struct WindowDataset {
    sample_size: usize,
    output_size: usize,
    windows: Vec<Window>,
}

impl WindowDataset {
    /// Slides over `normalized` at offsets `0..=N-S-O`. A series shorter than
    /// `S + O` yields an empty dataset, not an error.
    pub fn build(
        normalized: ArrayView2<'_, f64>,
        sample_size: usize,
        output_size: usize,
    ) -> Result<Self> {
        if sample_size == 0 || output_size == 0 {
            return Err(ForecastError::InvalidConfig(format!(
                "sample_size ({sample_size}) and output_size ({output_size}) must be at least 1"
            )));
        }
        let rows = normalized.nrows();
        let count = (rows + 1).saturating_sub(sample_size + output_size);
        let windows = (0..count)
            .map(|offset| {
                let split = offset + sample_size;
                Window {
                    offset,
                    input: normalized.slice(s![offset..split, ..]).to_owned(),
                    target: normalized.slice(s![split..split + output_size, ..]).to_owned(),
                }
            })
            .collect();
        Ok(Self {
            sample_size,
            output_size,
            windows,
        })
    }

    /// Number of windows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window could be produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Input length S.
    #[must_use]
    pub const fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Target length O.
    #[must_use]
    pub const fn output_size(&self) -> usize {
        self.output_size
    }

    /// Feature width, or 0 when empty.
    #[must_use]
    pub fn feature_count(&self) -> usize {
        self.windows.first().map_or(0, |w| w.input.ncols())
    }

    /// Windows in time order.
    pub fn iter(&self) -> std::slice::Iter<'_, Window> {
        self.windows.iter()
    }

    /// Windows as a slice.
    #[must_use]
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Contiguous batches of at most `batch_size` windows, order preserved.
    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, Window> {
        self.windows.chunks(batch_size.max(1))
    }

    /// Training boundary check: an empty dataset must not reach the model.
    pub fn ensure_trainable(&self) -> Result<()> {
        if self.is_empty() {
            Err(ForecastError::EmptyDataset)
        } else {
            Ok(())
        }
    }
}

impl<'a> IntoIterator for &'a WindowDataset {
    type Item = &'a Window;
    type IntoIter = std::slice::Iter<'a, Window>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * 10 + c) as f64)
    }

    #[test]
    fn window_count_matches_formula() {
        let data = ramp(20, 2);
        assert_eq!(WindowDataset::build(data.view(), 10, 5).unwrap().len(), 6);
        assert_eq!(WindowDataset::build(data.view(), 10, 10).unwrap().len(), 1);
        assert_eq!(WindowDataset::build(data.view(), 15, 6).unwrap().len(), 0);
        for n in 0..12 {
            let data = ramp(n, 1);
            let ds = WindowDataset::build(data.view(), 3, 2).unwrap();
            assert_eq!(ds.len(), (n + 1).saturating_sub(5));
        }
    }

    #[test]
    fn target_starts_where_input_ends() {
        let data = ramp(20, 2);
        let ds = WindowDataset::build(data.view(), 10, 5).unwrap();
        for (i, window) in ds.iter().enumerate() {
            assert_eq!(window.offset, i);
            assert_eq!(window.input.dim(), (10, 2));
            assert_eq!(window.target.dim(), (5, 2));
            assert_eq!(window.input.row(9), data.row(i + 9));
            assert_eq!(window.target.row(0), data.row(i + 10));
            assert_eq!(window.target.row(4), data.row(i + 14));
        }
    }

    #[test]
    fn short_series_is_empty_but_not_trainable() {
        let data = ramp(7, 1);
        let ds = WindowDataset::build(data.view(), 5, 5).unwrap();
        assert!(ds.is_empty());
        assert!(matches!(ds.ensure_trainable(), Err(ForecastError::EmptyDataset)));
    }

    #[test]
    fn batches_keep_order() {
        let data = ramp(12, 1);
        let ds = WindowDataset::build(data.view(), 2, 1).unwrap();
        let offsets: Vec<Vec<usize>> = ds
            .batches(4)
            .map(|b| b.iter().map(|w| w.offset).collect())
            .collect();
        assert_eq!(offsets, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let data = ramp(5, 1);
        assert!(WindowDataset::build(data.view(), 0, 1).is_err());
        assert!(WindowDataset::build(data.view(), 1, 0).is_err());
    }
}
