//! Calibration data cache
//!
//! Batches observed during calibration are kept as detached copies and only
//! turned into a statistics view when a range is finalized.

use tracing::trace;

use super::config::Granularity;
use crate::error::{QuantError, Result};
use crate::layout::{channel_major, AxisLayout};
use crate::Tensor;

/// Concatenated calibration data as a `rows x cols` matrix.
///
/// Layerwise views have a single row; channelwise views have one row per
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationView {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl CalibrationView {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> std::slice::Chunks<'_, f32> {
        self.data.chunks(self.cols.max(1))
    }
}

/// Ordered sequence of calibration batches sharing their non-batch shape.
#[derive(Debug, Default)]
pub struct CalibrationCache {
    ch_axis: Option<usize>,
    batches: Vec<Tensor>,
}

impl CalibrationCache {
    /// Create an empty cache whose channelwise views split on `ch_axis`.
    pub fn new(ch_axis: Option<usize>) -> Self {
        Self {
            ch_axis,
            batches: Vec::new(),
        }
    }

    /// Append a batch. Axis 0 is the batch axis; every other axis must match
    /// the batches already cached.
    pub fn add(&mut self, batch: &Tensor) -> Result<()> {
        if batch.ndim() == 0 {
            return Err(QuantError::InvalidConfig(
                "calibration batch needs at least one axis".to_string(),
            ));
        }
        if let Some(first) = self.batches.first() {
            if first.shape()[1..] != batch.shape()[1..] {
                let mut expected = first.shape().to_vec();
                expected[0] = batch.shape()[0];
                return Err(QuantError::ShapeMismatch {
                    expected,
                    actual: batch.shape().to_vec(),
                });
            }
        }
        trace!(shape = ?batch.shape(), cached = self.batches.len(), "caching calibration batch");
        self.batches.push(batch.detach());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total extent of the batch axis across cached batches.
    pub fn batch_size(&self) -> usize {
        self.batches.iter().map(|b| b.shape()[0]).sum()
    }

    /// Shape of the batches concatenated along axis 0.
    pub fn shape(&self) -> Option<Vec<usize>> {
        self.batches.first().map(|first| {
            let mut shape = first.shape().to_vec();
            shape[0] = self.batch_size();
            shape
        })
    }

    /// Concatenate every cached batch along the batch axis and lay it out for
    /// statistics at `granularity`.
    pub fn get_data_for_calibration(&self, granularity: Granularity) -> Result<CalibrationView> {
        let shape = self.shape().ok_or(QuantError::EmptyCache)?;
        // zero-length batches leave channels without any samples
        if shape.iter().product::<usize>() == 0 {
            return Err(QuantError::EmptyCache);
        }
        let mut data = Vec::with_capacity(shape.iter().product());
        for batch in &self.batches {
            data.extend_from_slice(&batch.data());
        }

        match granularity {
            Granularity::Layerwise => {
                let cols = data.len();
                Ok(CalibrationView {
                    data,
                    rows: 1,
                    cols,
                })
            }
            Granularity::Channelwise => {
                let axis = self.ch_axis.ok_or_else(|| {
                    QuantError::InvalidConfig(
                        "channelwise calibration requires a channel axis".to_string(),
                    )
                })?;
                let layout = AxisLayout::new(&shape, axis)?;
                Ok(CalibrationView {
                    data: channel_major(&data, &layout),
                    rows: layout.channels,
                    cols: layout.row_len(),
                })
            }
        }
    }

    /// Drop every cached batch.
    pub fn reset(&mut self) {
        self.batches.clear();
    }
}
