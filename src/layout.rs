//! Axis-major views over row-major buffers.
//!
//! A tensor of shape `[d0, .., d(k-1), C, d(k+1), ..]` split around axis `k` is
//! `outer x C x inner`, where `outer` is the product of the leading dims and
//! `inner` the product of the trailing ones. Calibration statistics want the
//! channel axis first (one row per channel); permutation wants to reorder the
//! `C` slices in place.

use crate::error::{QuantError, Result};

/// `outer x channels x inner` decomposition of a shape around one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisLayout {
    pub outer: usize,
    pub channels: usize,
    pub inner: usize,
}

impl AxisLayout {
    pub fn new(shape: &[usize], axis: usize) -> Result<Self> {
        if axis >= shape.len() {
            return Err(QuantError::AxisOutOfRange {
                axis,
                ndim: shape.len(),
            });
        }
        Ok(Self {
            outer: shape[..axis].iter().product(),
            channels: shape[axis],
            inner: shape[axis + 1..].iter().product(),
        })
    }

    pub fn numel(&self) -> usize {
        self.outer * self.channels * self.inner
    }

    /// Elements per channel once every other axis is flattened.
    pub fn row_len(&self) -> usize {
        self.outer * self.inner
    }

    /// Channel index of a flat row-major offset.
    #[inline]
    pub fn channel_of(&self, flat: usize) -> usize {
        (flat / self.inner) % self.channels
    }
}

/// Reorder `data` so that each channel's elements are contiguous.
///
/// The result is a `channels x row_len` matrix in row-major order.
pub fn channel_major(data: &[f32], layout: &AxisLayout) -> Vec<f32> {
    let AxisLayout {
        outer,
        channels,
        inner,
    } = *layout;
    let row_len = layout.row_len();
    let mut out = vec![0.0; data.len()];
    for o in 0..outer {
        for c in 0..channels {
            let src = (o * channels + c) * inner;
            let dst = c * row_len + o * inner;
            out[dst..dst + inner].copy_from_slice(&data[src..src + inner]);
        }
    }
    out
}

/// Gather channel slices along the layout axis: output channel `c` is input
/// channel `index[c]`.
pub fn gather_channels(data: &[f32], layout: &AxisLayout, index: &[usize]) -> Vec<f32> {
    let AxisLayout {
        outer,
        channels,
        inner,
    } = *layout;
    let out_channels = index.len();
    let mut out = vec![0.0; outer * out_channels * inner];
    for o in 0..outer {
        for (c, &src_c) in index.iter().enumerate() {
            let src = (o * channels + src_c) * inner;
            let dst = (o * out_channels + c) * inner;
            out[dst..dst + inner].copy_from_slice(&data[src..src + inner]);
        }
    }
    out
}
