//! Fake quantization with a straight-through estimator
//!
//! The forward pass snaps values onto the integer grid and maps them back to
//! real values, so downstream computation sees exactly what an integer
//! deployment would. The backward pass treats rounding and clamping as the
//! identity, which keeps gradients flowing to the input. Scale and zero point
//! are calibration constants and receive no gradient.

use rayon::prelude::*;

use super::config::QDescriptor;
use super::qparams::{QParams, QRange};
use crate::error::{QuantError, Result};
use crate::layout::AxisLayout;
use crate::ops::accumulate_grad;
use crate::{tape::Tape, Tensor};

/// Inputs at least this large are processed with rayon.
const PARALLEL_THRESHOLD: usize = 1 << 15;

/// Gradient rule of the fake quantization op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SteMode {
    /// Pass the incoming gradient through unchanged.
    #[default]
    Identity,
    /// Zero the gradient where the code saturated at `qmin` or `qmax`.
    Clipped,
}

/// Integer code of `x`, before clamping.
#[inline]
fn raw_code(x: f32, scale: f32, zero_point: i32) -> f32 {
    (x / scale).round_ties_even() + zero_point as f32
}

/// Quantize-dequantize a single value.
#[inline]
pub fn fake_quantize_value(x: f32, scale: f32, zero_point: i32, qrange: QRange) -> f32 {
    let q = raw_code(x, scale, zero_point).clamp(qrange.qmin as f32, qrange.qmax as f32);
    (q - zero_point as f32) * scale
}

/// Fake quantization op over fixed parameters.
///
/// Holds no mutable state, so one instance can serve any number of threads.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeQuantize {
    qparams: QParams,
    ch_axis: Option<usize>,
    ste: SteMode,
}

impl FakeQuantize {
    /// Per-tensor parameters take `ch_axis = None`; per-channel parameters
    /// broadcast along `ch_axis`.
    pub fn new(qparams: QParams, ch_axis: Option<usize>) -> Result<Self> {
        if qparams.is_empty() || qparams.scale.len() != qparams.zero_point.len() {
            return Err(QuantError::ShapeMismatch {
                expected: vec![qparams.scale.len()],
                actual: vec![qparams.zero_point.len()],
            });
        }
        if ch_axis.is_none() && !qparams.is_per_tensor() {
            return Err(QuantError::InvalidConfig(format!(
                "{} scales need a channel axis",
                qparams.len()
            )));
        }
        if let Some(s) = qparams.scale.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(QuantError::InvalidConfig(format!(
                "scale must be positive and finite, got {s}"
            )));
        }
        Ok(Self {
            qparams,
            ch_axis,
            ste: SteMode::default(),
        })
    }

    pub fn from_qdesc(qparams: QParams, qdesc: &QDescriptor) -> Result<Self> {
        let ch_axis = if qdesc.is_perchannel() {
            qdesc.ch_axis()
        } else {
            None
        };
        Self::new(qparams, ch_axis)
    }

    pub fn with_ste(mut self, ste: SteMode) -> Self {
        self.ste = ste;
        self
    }

    pub fn qparams(&self) -> &QParams {
        &self.qparams
    }

    pub fn scale(&self) -> &[f32] {
        &self.qparams.scale
    }

    pub fn zero_point(&self) -> &[i32] {
        &self.qparams.zero_point
    }

    pub fn qrange(&self) -> QRange {
        self.qparams.qrange
    }

    pub fn ste(&self) -> SteMode {
        self.ste
    }

    fn channel_layout(&self, shape: &[usize]) -> Result<Option<AxisLayout>> {
        let Some(axis) = self.ch_axis else {
            return Ok(None);
        };
        let layout = AxisLayout::new(shape, axis)?;
        if layout.channels != self.qparams.len() {
            return Err(QuantError::ShapeMismatch {
                expected: vec![self.qparams.len()],
                actual: vec![layout.channels],
            });
        }
        Ok(Some(layout))
    }

    /// Apply `f(x, scale, zero_point)` to every element with its unit's
    /// parameters.
    fn map_elements<T, F>(&self, data: &[f32], shape: &[usize], f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(f32, f32, i32) -> T + Sync,
    {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(QuantError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        let layout = self.channel_layout(shape)?;
        let QParams {
            scale, zero_point, ..
        } = &self.qparams;

        let op = |(i, &x): (usize, &f32)| {
            let c = layout.map_or(0, |l| l.channel_of(i));
            f(x, scale[c], zero_point[c])
        };
        Ok(if data.len() >= PARALLEL_THRESHOLD {
            data.par_iter().enumerate().map(op).collect()
        } else {
            data.iter().enumerate().map(op).collect()
        })
    }

    /// Quantize-dequantize a raw buffer of the given shape.
    pub fn apply(&self, data: &[f32], shape: &[usize]) -> Result<Vec<f32>> {
        let qrange = self.qrange();
        self.map_elements(data, shape, |x, s, z| fake_quantize_value(x, s, z, qrange))
    }

    /// Integer codes for integer-only deployment.
    pub fn quantize_to_int(&self, data: &[f32], shape: &[usize]) -> Result<Vec<i32>> {
        let QRange { qmin, qmax } = self.qrange();
        self.map_elements(data, shape, |x, s, z| {
            raw_code(x, s, z).clamp(qmin as f32, qmax as f32) as i32
        })
    }

    /// Fake-quantize a tensor, recording the STE backward on the tape.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (result, mask) = {
            let data = input.data();
            let result = self.apply(&data, input.shape())?;
            let mask = match self.ste {
                SteMode::Clipped if input.requires_grad => {
                    let QRange { qmin, qmax } = self.qrange();
                    let (lo, hi) = (qmin as f32, qmax as f32);
                    Some(self.map_elements(&data, input.shape(), |x, s, z| {
                        let q = raw_code(x, s, z);
                        q >= lo && q <= hi
                    })?)
                }
                _ => None,
            };
            (result, mask)
        };

        let mut output = Tensor::new(result, input.shape());

        if input.requires_grad {
            output.requires_grad = true;
            let input_clone = input.clone();
            let output_clone = output.clone();

            // STE: forward quantizes, backward passes through
            Tape::push_unary_op(input, &output, move || {
                if let Some(grad_output) = output_clone.grad_ref() {
                    let grad_input: Vec<f32> = match &mask {
                        Some(mask) => grad_output
                            .iter()
                            .zip(mask)
                            .map(|(&g, &keep)| if keep { g } else { 0.0 })
                            .collect(),
                        None => grad_output.to_vec(),
                    };
                    accumulate_grad(&input_clone, &grad_input);
                }
            });
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::qparams::calc_qparams_with_minmax;
    use crate::quantization::QScheme;
    use approx::assert_abs_diff_eq;

    fn uint8_minus1_to_2() -> FakeQuantize {
        let qrange = QRange::new(8, false);
        let (scale, zp) = calc_qparams_with_minmax(-1.0, 2.0, qrange, QScheme::Asymmetric);
        FakeQuantize::new(QParams::per_tensor(scale, zp, qrange), None).unwrap()
    }

    #[test]
    fn test_fake_quantize_round_trip_value() {
        let fq = uint8_minus1_to_2();
        assert_eq!(fq.zero_point(), &[85]);
        assert_eq!(fq.quantize_to_int(&[1.0], &[1]).unwrap(), vec![170]);

        let out = fq.apply(&[1.0], &[1]).unwrap();
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_output_is_bounded() {
        let fq = uint8_minus1_to_2();
        let scale = fq.scale()[0];
        let out = fq.apply(&[-50.0, -1.2, 0.3, 2.4, 1e6], &[5]).unwrap();
        let lo = (0 - 85) as f32 * scale;
        let hi = (255 - 85) as f32 * scale;
        for v in out {
            assert!(v >= lo - 1e-6 && v <= hi + 1e-6);
        }
    }

    #[test]
    fn test_grid_points_are_fixed() {
        let qrange = QRange::new(8, true);
        let fq = FakeQuantize::new(QParams::per_tensor(0.25, 0, qrange), None).unwrap();
        let grid = [-2.0, -0.25, 0.0, 0.75, 31.75];
        assert_eq!(fq.apply(&grid, &[5]).unwrap(), grid.to_vec());
    }

    #[test]
    fn test_idempotent() {
        let fq = uint8_minus1_to_2();
        let x: Vec<f32> = (0..100).map(|i| i as f32 * 0.037 - 1.5).collect();
        let once = fq.apply(&x, &[100]).unwrap();
        let twice = fq.apply(&once, &[100]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_per_channel_broadcast() {
        let qrange = QRange::new(8, true);
        let qparams = QParams {
            scale: vec![1.0, 0.5],
            zero_point: vec![0, 0],
            qrange,
        };
        let fq = FakeQuantize::new(qparams, Some(1)).unwrap();
        // [batch=2, channels=2]
        let out = fq.apply(&[0.7, 0.7, 1.3, 1.3], &[2, 2]).unwrap();
        assert_eq!(out, vec![1.0, 0.5, 1.0, 1.5]);

        assert!(matches!(
            fq.apply(&[0.0; 6], &[2, 3]),
            Err(QuantError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_params() {
        let qrange = QRange::new(8, true);
        let two = QParams {
            scale: vec![1.0, 1.0],
            zero_point: vec![0, 0],
            qrange,
        };
        assert!(FakeQuantize::new(two, None).is_err());
        assert!(FakeQuantize::new(QParams::per_tensor(0.0, 0, qrange), None).is_err());
    }

    #[test]
    fn test_ste_passes_gradient_through() {
        Tape::reset();
        let fq = uint8_minus1_to_2();
        // includes values far outside the clip range
        let x = Tensor::new(vec![-5.0, 0.3, 1.0, 7.0], &[4]).requires_grad();
        let w = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[4]);

        let y = fq.forward(&x).unwrap();
        (&y * &w).sum().backward();

        assert_eq!(x.grad().unwrap().data().as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_clipped_ste_masks_saturated() {
        Tape::reset();
        let fq = uint8_minus1_to_2().with_ste(SteMode::Clipped);
        let x = Tensor::new(vec![-5.0, 0.3, 1.0, 7.0], &[4]).requires_grad();

        fq.forward(&x).unwrap().sum().backward();

        assert_eq!(x.grad().unwrap().data().as_slice(), &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_forward_without_grad_records_nothing() {
        Tape::reset();
        let fq = uint8_minus1_to_2();
        let x = Tensor::new(vec![0.5, 1.5], &[2]);
        let y = fq.forward(&x).unwrap();

        assert!(!y.requires_grad);
        assert!(Tape::is_empty());
    }

    #[test]
    fn test_parallel_path_matches_scalar() {
        let fq = uint8_minus1_to_2();
        let n = PARALLEL_THRESHOLD * 2;
        let x: Vec<f32> = (0..n).map(|i| ((i % 1000) as f32 / 250.0) - 2.0).collect();
        let out = fq.apply(&x, &[n]).unwrap();
        let qrange = fq.qrange();
        for (o, &v) in out.iter().zip(&x) {
            assert_eq!(*o, fake_quantize_value(v, fq.scale()[0], 85, qrange));
        }
    }

    #[test]
    fn test_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FakeQuantize>();
    }
}
