//! ACIQ observer
//!
//! Fits three clipping hypotheses to the calibration data and keeps, per unit,
//! the one with the lowest reconstruction error:
//!
//! * naive: the observed min/max;
//! * Gaussian: a standard deviation estimated from the observed spread,
//!   scaled by a bit-width dependent clipping multiplier;
//! * Laplace: the mean absolute deviation, scaled the same way.
//!
//! Selection is layered: Gaussian vs Laplace first, then naive replaces the
//! result wherever it beats the *Gaussian* error. Naive can therefore replace
//! a Laplace pick whose error was lower than its own.

use std::f32::consts::PI;

use tracing::debug;

use super::utils::{anchor_non_negative, clip_round_trip, mse_loss, row_extrema};
use super::{Observer, ObserverBase, Range};
use crate::error::{QuantError, Result};
use crate::quantization::cache::CalibrationView;
use crate::quantization::config::{Granularity, QDescriptor, QScheme};
use crate::quantization::qparams::QParams;

/// Clipping multipliers indexed by bit-width, starting at `first_bit`.
struct AlphaTable {
    first_bit: u32,
    values: &'static [f32],
}

impl AlphaTable {
    fn get(&self, bit: u32) -> Result<f32> {
        bit.checked_sub(self.first_bit)
            .and_then(|i| self.values.get(i as usize))
            .copied()
            .ok_or(QuantError::UnsupportedBitWidth {
                bit,
                estimator: "aciq",
            })
    }
}

const ALPHA_GAUS: AlphaTable = AlphaTable {
    first_bit: 1,
    values: &[1.24, 1.71, 2.15, 2.55, 2.93, 3.28, 3.61, 3.92],
};

const ALPHA_GAUS_POSITIVE: AlphaTable = AlphaTable {
    first_bit: 1,
    values: &[1.71, 2.15, 2.55, 2.93, 3.28, 3.61, 3.92, 4.2],
};

const ALPHA_LAPLACE: AlphaTable = AlphaTable {
    first_bit: 0,
    values: &[1.05, 1.86, 2.83, 3.89, 5.03, 6.2, 7.41, 8.64, 9.89],
};

const ALPHA_LAPLACE_POSITIVE: AlphaTable = AlphaTable {
    first_bit: 0,
    values: &[1.86, 2.83, 3.89, 5.02, 6.2, 7.41, 8.64, 9.89, 11.16],
};

/// `0.5 * 0.35 * (1 + sqrt(pi * ln 4))`, the range-to-std factor.
fn gaus_const() -> f32 {
    (0.5 * 0.35) * (1.0 + (PI * 4f32.ln()).sqrt())
}

/// Clipping hypothesis picked for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypothesis {
    Naive,
    Gaussian,
    Laplace,
}

/// Pick a hypothesis from its three reconstruction errors.
///
/// Gaussian wins over Laplace only when strictly better; naive then replaces
/// the pick wherever it is strictly better than Gaussian.
pub fn select_hypothesis(mse_naive: f32, mse_gaus: f32, mse_laplace: f32) -> Hypothesis {
    let initial = if mse_gaus < mse_laplace {
        Hypothesis::Gaussian
    } else {
        Hypothesis::Laplace
    };
    if mse_naive < mse_gaus {
        Hypothesis::Naive
    } else {
        initial
    }
}

/// Candidate range with its per-unit reconstruction error.
struct Candidate {
    min_val: Vec<f32>,
    max_val: Vec<f32>,
    mse: Vec<f32>,
}

#[derive(Debug)]
pub struct AciqObserver {
    base: ObserverBase,
    selection: Vec<Hypothesis>,
}

impl AciqObserver {
    pub fn new(qdesc: QDescriptor) -> Result<Self> {
        Ok(Self {
            base: ObserverBase::new(qdesc)?,
            selection: Vec::new(),
        })
    }

    /// Hypothesis chosen for each unit by the last `calc_minmax`.
    pub fn selection(&self) -> &[Hypothesis] {
        &self.selection
    }

    /// Lower bound paired with a symmetric upper bound on a signed grid:
    /// `-(max / (2^(b-1) - 1)) * 2^(b-1)`.
    fn signed_min(max_val: f32, bit: u32) -> f32 {
        let half = (1u64 << (bit - 1)) as f32;
        if half > 1.0 {
            -(max_val / (half - 1.0)) * half
        } else {
            -max_val
        }
    }

    /// Turn per-unit clip magnitudes into a range, anchoring non-negative
    /// units at zero.
    fn clip_bounds(
        bound: &[f32],
        non_negative: &[bool],
        positive: &AlphaTable,
        general: &AlphaTable,
        bit: u32,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let alpha_pos = positive.get(bit)?;
        let alpha = general.get(bit)?;
        let mut min_val = Vec::with_capacity(bound.len());
        let mut max_val = Vec::with_capacity(bound.len());
        for (&b, &nonneg) in bound.iter().zip(non_negative) {
            if nonneg {
                max_val.push(alpha_pos * b);
                min_val.push(0.0);
            } else {
                let hi = alpha * b;
                max_val.push(hi);
                min_val.push(Self::signed_min(hi, bit));
            }
        }
        Ok((min_val, max_val))
    }

    fn laplace_minmax(
        &self,
        view: &CalibrationView,
        non_negative: &[bool],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let b: Vec<f32> = view
            .iter_rows()
            .map(|row| {
                let n = row.len().max(1) as f32;
                let mean = row.iter().sum::<f32>() / n;
                row.iter().map(|x| (x - mean).abs()).sum::<f32>() / n
            })
            .collect();
        Self::clip_bounds(
            &b,
            non_negative,
            &ALPHA_LAPLACE_POSITIVE,
            &ALPHA_LAPLACE,
            self.qdesc().bit(),
        )
    }

    fn gaus_minmax(
        &self,
        view: &CalibrationView,
        non_negative: &[bool],
        batch_size: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let (lo, hi) = row_extrema(view);
        let mut n = view.numel() as f32;
        if self.qdesc().granularity() == Granularity::Channelwise
            && self.qdesc().ch_axis().is_some_and(|axis| axis > 0)
        {
            n /= batch_size.max(1) as f32;
        }
        let denom = (2.0 * n.ln()).sqrt();
        let c = gaus_const();
        let std: Vec<f32> = lo
            .iter()
            .zip(&hi)
            .map(|(l, h)| if denom > 0.0 { (h - l) * c / denom } else { 0.0 })
            .collect();
        Self::clip_bounds(
            &std,
            non_negative,
            &ALPHA_GAUS_POSITIVE,
            &ALPHA_GAUS,
            self.qdesc().bit(),
        )
    }

    fn naive_minmax(view: &CalibrationView) -> (Vec<f32>, Vec<f32>) {
        let (mut lo, hi) = row_extrema(view);
        anchor_non_negative(&mut lo);
        (lo, hi)
    }

    /// Reconstruction error of a candidate range at its asymmetric scale.
    fn evaluate(
        &self,
        view: &CalibrationView,
        (min_val, max_val): (Vec<f32>, Vec<f32>),
    ) -> Candidate {
        let range = Range { min_val, max_val };
        let qparams =
            QParams::from_range_with_scheme(&range, self.qdesc().qrange(), QScheme::Asymmetric);
        let pred = clip_round_trip(view, &range.min_val, &range.max_val, &qparams.scale);
        let mse = mse_loss(&pred, view, self.qdesc().granularity());
        Candidate {
            min_val: range.min_val,
            max_val: range.max_val,
            mse,
        }
    }
}

impl Observer for AciqObserver {
    fn base(&self) -> &ObserverBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObserverBase {
        &mut self.base
    }

    fn calc_minmax(&mut self) -> Result<Range> {
        let bit = self.qdesc().bit();
        // fail on the tables before touching the data
        ALPHA_GAUS.get(bit)?;
        ALPHA_LAPLACE.get(bit)?;

        let granularity = self.qdesc().granularity();
        let batch_size = self.cache().batch_size();
        let view = self.cache().get_data_for_calibration(granularity)?;
        let non_negative: Vec<bool> = row_extrema(&view)
            .0
            .iter()
            .map(|&lo| lo >= 0.0)
            .collect();

        let laplace = self.laplace_minmax(&view, &non_negative)?;
        let laplace = self.evaluate(&view, laplace);
        let gaus = self.gaus_minmax(&view, &non_negative, batch_size)?;
        let gaus = self.evaluate(&view, gaus);
        let naive = self.evaluate(&view, Self::naive_minmax(&view));

        let units = view.rows();
        let mut selection = Vec::with_capacity(units);
        let mut min_val = Vec::with_capacity(units);
        let mut max_val = Vec::with_capacity(units);
        for u in 0..units {
            let e = |c: &Candidate| c.mse[u];
            let pick = select_hypothesis(e(&naive), e(&gaus), e(&laplace));
            let chosen = match pick {
                Hypothesis::Naive => &naive,
                Hypothesis::Gaussian => &gaus,
                Hypothesis::Laplace => &laplace,
            };
            selection.push(pick);
            min_val.push(chosen.min_val[u]);
            max_val.push(chosen.max_val[u]);
        }
        debug!(
            units,
            naive = selection.iter().filter(|h| **h == Hypothesis::Naive).count(),
            gaussian = selection.iter().filter(|h| **h == Hypothesis::Gaussian).count(),
            laplace = selection.iter().filter(|h| **h == Hypothesis::Laplace).count(),
            "aciq hypothesis selection"
        );

        self.cache_mut().reset();
        self.selection = selection;
        let range = Range { min_val, max_val };
        self.base.range = Some(range.clone());
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;
    use approx::assert_abs_diff_eq;

    fn observed(qdesc: QDescriptor, data: Vec<f32>, shape: &[usize]) -> AciqObserver {
        let mut obs = AciqObserver::new(qdesc).unwrap();
        obs.observe(&Tensor::new(data, shape)).unwrap();
        obs
    }

    #[test]
    fn test_gaus_const() {
        assert_abs_diff_eq!(gaus_const(), 0.5093, epsilon = 1e-3);
    }

    #[test]
    fn test_alpha_tables() {
        assert_eq!(ALPHA_LAPLACE.get(0).unwrap(), 1.05);
        assert_eq!(ALPHA_LAPLACE.get(8).unwrap(), 9.89);
        assert_eq!(ALPHA_LAPLACE_POSITIVE.get(3).unwrap(), 5.02);
        assert_eq!(ALPHA_GAUS.get(4).unwrap(), 2.55);
        assert_eq!(ALPHA_GAUS_POSITIVE.get(8).unwrap(), 4.2);
        assert!(ALPHA_GAUS.get(0).is_err());
        assert!(ALPHA_LAPLACE.get(9).is_err());
    }

    #[test]
    fn test_selection_layering() {
        // gaussian worse than laplace, naive worse than gaussian
        assert_eq!(select_hypothesis(0.7, 0.5, 0.3), Hypothesis::Laplace);
        // naive beats gaussian but not laplace: naive still replaces laplace
        assert_eq!(select_hypothesis(0.4, 0.5, 0.1), Hypothesis::Naive);
        // naive beats laplace but not gaussian: gaussian kept
        assert_eq!(select_hypothesis(0.3, 0.2, 0.4), Hypothesis::Gaussian);
        // ties fall to laplace, and naive needs to be strictly better
        assert_eq!(select_hypothesis(0.5, 0.5, 0.5), Hypothesis::Laplace);
    }

    #[test]
    fn test_signed_min() {
        assert_abs_diff_eq!(AciqObserver::signed_min(127.0, 8), -128.0, epsilon = 1e-4);
        assert_abs_diff_eq!(AciqObserver::signed_min(7.0, 4), -8.0, epsilon = 1e-6);
        assert_eq!(AciqObserver::signed_min(1.0, 1), -1.0);
    }

    #[test]
    fn test_unsupported_bit_width_keeps_cache() {
        let qdesc = QDescriptor::layerwise(9);
        let mut obs = observed(qdesc, vec![1.0, -1.0], &[2]);
        assert_eq!(
            obs.calc_minmax(),
            Err(QuantError::UnsupportedBitWidth {
                bit: 9,
                estimator: "aciq"
            })
        );
        assert_eq!(obs.cache().len(), 1);
    }

    #[test]
    fn test_layerwise_range_is_ordered() {
        let data: Vec<f32> = (0..256).map(|i| ((i * 37 % 101) as f32 - 50.0) / 10.0).collect();
        let mut obs = observed(QDescriptor::layerwise(4), data, &[256]);
        let range = obs.calc_minmax().unwrap();

        assert_eq!(range.len(), 1);
        assert!(range.min_val[0] <= range.max_val[0]);
        assert_eq!(obs.selection().len(), 1);
        assert!(obs.cache().is_empty());
    }

    #[test]
    fn test_non_negative_channels_anchor_at_zero() {
        // channel 0 non-negative, channel 1 mixed sign; axis 1, batch 64
        let mut data = Vec::new();
        for i in 0..64 {
            let t = i as f32 / 63.0;
            data.push(t * t * 3.0);
            data.push(t * 2.0 - 1.0);
        }
        let mut obs = observed(QDescriptor::channelwise(8, 1), data, &[64, 2]);
        let range = obs.calc_minmax().unwrap();

        assert_eq!(range.min_val[0], 0.0);
        assert!(range.min_val[1] < 0.0);
        for (lo, hi) in range.iter() {
            assert!(lo <= hi);
        }
        assert_eq!(obs.selection().len(), 2);
    }

    /// Quantiles of a unit Laplace distribution.
    fn laplace_quantiles(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let u = (i as f32 + 0.5) / n as f32 - 0.5;
                -u.signum() * (1.0 - 2.0 * u.abs()).ln()
            })
            .collect()
    }

    /// Sum of six well-spread pseudo-uniform draws per sample: bell shaped,
    /// light tails.
    fn bell_samples(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                (1..=6)
                    .map(|k| ((i * k * 7919) % 1000) as f32 / 1000.0 - 0.5)
                    .sum::<f32>()
            })
            .collect()
    }

    #[test]
    fn test_heavy_tails_select_laplace() {
        let data = laplace_quantiles(256);
        let n = data.len() as f32;
        let mean = data.iter().sum::<f32>() / n;
        let b = data.iter().map(|x| (x - mean).abs()).sum::<f32>() / n;

        let mut obs = observed(QDescriptor::layerwise(2), data, &[256]);
        let range = obs.calc_minmax().unwrap();

        assert_eq!(obs.selection(), &[Hypothesis::Laplace]);
        // alpha_laplace[2] * b, and the signed lower bound -(max / 1) * 2
        let max = 2.83 * b;
        assert_abs_diff_eq!(range.max_val[0], max, epsilon = 1e-4);
        assert_abs_diff_eq!(range.min_val[0], -2.0 * max, epsilon = 1e-4);
    }

    #[test]
    fn test_light_tails_select_gaussian() {
        let data = bell_samples(256);
        let (lo, hi) = data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(l, h), &x| (l.min(x), h.max(x)));

        let mut obs = observed(QDescriptor::layerwise(4), data, &[256]);
        let range = obs.calc_minmax().unwrap();

        assert_eq!(obs.selection(), &[Hypothesis::Gaussian]);
        let std = (hi - lo) * gaus_const() / (2.0 * 256f32.ln()).sqrt();
        // alpha_gaus[4] * std, and the signed lower bound -(max / 7) * 8
        let max = 2.55 * std;
        assert_abs_diff_eq!(range.max_val[0], max, epsilon = 1e-4);
        assert_abs_diff_eq!(range.min_val[0], -(max / 7.0) * 8.0, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_length_batch_is_empty_cache() {
        let mut obs = observed(QDescriptor::channelwise(8, 1), vec![], &[0, 3]);
        assert_eq!(obs.calc_minmax(), Err(QuantError::EmptyCache));
        assert!(obs.selection().is_empty());
        assert!(obs.range().is_none());
    }

    #[test]
    fn test_constant_data_selects_naive() {
        // zero spread collapses both fitted ranges to [0, 0]
        let mut obs = observed(QDescriptor::layerwise(4), vec![0.5; 32], &[32]);
        let range = obs.calc_minmax().unwrap();

        assert_eq!(obs.selection(), &[Hypothesis::Naive]);
        assert_eq!(range.min_val, vec![0.0]);
        assert_eq!(range.max_val, vec![0.5]);
    }
}
