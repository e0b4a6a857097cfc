//! Scale / zero-point derivation from a clipping range.

use serde::{Deserialize, Serialize};

use super::config::{QDescriptor, QScheme};
use super::observers::Range;

/// Smallest scale handed out; degenerate ranges (`max == min`) land here.
pub const SCALE_EPS: f32 = f32::EPSILON;

/// Inclusive integer grid `[qmin, qmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QRange {
    pub qmin: i32,
    pub qmax: i32,
}

impl QRange {
    pub fn new(bit: u32, signed: bool) -> Self {
        let levels = 1i64 << bit;
        let (qmin, qmax) = if signed {
            (-(levels / 2), levels / 2 - 1)
        } else {
            (0, levels - 1)
        };
        Self {
            qmin: qmin as i32,
            qmax: qmax as i32,
        }
    }

    /// Number of steps between the ends of the grid.
    pub fn span(&self) -> f32 {
        (self.qmax - self.qmin) as f32
    }

    /// Upper middle code, the zero point of an unsigned symmetric grid.
    pub fn midpoint(&self) -> i32 {
        (self.qmin + self.qmax + 1) / 2
    }
}

/// Map one `(min, max)` pair to `(scale, zero_point)`.
pub fn calc_qparams_with_minmax(
    min_val: f32,
    max_val: f32,
    qrange: QRange,
    scheme: QScheme,
) -> (f32, i32) {
    let QRange { qmin, qmax } = qrange;
    match scheme {
        QScheme::Asymmetric => {
            let scale = ((max_val - min_val) / qrange.span()).max(SCALE_EPS);
            let zero_point = (qmin as f32 - min_val / scale).round_ties_even();
            let zero_point = zero_point.clamp(qmin as f32, qmax as f32) as i32;
            (scale, zero_point)
        }
        QScheme::Symmetric => {
            let max_abs = min_val.abs().max(max_val.abs());
            let zero_point = if qmin < 0 { 0 } else { qrange.midpoint() };
            let steps = (qmax - zero_point).max(1) as f32;
            ((max_abs / steps).max(SCALE_EPS), zero_point)
        }
    }
}

/// Quantization parameters for one site, one entry per range unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    pub scale: Vec<f32>,
    pub zero_point: Vec<i32>,
    pub qrange: QRange,
}

impl QParams {
    pub fn per_tensor(scale: f32, zero_point: i32, qrange: QRange) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![zero_point],
            qrange,
        }
    }

    /// Derive parameters for every unit of `range` under `qdesc`.
    pub fn from_range(range: &Range, qdesc: &QDescriptor) -> Self {
        Self::from_range_with_scheme(range, qdesc.qrange(), qdesc.scheme())
    }

    pub fn from_range_with_scheme(range: &Range, qrange: QRange, scheme: QScheme) -> Self {
        let (scale, zero_point) = range
            .iter()
            .map(|(lo, hi)| calc_qparams_with_minmax(lo, hi, qrange, scheme))
            .unzip();
        Self {
            scale,
            zero_point,
            qrange,
        }
    }

    pub fn len(&self) -> usize {
        self.scale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scale.is_empty()
    }

    pub fn is_per_tensor(&self) -> bool {
        self.scale.len() == 1
    }
}
