//! Quantizers tie an observer to the fake quantization op.

pub mod uniform;

use std::fmt;
use std::str::FromStr;

pub use uniform::UniformQuantizer;

use super::observers::AnyObserver;
use super::qparams::QParams;
use crate::error::{QuantError, Result};
use crate::Tensor;

/// A quantized tensor site: observe, calibrate, then fake-quantize.
pub trait Quantizer {
    /// Calibration hook for one batch.
    fn observe(&mut self, batch: &Tensor) -> Result<()>;

    /// Finalize the range and quantization parameters.
    fn calibrate(&mut self) -> Result<&QParams>;

    /// Quantize-dequantize `x`; the output has the shape of `x`.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Parameters for export, once calibrated.
    fn qparams(&self) -> Option<&QParams>;
}

/// Registered quantizer strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizerKind {
    Uniform,
}

/// Name table for quantizer lookup.
pub const QUANTIZER_REGISTRY: &[(&str, QuantizerKind)] = &[("uniform", QuantizerKind::Uniform)];

impl QuantizerKind {
    pub fn name(self) -> &'static str {
        match self {
            QuantizerKind::Uniform => "uniform",
        }
    }

    pub fn build(self, observer: AnyObserver) -> UniformQuantizer {
        match self {
            QuantizerKind::Uniform => UniformQuantizer::new(observer),
        }
    }
}

impl FromStr for QuantizerKind {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.to_ascii_lowercase();
        QUANTIZER_REGISTRY
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| QuantError::UnknownStrategy(s.to_string()))
    }
}

impl fmt::Display for QuantizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantizer_registry() {
        assert_eq!("uniform".parse::<QuantizerKind>().unwrap(), QuantizerKind::Uniform);
        assert_eq!(QuantizerKind::Uniform.to_string(), "uniform");
        assert!(matches!(
            "lsq".parse::<QuantizerKind>(),
            Err(QuantError::UnknownStrategy(_))
        ));
    }
}
