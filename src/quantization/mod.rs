//! Post-training quantization: calibration observers and fake quantization.
//!
//! A quantized site goes through three phases. While observing, calibration
//! batches are cached by its observer. Finalizing turns the cache into a
//! clipping range and then into scale / zero-point. From then on the site
//! fake-quantizes every input with those fixed parameters.

pub mod cache;
pub mod config;
pub mod fake_quantize;
pub mod observers;
pub mod permutation;
pub mod qparams;
pub mod quantizers;

pub use cache::{CalibrationCache, CalibrationView};
pub use config::{Granularity, QDescriptor, QScheme, QuantizationConfig};
pub use fake_quantize::{FakeQuantize, SteMode};
pub use observers::{
    AciqObserver, AnyObserver, Hypothesis, MinMaxObserver, Observer, ObserverKind, Range,
};
pub use permutation::ChannelPermutation;
pub use qparams::{calc_qparams_with_minmax, QParams, QRange};
pub use quantizers::{Quantizer, QuantizerKind, UniformQuantizer};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;

    #[test]
    fn test_config_to_quantizer() {
        let config = QuantizationConfig::default().with_bit(8);
        let mut q = UniformQuantizer::from_config(&config).unwrap();
        q.observe(&Tensor::new(vec![0.0, 1.0, 2.0, 3.0], &[4])).unwrap();

        let qparams = q.calibrate().unwrap();
        assert!(qparams.is_per_tensor());
        assert_eq!(qparams.zero_point, vec![0]);
        assert!(q.is_calibrated());
    }
}
