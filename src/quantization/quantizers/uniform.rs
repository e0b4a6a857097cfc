//! Uniform affine quantizer.

use tracing::debug;

use super::Quantizer;
use crate::error::{QuantError, Result};
use crate::quantization::config::{QDescriptor, QuantizationConfig};
use crate::quantization::fake_quantize::{FakeQuantize, SteMode};
use crate::quantization::observers::{AnyObserver, Observer};
use crate::quantization::permutation::ChannelPermutation;
use crate::quantization::qparams::QParams;
use crate::Tensor;

/// Uniform quantizer over one observer.
///
/// Until `calibrate` is called, batches go to the observer. Afterwards the
/// quantizer holds a fixed `FakeQuantize` and `forward` applies it, routing
/// through the observer's channel permutation when one is installed.
#[derive(Debug)]
pub struct UniformQuantizer {
    observer: AnyObserver,
    fake_quant: Option<FakeQuantize>,
    ste: SteMode,
    enabled: bool,
}

impl UniformQuantizer {
    pub fn new(observer: AnyObserver) -> Self {
        Self {
            observer,
            fake_quant: None,
            ste: SteMode::default(),
            enabled: true,
        }
    }

    /// Build observer and quantizer from a flat config.
    pub fn from_config(config: &QuantizationConfig) -> Result<Self> {
        let qdesc = config.descriptor()?;
        let observer = config.observer_kind()?.build(qdesc)?;
        Ok(config.quantizer_kind()?.build(observer))
    }

    pub fn with_ste(mut self, ste: SteMode) -> Self {
        self.ste = ste;
        self.fake_quant = self.fake_quant.take().map(|fq| fq.with_ste(ste));
        self
    }

    pub fn qdesc(&self) -> &QDescriptor {
        self.observer.qdesc()
    }

    pub fn observer(&self) -> &AnyObserver {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut AnyObserver {
        &mut self.observer
    }

    /// Install the channel order of a grouping pass on the observer.
    pub fn set_permutation(&mut self, perm: ChannelPermutation) -> Result<()> {
        self.observer.set_permutation(perm)
    }

    /// Turn fake quantization on or off; when off `forward` is the identity.
    pub fn enable_quant(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_calibrated(&self) -> bool {
        self.fake_quant.is_some()
    }

    pub fn fake_quant(&self) -> Option<&FakeQuantize> {
        self.fake_quant.as_ref()
    }

    pub fn scale(&self) -> Option<&[f32]> {
        self.fake_quant.as_ref().map(|fq| fq.scale())
    }

    pub fn zero_point(&self) -> Option<&[i32]> {
        self.fake_quant.as_ref().map(|fq| fq.zero_point())
    }

    /// Integer codes of `x` in the original channel order.
    pub fn quantize_to_int(&self, x: &Tensor) -> Result<Vec<i32>> {
        let fq = self.fake_quant.as_ref().ok_or(QuantError::NotCalibrated)?;
        match self.permuted_axis() {
            Some((perm, axis)) => {
                let permuted = perm.apply(x, axis)?;
                let codes = fq.quantize_to_int(&permuted.data(), permuted.shape())?;
                let codes: Vec<f32> = codes.into_iter().map(|c| c as f32).collect();
                let restored = perm.restore(&Tensor::new(codes, permuted.shape()), axis)?;
                let codes = restored.data().iter().map(|&c| c as i32).collect();
                Ok(codes)
            }
            None => fq.quantize_to_int(&x.data(), x.shape()),
        }
    }

    fn permuted_axis(&self) -> Option<(&ChannelPermutation, usize)> {
        let perm = self.observer.permutation()?;
        Some((perm, self.qdesc().ch_axis()?))
    }
}

impl Quantizer for UniformQuantizer {
    fn observe(&mut self, batch: &Tensor) -> Result<()> {
        self.observer.observe(batch)
    }

    fn calibrate(&mut self) -> Result<&QParams> {
        let qparams = self.observer.calc_qparams()?;
        debug!(
            observer = %self.observer.kind(),
            units = qparams.len(),
            scale = ?qparams.scale,
            zero_point = ?qparams.zero_point,
            "quantization parameters finalized"
        );
        let fq = FakeQuantize::from_qdesc(qparams, self.observer.qdesc())?.with_ste(self.ste);
        Ok(self.fake_quant.insert(fq).qparams())
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(x.clone());
        }
        let fq = self.fake_quant.as_ref().ok_or(QuantError::NotCalibrated)?;
        match self.permuted_axis() {
            Some((perm, axis)) => {
                let permuted = perm.apply(x, axis)?;
                let quantized = fq.forward(&permuted)?;
                perm.restore(&quantized, axis)
            }
            None => fq.forward(x),
        }
    }

    fn qparams(&self) -> Option<&QParams> {
        self.fake_quant.as_ref().map(|fq| fq.qparams())
    }
}
