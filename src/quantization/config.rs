//! Quantization configuration
//!
//! `QuantizationConfig` is the flat, deserializable form a surrounding
//! framework hands over for each quantized site. It is validated once into a
//! `QDescriptor`, the immutable description every observer and quantizer
//! works from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::observers::ObserverKind;
use super::qparams::QRange;
use super::quantizers::QuantizerKind;
use crate::error::{QuantError, Result};

/// Widest integer grid a descriptor may request.
pub const MAX_BIT_WIDTH: u32 = 16;

/// Unit over which statistics are gathered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One range for the whole tensor.
    Layerwise,
    /// One range per channel (or per channel group).
    Channelwise,
}

impl FromStr for Granularity {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "layerwise" => Ok(Granularity::Layerwise),
            "channelwise" => Ok(Granularity::Channelwise),
            _ => Err(QuantError::UnsupportedGranularity(s.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Layerwise => f.write_str("layerwise"),
            Granularity::Channelwise => f.write_str("channelwise"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QScheme {
    Symmetric,
    Asymmetric,
}

/// Immutable description of one quantized tensor site.
#[derive(Debug, Clone, PartialEq)]
pub struct QDescriptor {
    bit: u32,
    ch_axis: Option<usize>,
    granularity: Granularity,
    groups: Option<usize>,
    signed: bool,
    scheme: QScheme,
    backend: String,
}

impl QDescriptor {
    /// Per-tensor, unsigned, asymmetric descriptor.
    pub fn layerwise(bit: u32) -> Self {
        Self {
            bit,
            ch_axis: None,
            granularity: Granularity::Layerwise,
            groups: None,
            signed: false,
            scheme: QScheme::Asymmetric,
            backend: "native".to_string(),
        }
    }

    /// Per-channel descriptor over `ch_axis`, unsigned, asymmetric.
    pub fn channelwise(bit: u32, ch_axis: usize) -> Self {
        Self {
            ch_axis: Some(ch_axis),
            granularity: Granularity::Channelwise,
            ..Self::layerwise(bit)
        }
    }

    /// Share one range across `groups` contiguous blocks of channels.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_symmetric(mut self, symmetric: bool) -> Self {
        self.scheme = if symmetric {
            QScheme::Symmetric
        } else {
            QScheme::Asymmetric
        };
        self
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = backend.to_string();
        self
    }

    /// Check the descriptor is usable.
    pub fn validate(&self) -> Result<()> {
        if self.bit == 0 || self.bit > MAX_BIT_WIDTH {
            return Err(QuantError::InvalidConfig(format!(
                "bit-width must be in 1..={MAX_BIT_WIDTH}, got {}",
                self.bit
            )));
        }
        if self.granularity == Granularity::Channelwise && self.ch_axis.is_none() {
            return Err(QuantError::InvalidConfig(
                "channelwise granularity requires a channel axis".to_string(),
            ));
        }
        if self.groups == Some(0) {
            return Err(QuantError::InvalidConfig(
                "groups must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bit(&self) -> u32 {
        self.bit
    }

    pub fn ch_axis(&self) -> Option<usize> {
        self.ch_axis
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn groups(&self) -> Option<usize> {
        self.groups
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn scheme(&self) -> QScheme {
        self.scheme
    }

    pub fn is_symmetric(&self) -> bool {
        self.scheme == QScheme::Symmetric
    }

    pub fn is_perchannel(&self) -> bool {
        self.granularity == Granularity::Channelwise
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Integer grid for this bit-width and signedness.
    pub fn qrange(&self) -> QRange {
        QRange::new(self.bit, self.signed)
    }
}

/// Flat per-site configuration as supplied by the surrounding framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Observer strategy name (`minmax`, `aciq`).
    pub observer: String,
    /// Quantizer strategy name (`uniform`).
    pub quantizer: String,
    pub bit: u32,
    pub ch_axis: Option<usize>,
    pub granularity: String,
    pub groups: Option<usize>,
    pub signed: bool,
    pub symmetric: bool,
    /// Opaque kernel backend tag.
    pub backend: String,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            observer: "minmax".to_string(),
            quantizer: "uniform".to_string(),
            bit: 8,
            ch_axis: None,
            granularity: "layerwise".to_string(),
            groups: None,
            signed: false,
            symmetric: false,
            backend: "native".to_string(),
        }
    }
}

impl QuantizationConfig {
    pub fn with_observer(mut self, name: &str) -> Self {
        self.observer = name.to_string();
        self
    }

    pub fn with_bit(mut self, bit: u32) -> Self {
        self.bit = bit;
        self
    }

    /// Switch to channelwise statistics over `ch_axis`.
    pub fn with_channelwise(mut self, ch_axis: usize) -> Self {
        self.granularity = Granularity::Channelwise.to_string();
        self.ch_axis = Some(ch_axis);
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    /// Validate and convert into the canonical descriptor.
    pub fn descriptor(&self) -> Result<QDescriptor> {
        let granularity: Granularity = self.granularity.parse()?;
        let qdesc = QDescriptor {
            bit: self.bit,
            ch_axis: self.ch_axis,
            granularity,
            groups: self.groups,
            signed: self.signed,
            scheme: if self.symmetric {
                QScheme::Symmetric
            } else {
                QScheme::Asymmetric
            },
            backend: self.backend.clone(),
        };
        qdesc.validate()?;
        Ok(qdesc)
    }

    pub fn observer_kind(&self) -> Result<ObserverKind> {
        self.observer.parse()
    }

    pub fn quantizer_kind(&self) -> Result<QuantizerKind> {
        self.quantizer.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_layerwise_uint8() {
        let qdesc = QuantizationConfig::default().descriptor().unwrap();
        assert_eq!(qdesc.bit(), 8);
        assert_eq!(qdesc.granularity(), Granularity::Layerwise);
        assert!(!qdesc.is_signed());
        assert_eq!(qdesc.scheme(), QScheme::Asymmetric);
        assert_eq!(qdesc.backend(), "native");
    }

    #[test]
    fn test_config_builder() {
        let qdesc = QuantizationConfig::default()
            .with_bit(4)
            .with_channelwise(0)
            .with_groups(2)
            .with_signed(true)
            .with_symmetric(true)
            .descriptor()
            .unwrap();

        assert_eq!(qdesc.bit(), 4);
        assert_eq!(qdesc.ch_axis(), Some(0));
        assert_eq!(qdesc.groups(), Some(2));
        assert!(qdesc.is_perchannel());
        assert!(qdesc.is_signed());
        assert!(qdesc.is_symmetric());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "observer": "aciq",
            "bit": 4,
            "granularity": "CHANNELWISE",
            "ch_axis": 1,
            "signed": true
        }"#;
        let config: QuantizationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.quantizer, "uniform");

        let qdesc = config.descriptor().unwrap();
        assert_eq!(qdesc.granularity(), Granularity::Channelwise);
        assert_eq!(qdesc.ch_axis(), Some(1));
        assert_eq!(config.observer_kind().unwrap(), ObserverKind::Aciq);
    }

    #[test]
    fn test_unsupported_granularity() {
        let mut config = QuantizationConfig::default();
        config.granularity = "groupwise".to_string();
        assert_eq!(
            config.descriptor(),
            Err(QuantError::UnsupportedGranularity("groupwise".to_string()))
        );
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(QDescriptor::layerwise(0).validate().is_err());
        assert!(QDescriptor::layerwise(17).validate().is_err());
        assert!(QDescriptor::channelwise(8, 0).with_groups(0).validate().is_err());

        let mut config = QuantizationConfig::default();
        config.granularity = "channelwise".to_string();
        assert!(matches!(
            config.descriptor(),
            Err(QuantError::InvalidConfig(_))
        ));
    }
}
