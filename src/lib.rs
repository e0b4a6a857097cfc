pub mod error;
pub mod layout;
pub mod ops;
pub mod quantization;
pub mod tape;
pub mod tensor;

pub use error::{QuantError, Result};
pub use quantization::{
    ChannelPermutation, FakeQuantize, Granularity, Observer, ObserverKind, QDescriptor, QParams,
    QuantizationConfig, Quantizer, QuantizerKind, Range, UniformQuantizer,
};
pub use tape::Tape;
pub use tensor::Tensor;
