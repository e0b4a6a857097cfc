//! Range observers
//!
//! An observer owns the calibration cache of one quantized site and turns the
//! cached data into a clipping `Range` once calibration is over. Strategies
//! are a closed set: `minmax` and `aciq`, dispatched through `AnyObserver`.

pub mod aciq;
pub mod minmax;
pub mod utils;

use std::fmt;
use std::str::FromStr;

pub use aciq::{select_hypothesis, AciqObserver, Hypothesis};
pub use minmax::MinMaxObserver;

use super::cache::CalibrationCache;
use super::config::QDescriptor;
use super::permutation::ChannelPermutation;
use super::qparams::QParams;
use crate::error::{QuantError, Result};
use crate::Tensor;

/// Clipping range, one `(min, max)` pair per unit.
///
/// A layerwise range has a single unit; a channelwise range has one unit per
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub min_val: Vec<f32>,
    pub max_val: Vec<f32>,
}

impl Range {
    pub fn new(min_val: Vec<f32>, max_val: Vec<f32>) -> Result<Self> {
        if min_val.len() != max_val.len() {
            return Err(QuantError::ShapeMismatch {
                expected: vec![min_val.len()],
                actual: vec![max_val.len()],
            });
        }
        if let Some(i) = min_val.iter().zip(&max_val).position(|(lo, hi)| lo > hi) {
            return Err(QuantError::InvalidConfig(format!(
                "range unit {i} has min {} > max {}",
                min_val[i], max_val[i]
            )));
        }
        Ok(Self { min_val, max_val })
    }

    pub fn scalar(min_val: f32, max_val: f32) -> Result<Self> {
        Self::new(vec![min_val], vec![max_val])
    }

    pub fn len(&self) -> usize {
        self.min_val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.min_val.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.min_val.iter().copied().zip(self.max_val.iter().copied())
    }
}

/// State every observer carries: descriptor, cache, channel order and the
/// last finalized range.
#[derive(Debug)]
pub struct ObserverBase {
    qdesc: QDescriptor,
    cache: CalibrationCache,
    perm: Option<ChannelPermutation>,
    range: Option<Range>,
}

impl ObserverBase {
    pub fn new(qdesc: QDescriptor) -> Result<Self> {
        qdesc.validate()?;
        Ok(Self {
            cache: CalibrationCache::new(qdesc.ch_axis()),
            qdesc,
            perm: None,
            range: None,
        })
    }
}

/// Calibration-range estimator.
pub trait Observer {
    fn base(&self) -> &ObserverBase;

    fn base_mut(&mut self) -> &mut ObserverBase;

    /// Compute the clipping range from the cached data.
    ///
    /// Consumes the cache on success; on failure the cache is left intact.
    fn calc_minmax(&mut self) -> Result<Range>;

    fn qdesc(&self) -> &QDescriptor {
        &self.base().qdesc
    }

    fn cache(&self) -> &CalibrationCache {
        &self.base().cache
    }

    fn cache_mut(&mut self) -> &mut CalibrationCache {
        &mut self.base_mut().cache
    }

    /// Last range produced by `calc_minmax`.
    fn range(&self) -> Option<&Range> {
        self.base().range.as_ref()
    }

    fn permutation(&self) -> Option<&ChannelPermutation> {
        self.base().perm.as_ref()
    }

    /// Install the channel order produced by a grouping pass. Subsequent
    /// batches are cached in permuted order.
    fn set_permutation(&mut self, perm: ChannelPermutation) -> Result<()> {
        if self.qdesc().ch_axis().is_none() {
            return Err(QuantError::InvalidConfig(
                "channel permutation requires a channel axis".to_string(),
            ));
        }
        self.base_mut().perm = Some(perm);
        Ok(())
    }

    /// Calibration hook: cache one batch.
    fn observe(&mut self, batch: &Tensor) -> Result<()> {
        let permuted = match (self.permutation(), self.qdesc().ch_axis()) {
            (Some(perm), Some(axis)) => Some(perm.apply(batch, axis)?),
            _ => None,
        };
        self.cache_mut().add(permuted.as_ref().unwrap_or(batch))
    }

    /// Finalize the range and derive quantization parameters from it.
    fn calc_qparams(&mut self) -> Result<QParams> {
        let range = self.calc_minmax()?;
        Ok(QParams::from_range(&range, self.qdesc()))
    }
}

/// Registered observer strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverKind {
    MinMax,
    Aciq,
}

/// Name table for observer lookup.
pub const OBSERVER_REGISTRY: &[(&str, ObserverKind)] = &[
    ("minmax", ObserverKind::MinMax),
    ("aciq", ObserverKind::Aciq),
];

impl ObserverKind {
    pub fn name(self) -> &'static str {
        match self {
            ObserverKind::MinMax => "minmax",
            ObserverKind::Aciq => "aciq",
        }
    }

    pub fn build(self, qdesc: QDescriptor) -> Result<AnyObserver> {
        Ok(match self {
            ObserverKind::MinMax => AnyObserver::MinMax(MinMaxObserver::new(qdesc)?),
            ObserverKind::Aciq => AnyObserver::Aciq(AciqObserver::new(qdesc)?),
        })
    }
}

impl FromStr for ObserverKind {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.to_ascii_lowercase();
        OBSERVER_REGISTRY
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| QuantError::UnknownStrategy(s.to_string()))
    }
}

impl fmt::Display for ObserverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observer of any registered kind.
#[derive(Debug)]
pub enum AnyObserver {
    MinMax(MinMaxObserver),
    Aciq(AciqObserver),
}

impl AnyObserver {
    pub fn kind(&self) -> ObserverKind {
        match self {
            AnyObserver::MinMax(_) => ObserverKind::MinMax,
            AnyObserver::Aciq(_) => ObserverKind::Aciq,
        }
    }
}

impl Observer for AnyObserver {
    fn base(&self) -> &ObserverBase {
        match self {
            AnyObserver::MinMax(o) => o.base(),
            AnyObserver::Aciq(o) => o.base(),
        }
    }

    fn base_mut(&mut self) -> &mut ObserverBase {
        match self {
            AnyObserver::MinMax(o) => o.base_mut(),
            AnyObserver::Aciq(o) => o.base_mut(),
        }
    }

    fn calc_minmax(&mut self) -> Result<Range> {
        match self {
            AnyObserver::MinMax(o) => o.calc_minmax(),
            AnyObserver::Aciq(o) => o.calc_minmax(),
        }
    }
}

impl From<MinMaxObserver> for AnyObserver {
    fn from(o: MinMaxObserver) -> Self {
        AnyObserver::MinMax(o)
    }
}

impl From<AciqObserver> for AnyObserver {
    fn from(o: AciqObserver) -> Self {
        AnyObserver::Aciq(o)
    }
}
