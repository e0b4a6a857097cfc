//! Exact min/max observer, optionally sharing ranges across channel groups.

use tracing::warn;

use super::utils::{anchor_non_negative, extrema, row_extrema};
use super::{Observer, ObserverBase, Range};
use crate::error::Result;
use crate::quantization::cache::CalibrationView;
use crate::quantization::config::{Granularity, QDescriptor};

#[derive(Debug)]
pub struct MinMaxObserver {
    base: ObserverBase,
    effective_groups: Option<usize>,
}

impl MinMaxObserver {
    pub fn new(qdesc: QDescriptor) -> Result<Self> {
        Ok(Self {
            base: ObserverBase::new(qdesc)?,
            effective_groups: None,
        })
    }

    /// Group count used by the last channelwise `calc_minmax`, after any
    /// fallback to one group per channel.
    pub fn effective_groups(&self) -> Option<usize> {
        self.effective_groups
    }

    /// Extrema over `groups` contiguous blocks of rows, broadcast back so
    /// every channel in a block carries the block's range.
    fn grouped_extrema(view: &CalibrationView, groups: usize) -> (Vec<f32>, Vec<f32>) {
        let channels = view.rows();
        let group_size = channels / groups;
        let block = group_size * view.cols();

        let mut min_val = Vec::with_capacity(channels);
        let mut max_val = Vec::with_capacity(channels);
        for chunk in view.data().chunks(block.max(1)).take(groups) {
            let (lo, hi) = extrema(chunk);
            min_val.extend(std::iter::repeat(lo).take(group_size));
            max_val.extend(std::iter::repeat(hi).take(group_size));
        }
        (min_val, max_val)
    }
}

impl Observer for MinMaxObserver {
    fn base(&self) -> &ObserverBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObserverBase {
        &mut self.base
    }

    fn calc_minmax(&mut self) -> Result<Range> {
        let granularity = self.qdesc().granularity();
        let view = self.cache().get_data_for_calibration(granularity)?;

        let (mut min_val, max_val) = match granularity {
            Granularity::Layerwise => {
                let (lo, hi) = extrema(view.data());
                (vec![lo], vec![hi])
            }
            Granularity::Channelwise => {
                let channels = view.rows();
                let groups = match self.qdesc().groups() {
                    Some(groups) if channels % groups != 0 => {
                        warn!(
                            channels,
                            groups,
                            "channels is not a multiple of groups, using one group per channel"
                        );
                        channels
                    }
                    Some(groups) => groups,
                    None => channels,
                };
                self.effective_groups = Some(groups);
                if groups == channels {
                    row_extrema(&view)
                } else {
                    Self::grouped_extrema(&view, groups)
                }
            }
        };
        anchor_non_negative(&mut min_val);

        self.cache_mut().reset();
        let range = Range { min_val, max_val };
        self.base.range = Some(range.clone());
        Ok(range)
    }
}
