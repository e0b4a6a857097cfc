//! Channel permutation for grouped channel-wise quantization.
//!
//! A grouping pass reorders channels so that similar ones sit next to each
//! other; ranges are then shared over contiguous blocks of the reordered
//! channels. `perm[i]` is the original channel placed at position `i`, and
//! `inv_perm` maps it back.

use crate::error::{QuantError, Result};
use crate::Tensor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPermutation {
    perm: Vec<usize>,
    inv_perm: Vec<usize>,
}

impl ChannelPermutation {
    /// Build from a forward permutation, rejecting anything that is not a
    /// bijection on `0..perm.len()`.
    pub fn new(perm: Vec<usize>) -> Result<Self> {
        let n = perm.len();
        let mut inv_perm = vec![usize::MAX; n];
        for (i, &p) in perm.iter().enumerate() {
            if p >= n {
                return Err(QuantError::InvalidPermutation(format!(
                    "index {p} out of range for {n} channels"
                )));
            }
            if inv_perm[p] != usize::MAX {
                return Err(QuantError::InvalidPermutation(format!(
                    "channel {p} appears more than once"
                )));
            }
            inv_perm[p] = i;
        }
        Ok(Self { perm, inv_perm })
    }

    pub fn identity(channels: usize) -> Self {
        let perm: Vec<usize> = (0..channels).collect();
        Self {
            inv_perm: perm.clone(),
            perm,
        }
    }

    /// Order channels by ascending `keys` (stable), so channels with similar
    /// keys become neighbours.
    pub fn sorted_by(keys: &[f32]) -> Self {
        let mut perm: Vec<usize> = (0..keys.len()).collect();
        perm.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
        let mut inv_perm = vec![0; perm.len()];
        for (i, &p) in perm.iter().enumerate() {
            inv_perm[p] = i;
        }
        Self { perm, inv_perm }
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn inv_perm(&self) -> &[usize] {
        &self.inv_perm
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    fn check(&self, input: &Tensor, axis: usize) -> Result<()> {
        match input.shape().get(axis) {
            None => Err(QuantError::AxisOutOfRange {
                axis,
                ndim: input.ndim(),
            }),
            Some(&c) if c != self.len() => Err(QuantError::ShapeMismatch {
                expected: vec![self.len()],
                actual: vec![c],
            }),
            Some(_) => Ok(()),
        }
    }

    /// Reorder `input` along `axis` into grouped order.
    pub fn apply(&self, input: &Tensor, axis: usize) -> Result<Tensor> {
        self.check(input, axis)?;
        input.index_select(axis, &self.perm)
    }

    /// Undo `apply`.
    pub fn restore(&self, input: &Tensor, axis: usize) -> Result<Tensor> {
        self.check(input, axis)?;
        input.index_select(axis, &self.inv_perm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_is_computed() {
        let p = ChannelPermutation::new(vec![2, 0, 3, 1]).unwrap();
        assert_eq!(p.inv_perm(), &[1, 3, 0, 2]);
        for (i, &f) in p.perm().iter().enumerate() {
            assert_eq!(p.inv_perm()[f], i);
        }
    }

    #[test]
    fn test_rejects_non_bijection() {
        assert!(matches!(
            ChannelPermutation::new(vec![0, 0, 1]),
            Err(QuantError::InvalidPermutation(_))
        ));
        assert!(matches!(
            ChannelPermutation::new(vec![0, 3, 1]),
            Err(QuantError::InvalidPermutation(_))
        ));
    }

    #[test]
    fn test_sorted_by_groups_similar_channels() {
        let p = ChannelPermutation::sorted_by(&[5.0, 0.1, 4.9, 0.2]);
        assert_eq!(p.perm(), &[1, 3, 2, 0]);
        assert_eq!(p, ChannelPermutation::new(vec![1, 3, 2, 0]).unwrap());
    }

    #[test]
    fn test_apply_then_restore() {
        let p = ChannelPermutation::new(vec![1, 2, 0]).unwrap();
        let x = Tensor::new((0..6).map(|v| v as f32).collect(), &[2, 3]);

        let y = p.apply(&x, 1).unwrap();
        assert_eq!(y.data().as_slice(), &[1.0, 2.0, 0.0, 4.0, 5.0, 3.0]);

        let z = p.restore(&y, 1).unwrap();
        assert_eq!(z.data().as_slice(), x.data().as_slice());
    }

    #[test]
    fn test_apply_checks_channel_count() {
        let p = ChannelPermutation::identity(4);
        let x = Tensor::new(vec![0.0; 6], &[2, 3]);
        assert!(matches!(
            p.apply(&x, 1),
            Err(QuantError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            p.apply(&x, 2),
            Err(QuantError::AxisOutOfRange { .. })
        ));
    }
}
