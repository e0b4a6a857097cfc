use crate::error::{QuantError, Result};
use crate::layout::{gather_channels, AxisLayout};
use crate::{tape::Tape, Tensor};
use std::ops::Mul;

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape(),
            other.shape(),
            "Tensor dimensions must match"
        );

        let out_data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a * b)
            .collect();

        let mut out = Tensor::new(out_data, self.shape());

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    if a.requires_grad {
                        let ga: Vec<f32> =
                            gout.iter().zip(b.data().iter()).map(|(g, v)| g * v).collect();
                        accumulate_grad(&a, &ga);
                    }
                    if b.requires_grad {
                        let gb: Vec<f32> =
                            gout.iter().zip(a.data().iter()).map(|(g, v)| g * v).collect();
                        accumulate_grad(&b, &gb);
                    }
                }
            });
        }
        out
    }
}

/// Add `src` into the gradient buffer of `t`, allocating it on first use.
#[inline]
pub fn accumulate_grad(t: &Tensor, src: &[f32]) {
    let mut slot = t.grad.borrow_mut();
    match slot.as_mut() {
        Some(g) => {
            for (gi, &s) in g.iter_mut().zip(src.iter()) {
                *gi += s;
            }
        }
        None => *slot = Some(src.to_vec()),
    }
}

impl Tensor {
    /// Create a random tensor with values from normal distribution
    pub fn randn(shape: &[usize]) -> Tensor {
        use rand_distr::{Distribution, StandardNormal};
        let mut rng = rand::thread_rng();

        let size: usize = shape.iter().product();
        let data: Vec<f32> = (0..size).map(|_| StandardNormal.sample(&mut rng)).collect();

        Tensor::new(data, shape)
    }

    /// Select slices along `axis`: output slice `c` is input slice `index[c]`.
    ///
    /// Backward scatters the output gradient back to the selected slices.
    pub fn index_select(&self, axis: usize, index: &[usize]) -> Result<Tensor> {
        let layout = AxisLayout::new(self.shape(), axis)?;
        if let Some(&bad) = index.iter().find(|&&i| i >= layout.channels) {
            return Err(QuantError::InvalidConfig(format!(
                "index {bad} out of range for axis {axis} of size {}",
                layout.channels
            )));
        }

        let result = gather_channels(&self.data(), &layout, index);
        let mut out_shape = self.shape().to_vec();
        out_shape[axis] = index.len();
        let mut output = Tensor::new(result, &out_shape);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();
            let index = index.to_vec();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let AxisLayout {
                        outer,
                        channels,
                        inner,
                    } = layout;
                    let out_channels = index.len();
                    let mut gin = vec![0.0; layout.numel()];
                    for o in 0..outer {
                        for (c, &src_c) in index.iter().enumerate() {
                            let src = (o * channels + src_c) * inner;
                            let dst = (o * out_channels + c) * inner;
                            for k in 0..inner {
                                gin[src + k] += gout[dst + k];
                            }
                        }
                    }
                    accumulate_grad(&input, &gin);
                }
            });
        }

        Ok(output)
    }
}
