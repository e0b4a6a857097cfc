use crate::tape::Tape;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<f32>>>,
    pub(crate) shape: SmallVec<[usize; 4]>,
    // In-place gradient accumulation buffer (allocated on demand)
    pub grad: Rc<RefCell<Option<Vec<f32>>>>,
    pub requires_grad: bool,
    pub tape_node: Cell<Option<usize>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data.borrow().as_slice())
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "data length does not match shape {:?}",
            shape
        );
        Tensor {
            data: Rc::new(RefCell::new(data)),
            shape: shape.iter().cloned().collect(),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: false,
            tape_node: Cell::new(None),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor::new(vec![value], &[1])
    }

    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> std::cell::Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    /// Copy of the values with no gradient tracking and fresh storage.
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.data().clone(), &self.shape)
    }

    /// Zero-copy view of gradient buffer, if present.
    pub fn grad_ref(&self) -> Option<std::cell::Ref<'_, Vec<f32>>> {
        std::cell::Ref::filter_map(self.grad.borrow(), |opt| opt.as_ref()).ok()
    }

    /// Materializes a Tensor from the grad buffer (allocates).
    pub fn grad(&self) -> Option<Rc<Tensor>> {
        let r = self.grad.borrow();
        r.as_ref().map(|g| Rc::new(Tensor::new(g.clone(), &self.shape)))
    }

    pub fn backward(&self) {
        // Seed dL/dself = 1
        let ones = vec![1.0; self.numel()];
        *self.grad.borrow_mut() = Some(ones);

        if let Some(node_id) = self.tape_node.get() {
            crate::tape::backward(node_id);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Sum of all elements
    pub fn sum(&self) -> Tensor {
        let total = self.data().iter().sum::<f32>();
        let mut output = Tensor::scalar(total);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let grad_vec = vec![gout[0]; input.numel()];
                    crate::ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }

    /// Mean of all elements
    pub fn mean(&self) -> Tensor {
        let n = self.numel() as f32;
        let mean_val = self.data().iter().sum::<f32>() / n;
        let mut output = Tensor::scalar(mean_val);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    // Each element gets gout / N
                    let grad_vec = vec![gout[0] / n; input.numel()];
                    crate::ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }
}
