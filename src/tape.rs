use std::cell::RefCell;
use std::rc::Rc;

use crate::tensor::Tensor;

thread_local! {
    static TAPE: RefCell<Vec<Node>> = const { RefCell::new(Vec::new()) };
}

/// Handle to the thread-local autograd tape.
pub struct Tape;

struct Node {
    // Rc so closures can be cloned out of the borrow and run safely.
    backward_fn: Rc<dyn Fn()>,
}

impl Tape {
    /// Clear recorded nodes but keep the tape alive.
    pub fn reset() {
        TAPE.with(|t| t.borrow_mut().clear());
    }

    /// Number of recorded nodes.
    pub fn len() -> usize {
        TAPE.with(|t| t.borrow().len())
    }

    pub fn is_empty() -> bool {
        Self::len() == 0
    }

    pub fn push_binary_op<F>(a: &Tensor, b: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !(a.requires_grad || b.requires_grad) {
            return;
        }
        Self::record(output, backward_fn);
    }

    pub fn push_unary_op<F>(input: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !input.requires_grad {
            return;
        }
        Self::record(output, backward_fn);
    }

    fn record<F>(output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        let id = TAPE.with(|t| {
            let mut nodes = t.borrow_mut();
            nodes.push(Node {
                backward_fn: Rc::new(backward_fn),
            });
            nodes.len() - 1
        });
        // stamp after releasing the borrow
        output.tape_node.set(Some(id));
    }
}

/// Execute backward functions up to `final_node_id` (inclusive), in reverse.
pub fn backward(final_node_id: usize) {
    let fns: Vec<Rc<dyn Fn()>> = TAPE.with(|t| {
        let nodes = t.borrow();
        if nodes.is_empty() {
            return Vec::new();
        }
        let end = final_node_id.min(nodes.len() - 1);
        nodes[..=end].iter().map(|n| n.backward_fn.clone()).collect()
    });

    // Run in reverse with no outstanding borrows.
    for f in fns.into_iter().rev() {
        (f)();
    }
}
