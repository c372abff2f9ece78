// src/ad/backward.rs

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use statrs::function::gamma::digamma;

use crate::ad::graph::{ADNode, BinaryOp, Tape, UnaryOp};
use crate::tensor::{broadcast_to, reduce_to_shape, TensorData};

/// Reverse pass from `root`, seeded with ones. Returns the gradient for
/// every node the root depends on, already reduced to each operand's shape.
pub fn backward(tape: &Tape, root: usize) -> HashMap<usize, TensorData> {
    let nodes = tape.nodes.borrow();
    let mut grads: HashMap<usize, ArrayD<f64>> = HashMap::new();

    grads.insert(root, ArrayD::ones(IxDyn(nodes[root].value().shape())));

    for node_id in (0..=root).rev() {
        let grad = match grads.get(&node_id) {
            Some(g) => g.clone(),
            None => continue,
        };

        match &nodes[node_id] {
            ADNode::Leaf { .. } | ADNode::Constant { .. } => {}

            ADNode::Binary { op, lhs, rhs, .. } => {
                let lv = nodes[*lhs].value();
                let rv = nodes[*rhs].value();
                let (gl, gr) = binary_grads(*op, lv, rv, &grad);
                add_grad(&mut grads, *lhs, reduce_to_shape(gl, lv.shape()));
                add_grad(&mut grads, *rhs, reduce_to_shape(gr, rv.shape()));
            }

            ADNode::Unary { op, arg, value } => {
                let x = nodes[*arg].value();
                let g = match op {
                    UnaryOp::Neg => -&grad,
                    UnaryOp::Ln => &grad / &x.0,
                    UnaryOp::Exp => &grad * &value.0,
                    UnaryOp::Lgamma => &grad * &x.0.mapv(digamma),
                };
                add_grad(&mut grads, *arg, g);
            }

            ADNode::Sum { arg, .. } => {
                let g = grad.iter().copied().next().unwrap_or(0.0);
                let shape = nodes[*arg].value().shape().to_vec();
                add_grad(&mut grads, *arg, ArrayD::from_elem(IxDyn(&shape), g));
            }

            ADNode::SumLast { arg, .. } => {
                let shape = nodes[*arg].value().shape().to_vec();
                let g = broadcast_to(&grad, &shape).expect("sum_last grad broadcast");
                add_grad(&mut grads, *arg, g);
            }

            ADNode::Gather0 { arg, index, .. } => {
                let arg_shape = nodes[*arg].value().shape().to_vec();
                let row_len: usize = arg_shape[1..].iter().product();
                let mut acc = vec![0.0; arg_shape.iter().product()];
                let g_std = grad.as_standard_layout();
                let g_flat = g_std.as_slice().expect("standard layout");
                for (i, &v) in index.0.iter().enumerate() {
                    let row = v.round() as usize;
                    for j in 0..row_len {
                        acc[row * row_len + j] += g_flat[i * row_len + j];
                    }
                }
                let g = ArrayD::from_shape_vec(IxDyn(&arg_shape), acc).expect("gather0 grad");
                add_grad(&mut grads, *arg, g);
            }

            ADNode::GatherLast { arg, index, .. } => {
                let arg_shape = nodes[*arg].value().shape().to_vec();
                let k = arg_shape[arg_shape.len() - 1];
                let mut full_shape = index.shape().to_vec();
                full_shape.push(k);
                let mut acc = vec![0.0; full_shape.iter().product()];
                let g_std = grad.as_standard_layout();
                let g_flat = g_std.as_slice().expect("standard layout");
                for (i, &v) in index.0.iter().enumerate() {
                    let col = v.round() as usize;
                    acc[i * k + col] += g_flat[i];
                }
                let full =
                    ArrayD::from_shape_vec(IxDyn(&full_shape), acc).expect("gather_last grad");
                add_grad(&mut grads, *arg, reduce_to_shape(full, &arg_shape));
            }
        }
    }

    grads
        .into_iter()
        .map(|(id, g)| (id, TensorData(g)))
        .collect()
}

fn binary_grads(
    op: BinaryOp,
    lv: &TensorData,
    rv: &TensorData,
    grad: &ArrayD<f64>,
) -> (ArrayD<f64>, ArrayD<f64>) {
    match op {
        BinaryOp::Add => (grad.clone(), grad.clone()),
        BinaryOp::Sub => (grad.clone(), -grad),
        BinaryOp::Mul => {
            let lvb = broadcast_to(&lv.0, grad.shape()).expect("mul grad broadcast");
            let rvb = broadcast_to(&rv.0, grad.shape()).expect("mul grad broadcast");
            (grad * &rvb, grad * &lvb)
        }
        BinaryOp::Div => {
            let lvb = broadcast_to(&lv.0, grad.shape()).expect("div grad broadcast");
            let rvb = broadcast_to(&rv.0, grad.shape()).expect("div grad broadcast");
            let gl = grad / &rvb;
            let gr = -(grad * &lvb) / (&rvb * &rvb);
            (gl, gr)
        }
    }
}

fn add_grad(grads: &mut HashMap<usize, ArrayD<f64>>, id: usize, update: ArrayD<f64>) {
    match grads.get_mut(&id) {
        Some(g) => *g = &*g + &update,
        None => {
            grads.insert(id, update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::types::Tensor;
    use crate::ad::{create_tape, remove_tape, with_tape};

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn grad_of(y: &Tensor, x: &Tensor) -> TensorData {
        let (tape_id, root) = y.dual().expect("dual output");
        let grads = with_tape(tape_id, |tape| backward(tape, root));
        grads
            .get(&x.node_id().expect("dual input"))
            .expect("gradient present")
            .clone()
    }

    #[test]
    fn test_gradient_mul_chain() {
        // f(x) = x * x + x, df/dx = 2x + 1
        let tape_id = create_tape();
        let x = Tensor::leaf(TensorData::scalar(5.0), tape_id);
        let y = x.clone() * x.clone() + x.clone();

        assert!(approx_eq(y.scalar_value(), 30.0, 1e-10));
        let g = grad_of(&y, &x);
        assert!(approx_eq(g.scalar_value(), 11.0, 1e-10));
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_ln_exp() {
        // f(x) = ln(x) + exp(x), df/dx = 1/x + exp(x)
        let tape_id = create_tape();
        let x = Tensor::leaf(TensorData::scalar(2.0), tape_id);
        let y = (x.clone().ln() + x.clone().exp()).sum();
        let g = grad_of(&y, &x);
        assert!(approx_eq(g.scalar_value(), 0.5 + 2.0_f64.exp(), 1e-10));
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_lgamma() {
        let tape_id = create_tape();
        let x = Tensor::leaf(TensorData::scalar(2.5), tape_id);
        let y = x.clone().lgamma();
        let g = grad_of(&y, &x);
        assert!(approx_eq(g.scalar_value(), digamma(2.5), 1e-8));
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_div() {
        // f(x, y) = x / y, df/dx = 1/y, df/dy = -x/y^2
        let tape_id = create_tape();
        let x = Tensor::leaf(TensorData::scalar(6.0), tape_id);
        let y = Tensor::leaf(TensorData::scalar(2.0), tape_id);
        let z = x.clone() / y.clone();

        let gx = grad_of(&z, &x);
        let gy = grad_of(&z, &y);
        assert!(approx_eq(gx.scalar_value(), 0.5, 1e-10));
        assert!(approx_eq(gy.scalar_value(), -1.5, 1e-10));
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_broadcast_reduces() {
        // scalar * vector summed: d/dscalar = sum(v), d/dv = scalar each
        let tape_id = create_tape();
        let s = Tensor::leaf(TensorData::scalar(3.0), tape_id);
        let v = Tensor::leaf(TensorData::from_vec(vec![1.0, 2.0, 4.0]), tape_id);
        let y = (s.clone() * v.clone()).sum();

        let gs = grad_of(&y, &s);
        let gv = grad_of(&y, &v);
        assert_eq!(gs.shape(), &[] as &[usize]);
        assert!(approx_eq(gs.scalar_value(), 7.0, 1e-10));
        assert_eq!(gv.to_flat_vec(), vec![3.0, 3.0, 3.0]);
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_sum_last_keepdim() {
        let tape_id = create_tape();
        let x = Tensor::leaf(
            TensorData::from_shape_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            tape_id,
        );
        // y = sum( x / sum_last(x) ), normalized rows
        let norm = x.clone().sum_last_keepdim();
        let y = (x.clone() / norm).sum();
        let g = grad_of(&y, &x);
        // row [a, b]: d/da (a/(a+b) + b/(a+b)) = 0
        for v in g.to_flat_vec() {
            assert!(approx_eq(v, 0.0, 1e-10));
        }
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_gather0_scatters() {
        let tape_id = create_tape();
        let table = Tensor::leaf(TensorData::from_vec(vec![2.0, 5.0]), tape_id);
        let idx = Tensor::from_vec(vec![1.0, 1.0, 0.0]);
        let y = table.gather0(&idx).sum();
        let g = grad_of(&y, &table);
        assert_eq!(g.to_flat_vec(), vec![1.0, 2.0]);
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_gather_last_scatters() {
        let tape_id = create_tape();
        let table = Tensor::leaf(
            TensorData::from_shape_vec(&[2, 2], vec![0.25, 0.75, 0.5, 0.5]).unwrap(),
            tape_id,
        );
        let idx = Tensor::from_vec(vec![1.0, 0.0]);
        let y = table.gather_last(&idx).sum();
        let g = grad_of(&y, &table);
        assert_eq!(g.to_flat_vec(), vec![0.0, 1.0, 1.0, 0.0]);
        remove_tape(tape_id);
    }

    #[test]
    fn test_gradient_detached_factor_is_constant() {
        // y = x * detach(x): dy/dx = detach(x) only
        let tape_id = create_tape();
        let x = Tensor::leaf(TensorData::scalar(3.0), tape_id);
        let y = x.clone() * x.detach();
        let g = grad_of(&y, &x);
        assert!(approx_eq(g.scalar_value(), 3.0, 1e-10));
        remove_tape(tape_id);
    }
}
