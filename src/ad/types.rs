// src/ad/types.rs

use std::ops::{Add, Div, Mul, Neg, Sub};

use ndarray::{ArrayD, Axis, IxDyn};
use statrs::function::gamma::ln_gamma;

use crate::ad::graph::{ADNode, BinaryOp, UnaryOp};
use crate::ad::with_tape;
use crate::provenance::Provenance;
use crate::tensor::{broadcast_shapes, broadcast_to, TensorData};

/// The value type flowing through models and guides: a dense f64 array,
/// optionally attached to a tape node, always carrying the provenance set
/// of the upstream latent draws it was computed from.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: TensorData,
    node: Option<(usize, usize)>,
    provenance: Provenance,
}

impl Tensor {
    pub fn scalar(value: f64) -> Self {
        Self::from_data(TensorData::scalar(value))
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        Self::from_data(TensorData::from_vec(data))
    }

    pub fn from_data(data: TensorData) -> Self {
        Tensor {
            data,
            node: None,
            provenance: Provenance::empty(),
        }
    }

    /// A differentiable input node on `tape_id` (parameter leaf).
    pub fn leaf(data: TensorData, tape_id: usize) -> Self {
        let node_id = with_tape(tape_id, |tape| {
            tape.push(ADNode::Leaf {
                value: data.clone(),
            })
        });
        Tensor {
            data,
            node: Some((tape_id, node_id)),
            provenance: Provenance::empty(),
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn scalar_value(&self) -> f64 {
        self.data.scalar_value()
    }

    /// (tape_id, node_id) when this value participates in a tape.
    pub fn dual(&self) -> Option<(usize, usize)> {
        self.node
    }

    pub fn node_id(&self) -> Option<usize> {
        self.node.map(|(_, id)| id)
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Stop-gradient: same value and provenance, no tape node.
    pub fn detach(&self) -> Self {
        Tensor {
            data: self.data.clone(),
            node: None,
            provenance: self.provenance.clone(),
        }
    }

    pub fn ln(self) -> Self {
        self.unary_op(UnaryOp::Ln, |x| x.ln())
    }

    pub fn exp(self) -> Self {
        self.unary_op(UnaryOp::Exp, |x| x.exp())
    }

    pub fn lgamma(self) -> Self {
        self.unary_op(UnaryOp::Lgamma, ln_gamma)
    }

    /// Full reduction to a 0-d scalar tensor.
    pub fn sum(self) -> Self {
        let value = TensorData::scalar(self.data.sum());
        let node = self.node.map(|(tape_id, arg)| {
            let id = with_tape(tape_id, |tape| {
                tape.push(ADNode::Sum {
                    arg,
                    value: value.clone(),
                })
            });
            (tape_id, id)
        });
        Tensor {
            data: value,
            node,
            provenance: self.provenance,
        }
    }

    /// Sum over the last axis, keeping it with size 1.
    pub fn sum_last_keepdim(self) -> Self {
        let nd = self.data.ndim();
        assert!(nd >= 1, "sum_last_keepdim on a 0-d tensor");
        let value = TensorData(
            self.data
                .0
                .sum_axis(Axis(nd - 1))
                .insert_axis(Axis(nd - 1)),
        );
        let node = self.node.map(|(tape_id, arg)| {
            let id = with_tape(tape_id, |tape| {
                tape.push(ADNode::SumLast {
                    arg,
                    value: value.clone(),
                })
            });
            (tape_id, id)
        });
        Tensor {
            data: value,
            node,
            provenance: self.provenance,
        }
    }

    /// Row selection along axis 0: out[I] = self[index[I], ...]. The index
    /// tensor holds integer values; gradients flow into `self` only.
    pub fn gather0(&self, index: &Tensor) -> Self {
        let arg = &self.data.0;
        assert!(arg.ndim() >= 1, "gather0 on a 0-d tensor");
        let k = arg.shape()[0];
        let rest: Vec<usize> = arg.shape()[1..].to_vec();
        let row_len: usize = rest.iter().product();
        let arg_std = arg.as_standard_layout();
        let flat = arg_std.as_slice().expect("standard layout");
        let mut out_shape = index.data.shape().to_vec();
        out_shape.extend(&rest);
        let mut data = Vec::with_capacity(index.data.len() * row_len);
        for &v in index.data.0.iter() {
            let r = as_index(v, k, "gather0");
            data.extend_from_slice(&flat[r * row_len..(r + 1) * row_len]);
        }
        let value =
            TensorData(ArrayD::from_shape_vec(IxDyn(&out_shape), data).expect("gather0 shape"));
        let node = self.node.map(|(tape_id, arg)| {
            let id = with_tape(tape_id, |tape| {
                tape.push(ADNode::Gather0 {
                    arg,
                    index: index.data.clone(),
                    value: value.clone(),
                })
            });
            (tape_id, id)
        });
        Tensor {
            data: value,
            node,
            provenance: self.provenance.union(&index.provenance),
        }
    }

    /// Per-element selection along the last axis: out[I] = self[I', index[I]],
    /// broadcasting the leading axes of `self` against the index shape.
    pub fn gather_last(&self, index: &Tensor) -> Self {
        let arg = &self.data.0;
        let nd = arg.ndim();
        assert!(nd >= 1, "gather_last on a 0-d tensor");
        let k = arg.shape()[nd - 1];
        let lead = &arg.shape()[..nd - 1];
        let out_shape = broadcast_shapes(lead, index.data.shape()).unwrap_or_else(|| {
            panic!(
                "gather_last: cannot broadcast {:?} with index {:?}",
                arg.shape(),
                index.data.shape()
            )
        });
        let mut full = out_shape.clone();
        full.push(k);
        let argb = broadcast_to(arg, &full).expect("broadcast checked");
        let idxb = broadcast_to(&index.data.0, &out_shape).expect("broadcast checked");
        let argb_std = argb.as_standard_layout();
        let flat = argb_std.as_slice().expect("standard layout");
        let mut data = Vec::with_capacity(idxb.len());
        for (i, &v) in idxb.iter().enumerate() {
            let c = as_index(v, k, "gather_last");
            data.push(flat[i * k + c]);
        }
        let value =
            TensorData(ArrayD::from_shape_vec(IxDyn(&out_shape), data).expect("gather_last shape"));
        let node = self.node.map(|(tape_id, arg)| {
            let id = with_tape(tape_id, |tape| {
                tape.push(ADNode::GatherLast {
                    arg,
                    index: TensorData(idxb.clone()),
                    value: value.clone(),
                })
            });
            (tape_id, id)
        });
        Tensor {
            data: value,
            node,
            provenance: self.provenance.union(&index.provenance),
        }
    }

    fn unary_op(self, op: UnaryOp, f: fn(f64) -> f64) -> Self {
        let value = self.data.mapv(f);
        let node = self.node.map(|(tape_id, arg)| {
            let id = with_tape(tape_id, |tape| {
                tape.push(ADNode::Unary {
                    op,
                    arg,
                    value: value.clone(),
                })
            });
            (tape_id, id)
        });
        Tensor {
            data: value,
            node,
            provenance: self.provenance,
        }
    }
}

fn as_index(v: f64, bound: usize, what: &str) -> usize {
    let r = v.round();
    assert!(
        (v - r).abs() < 1e-6 && r >= 0.0 && (r as usize) < bound,
        "{}: index {} out of range 0..{}",
        what,
        v,
        bound
    );
    r as usize
}

fn binary_forward(op: BinaryOp, a: &TensorData, b: &TensorData) -> TensorData {
    let shape = broadcast_shapes(a.shape(), b.shape()).unwrap_or_else(|| {
        panic!(
            "Tensor: cannot broadcast {:?} with {:?}",
            a.shape(),
            b.shape()
        )
    });
    let av = broadcast_to(&a.0, &shape).expect("broadcast checked");
    let bv = broadcast_to(&b.0, &shape).expect("broadcast checked");
    let out = match op {
        BinaryOp::Add => &av + &bv,
        BinaryOp::Sub => &av - &bv,
        BinaryOp::Mul => &av * &bv,
        BinaryOp::Div => &av / &bv,
    };
    TensorData(out)
}

fn binary_op(lhs: Tensor, rhs: Tensor, op: BinaryOp) -> Tensor {
    let value = binary_forward(op, &lhs.data, &rhs.data);
    let provenance = lhs.provenance.union(&rhs.provenance);

    let node = match (lhs.node, rhs.node) {
        (None, None) => None,
        (l, r) => {
            let tape_id = match (l, r) {
                (Some((ta, _)), Some((tb, _))) => {
                    if ta != tb {
                        panic!("Tensor: binary op across different tapes is unsupported");
                    }
                    ta
                }
                (Some((t, _)), None) | (None, Some((t, _))) => t,
                (None, None) => unreachable!(),
            };
            let id = with_tape(tape_id, |tape| {
                let lhs_id = match l {
                    Some((_, id)) => id,
                    None => tape.push(ADNode::Constant {
                        value: lhs.data.clone(),
                    }),
                };
                let rhs_id = match r {
                    Some((_, id)) => id,
                    None => tape.push(ADNode::Constant {
                        value: rhs.data.clone(),
                    }),
                };
                tape.push(ADNode::Binary {
                    op,
                    lhs: lhs_id,
                    rhs: rhs_id,
                    value: value.clone(),
                })
            });
            Some((tape_id, id))
        }
    };

    Tensor {
        data: value,
        node,
        provenance,
    }
}

impl Add for Tensor {
    type Output = Tensor;

    fn add(self, rhs: Self) -> Self::Output {
        binary_op(self, rhs, BinaryOp::Add)
    }
}

impl Sub for Tensor {
    type Output = Tensor;

    fn sub(self, rhs: Self) -> Self::Output {
        binary_op(self, rhs, BinaryOp::Sub)
    }
}

impl Mul for Tensor {
    type Output = Tensor;

    fn mul(self, rhs: Self) -> Self::Output {
        binary_op(self, rhs, BinaryOp::Mul)
    }
}

impl Div for Tensor {
    type Output = Tensor;

    fn div(self, rhs: Self) -> Self::Output {
        binary_op(self, rhs, BinaryOp::Div)
    }
}

impl Neg for Tensor {
    type Output = Tensor;

    fn neg(self) -> Self::Output {
        self.unary_op(UnaryOp::Neg, |x| -x)
    }
}

impl From<f64> for Tensor {
    fn from(v: f64) -> Self {
        Tensor::scalar(v)
    }
}

impl From<Vec<f64>> for Tensor {
    fn from(v: Vec<f64>) -> Self {
        Tensor::from_vec(v)
    }
}

impl From<TensorData> for Tensor {
    fn from(d: TensorData) -> Self {
        Tensor::from_data(d)
    }
}

impl From<ArrayD<f64>> for Tensor {
    fn from(a: ArrayD<f64>) -> Self {
        Tensor::from_data(TensorData(a))
    }
}

impl Add<f64> for Tensor {
    type Output = Tensor;

    fn add(self, rhs: f64) -> Self::Output {
        self + Tensor::scalar(rhs)
    }
}

impl Add<Tensor> for f64 {
    type Output = Tensor;

    fn add(self, rhs: Tensor) -> Self::Output {
        Tensor::scalar(self) + rhs
    }
}

impl Sub<f64> for Tensor {
    type Output = Tensor;

    fn sub(self, rhs: f64) -> Self::Output {
        self - Tensor::scalar(rhs)
    }
}

impl Sub<Tensor> for f64 {
    type Output = Tensor;

    fn sub(self, rhs: Tensor) -> Self::Output {
        Tensor::scalar(self) - rhs
    }
}

impl Mul<f64> for Tensor {
    type Output = Tensor;

    fn mul(self, rhs: f64) -> Self::Output {
        self * Tensor::scalar(rhs)
    }
}

impl Mul<Tensor> for f64 {
    type Output = Tensor;

    fn mul(self, rhs: Tensor) -> Self::Output {
        Tensor::scalar(self) * rhs
    }
}

impl Div<f64> for Tensor {
    type Output = Tensor;

    fn div(self, rhs: f64) -> Self::Output {
        self / Tensor::scalar(rhs)
    }
}

impl Div<Tensor> for f64 {
    type Output = Tensor;

    fn div(self, rhs: Tensor) -> Self::Output {
        Tensor::scalar(self) / rhs
    }
}
