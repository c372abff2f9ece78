// src/tensor/mod.rs

use ndarray::{ArrayD, Axis, IxDyn};
use std::ops::Deref;

use crate::runtime::error::{RuntimeError, RuntimeResult};

/// Dense f64 storage for every value flowing through the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorData(pub ArrayD<f64>);

impl Deref for TensorData {
    type Target = ArrayD<f64>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TensorData {
    pub fn scalar(value: f64) -> Self {
        TensorData(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        let len = data.len();
        TensorData(ArrayD::from_shape_vec(IxDyn(&[len]), data).expect("vector shape"))
    }

    pub fn from_shape_vec(shape: &[usize], data: Vec<f64>) -> RuntimeResult<Self> {
        let len = data.len();
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(TensorData)
            .map_err(|_| RuntimeError::ShapeMismatch {
                message: format!("cannot shape {} elements into {:?}", len, shape),
            })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        TensorData(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn from_elem(shape: &[usize], value: f64) -> Self {
        TensorData(ArrayD::from_elem(IxDyn(shape), value))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.sum()
    }

    /// The single element of a 0-d or length-1 tensor.
    pub fn scalar_value(&self) -> f64 {
        debug_assert_eq!(self.0.len(), 1, "scalar_value on a non-scalar tensor");
        *self.0.iter().next().expect("empty tensor")
    }

    pub fn mapv(&self, f: impl Fn(f64) -> f64) -> Self {
        TensorData(self.0.mapv(f))
    }

    /// Flat contiguous copy of the elements, row-major.
    pub fn to_flat_vec(&self) -> Vec<f64> {
        self.0.iter().copied().collect()
    }
}

impl From<ArrayD<f64>> for TensorData {
    fn from(arr: ArrayD<f64>) -> Self {
        TensorData(arr)
    }
}

impl From<TensorData> for ArrayD<f64> {
    fn from(t: TensorData) -> Self {
        t.0
    }
}

/// NumPy broadcasting rules: align from the right, a dim of 1 stretches.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0usize; ndim];
    for i in 0..ndim {
        let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        let d = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return None;
        };
        out[ndim - 1 - i] = d;
    }
    Some(out)
}

pub fn broadcast_to(arr: &ArrayD<f64>, shape: &[usize]) -> RuntimeResult<ArrayD<f64>> {
    arr.broadcast(IxDyn(shape))
        .map(|v| v.to_owned())
        .ok_or_else(|| RuntimeError::ShapeMismatch {
            message: format!("cannot broadcast {:?} to {:?}", arr.shape(), shape),
        })
}

/// Sum a gradient down to the shape of the operand it belongs to, undoing
/// any broadcasting the forward op performed.
pub fn reduce_to_shape(grad: ArrayD<f64>, target: &[usize]) -> ArrayD<f64> {
    let mut g = grad;
    while g.ndim() > target.len() {
        g = g.sum_axis(Axis(0));
    }
    for i in 0..target.len() {
        if g.shape()[i] != target[i] {
            debug_assert_eq!(target[i], 1, "reduce_to_shape: incompatible target");
            g = g.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    g
}
