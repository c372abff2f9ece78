// src/dist/mod.rs

use std::f64::consts::PI;

use rand::distributions::{Distribution as SampleDist, WeightedIndex};
use rand::RngCore;
use rand_distr::{Bernoulli as RandBernoulli, Normal as RandNormal, Poisson as RandPoisson};

use crate::ad::types::Tensor;
use crate::provenance::Provenance;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::tensor::{broadcast_shapes, broadcast_to, TensorData};

/// A probability distribution over f64 tensors. Parameters are `Tensor`s,
/// so `log_prob` is differentiable with respect to them and the result
/// carries their provenance.
///
/// `sample` draws i.i.d. values at the requested batch shape (parameters
/// broadcast against it), consuming the RNG in row-major element order.
pub trait Distribution: std::fmt::Debug {
    fn batch_shape(&self) -> &[usize];

    fn event_shape(&self) -> &[usize] {
        &[]
    }

    fn sample(&self, batch: &[usize], rng: &mut dyn RngCore) -> RuntimeResult<TensorData>;

    fn log_prob(&self, value: &Tensor) -> RuntimeResult<Tensor>;

    /// Union of the provenance of all parameter tensors.
    fn provenance(&self) -> Provenance;
}

fn param_err(message: String) -> RuntimeError {
    RuntimeError::DistributionError { message }
}

fn check_value_shape(what: &str, batch: &[usize], value: &Tensor) -> RuntimeResult<()> {
    if broadcast_shapes(batch, value.shape()).is_none() {
        return Err(RuntimeError::ShapeMismatch {
            message: format!(
                "{}: value shape {:?} does not broadcast with batch shape {:?}",
                what,
                value.shape(),
                batch
            ),
        });
    }
    Ok(())
}

fn broadcast_param(param: &Tensor, batch: &[usize]) -> RuntimeResult<Vec<f64>> {
    let b = broadcast_to(&param.data().0, batch)?;
    Ok(b.iter().copied().collect())
}

#[derive(Debug, Clone)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
    batch: Vec<usize>,
}

impl Normal {
    pub fn new(loc: impl Into<Tensor>, scale: impl Into<Tensor>) -> RuntimeResult<Self> {
        let loc = loc.into();
        let scale = scale.into();
        if scale.data().0.iter().any(|&s| s <= 0.0) {
            return Err(param_err(format!(
                "Normal: standard deviation must be positive, got {:?}",
                scale.data().to_flat_vec()
            )));
        }
        let batch = broadcast_shapes(loc.shape(), scale.shape()).ok_or_else(|| {
            param_err(format!(
                "Normal: incompatible parameter shapes {:?} and {:?}",
                loc.shape(),
                scale.shape()
            ))
        })?;
        Ok(Normal { loc, scale, batch })
    }
}

impl Distribution for Normal {
    fn batch_shape(&self) -> &[usize] {
        &self.batch
    }

    fn sample(&self, batch: &[usize], rng: &mut dyn RngCore) -> RuntimeResult<TensorData> {
        let locs = broadcast_param(&self.loc, batch)?;
        let scales = broadcast_param(&self.scale, batch)?;
        let mut data = Vec::with_capacity(locs.len());
        for (&m, &s) in locs.iter().zip(&scales) {
            let n = RandNormal::new(m, s).map_err(|e| {
                param_err(format!("Invalid Normal parameters: mean={}, std={}: {}", m, s, e))
            })?;
            data.push(n.sample(rng));
        }
        TensorData::from_shape_vec(batch, data)
    }

    fn log_prob(&self, value: &Tensor) -> RuntimeResult<Tensor> {
        check_value_shape("Normal", &self.batch, value)?;
        let z = (value.clone() - self.loc.clone()) / self.scale.clone();
        let term1 = -0.5 * (2.0 * PI).ln();
        Ok(Tensor::scalar(term1) - self.scale.clone().ln() - 0.5 * (z.clone() * z))
    }

    fn provenance(&self) -> Provenance {
        self.loc.provenance().union(self.scale.provenance())
    }
}

#[derive(Debug, Clone)]
pub struct Bernoulli {
    probs: Tensor,
    batch: Vec<usize>,
}

impl Bernoulli {
    pub fn new(probs: impl Into<Tensor>) -> RuntimeResult<Self> {
        let probs = probs.into();
        if probs.data().0.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
            return Err(param_err(format!(
                "Bernoulli: probabilities must lie in [0, 1], got {:?}",
                probs.data().to_flat_vec()
            )));
        }
        let batch = probs.shape().to_vec();
        Ok(Bernoulli { probs, batch })
    }
}

impl Distribution for Bernoulli {
    fn batch_shape(&self) -> &[usize] {
        &self.batch
    }

    fn sample(&self, batch: &[usize], rng: &mut dyn RngCore) -> RuntimeResult<TensorData> {
        let ps = broadcast_param(&self.probs, batch)?;
        let mut data = Vec::with_capacity(ps.len());
        for &p in &ps {
            let b = RandBernoulli::new(p)
                .map_err(|e| param_err(format!("Invalid Bernoulli parameter p={}: {}", p, e)))?;
            data.push(if b.sample(rng) { 1.0 } else { 0.0 });
        }
        TensorData::from_shape_vec(batch, data)
    }

    fn log_prob(&self, value: &Tensor) -> RuntimeResult<Tensor> {
        check_value_shape("Bernoulli", &self.batch, value)?;
        let p = self.probs.clone();
        let v = value.clone();
        Ok(v.clone() * p.clone().ln() + (1.0 - v) * (1.0 - p).ln())
    }

    fn provenance(&self) -> Provenance {
        self.probs.provenance().clone()
    }
}

/// Categorical over the last axis of `probs`; weights are normalized in
/// `log_prob`, so unnormalized rows are accepted.
#[derive(Debug, Clone)]
pub struct Categorical {
    probs: Tensor,
    batch: Vec<usize>,
    support: usize,
}

impl Categorical {
    pub fn new(probs: impl Into<Tensor>) -> RuntimeResult<Self> {
        let probs = probs.into();
        if probs.shape().is_empty() {
            return Err(param_err(
                "Categorical: probs must have at least one axis".to_string(),
            ));
        }
        if probs.data().0.iter().any(|&p| p < 0.0) {
            return Err(param_err(format!(
                "Categorical: probabilities must be non-negative, got {:?}",
                probs.data().to_flat_vec()
            )));
        }
        let nd = probs.shape().len();
        let support = probs.shape()[nd - 1];
        let batch = probs.shape()[..nd - 1].to_vec();
        Ok(Categorical {
            probs,
            batch,
            support,
        })
    }

    pub fn support(&self) -> usize {
        self.support
    }
}

impl Distribution for Categorical {
    fn batch_shape(&self) -> &[usize] {
        &self.batch
    }

    fn sample(&self, batch: &[usize], rng: &mut dyn RngCore) -> RuntimeResult<TensorData> {
        let mut full = batch.to_vec();
        full.push(self.support);
        let rows = broadcast_param(&self.probs, &full)?;
        let n: usize = batch.iter().product();
        let mut data = Vec::with_capacity(n);
        for i in 0..n {
            let row = &rows[i * self.support..(i + 1) * self.support];
            let w = WeightedIndex::new(row.iter().copied())
                .map_err(|e| param_err(format!("Invalid Categorical weights {:?}: {}", row, e)))?;
            data.push(w.sample(rng) as f64);
        }
        TensorData::from_shape_vec(batch, data)
    }

    fn log_prob(&self, value: &Tensor) -> RuntimeResult<Tensor> {
        check_value_shape("Categorical", &self.batch, value)?;
        let logits =
            self.probs.clone().ln() - self.probs.clone().sum_last_keepdim().ln();
        Ok(logits.gather_last(value))
    }

    fn provenance(&self) -> Provenance {
        self.probs.provenance().clone()
    }
}

#[derive(Debug, Clone)]
pub struct Poisson {
    rate: Tensor,
    batch: Vec<usize>,
}

impl Poisson {
    pub fn new(rate: impl Into<Tensor>) -> RuntimeResult<Self> {
        let rate = rate.into();
        if rate.data().0.iter().any(|&r| r <= 0.0) {
            return Err(param_err(format!(
                "Poisson: rate must be positive, got {:?}",
                rate.data().to_flat_vec()
            )));
        }
        let batch = rate.shape().to_vec();
        Ok(Poisson { rate, batch })
    }
}

impl Distribution for Poisson {
    fn batch_shape(&self) -> &[usize] {
        &self.batch
    }

    fn sample(&self, batch: &[usize], rng: &mut dyn RngCore) -> RuntimeResult<TensorData> {
        let rates = broadcast_param(&self.rate, batch)?;
        let mut data = Vec::with_capacity(rates.len());
        for &r in &rates {
            let p = RandPoisson::new(r)
                .map_err(|e| param_err(format!("Invalid Poisson rate {}: {}", r, e)))?;
            data.push(p.sample(rng));
        }
        TensorData::from_shape_vec(batch, data)
    }

    fn log_prob(&self, value: &Tensor) -> RuntimeResult<Tensor> {
        check_value_shape("Poisson", &self.batch, value)?;
        let v = value.clone();
        Ok(v.clone() * self.rate.clone().ln() - self.rate.clone() - (v + 1.0).lgamma())
    }

    fn provenance(&self) -> Provenance {
        self.rate.provenance().clone()
    }
}
