// src/infer/optim.rs

use std::collections::HashMap;

use ndarray::ArrayD;

use crate::params::ParamStore;

/// Gradient-descent update over the store's accumulated gradients. The
/// loss returned by the estimator is the negative ELBO, so descending it
/// maximizes the ELBO.
pub trait Optimizer {
    fn step(&mut self, store: &mut ParamStore);
}

pub struct Sgd {
    pub lr: f64,
}

impl Optimizer for Sgd {
    fn step(&mut self, store: &mut ParamStore) {
        let names: Vec<String> = store.names().to_vec();
        for name in names {
            let grad = match store.grad(&name) {
                Some(g) => g.0.clone(),
                None => continue,
            };
            if let Some(value) = store.value_mut(&name) {
                value.0 = &value.0 - &(&grad * self.lr);
            }
        }
    }
}

pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: HashMap<String, ArrayD<f64>>,
    v: HashMap<String, ArrayD<f64>>,
    t: usize,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, store: &mut ParamStore) {
        self.t += 1;
        let t = self.t as i32;
        // Bias correction factors
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        // Effective learning rate
        let step_size = self.lr * bias_correction2.sqrt() / bias_correction1;

        let names: Vec<String> = store.names().to_vec();
        for name in names {
            let grad = match store.grad(&name) {
                Some(g) => g.0.clone(),
                None => continue,
            };

            let m = self
                .m
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            *m = &*m * self.beta1 + &grad * (1.0 - self.beta1);

            let v = self
                .v
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            *v = &*v * self.beta2 + &(&grad * &grad) * (1.0 - self.beta2);

            let denom = v.mapv(f64::sqrt) + self.eps;
            let update = &(&*m / &denom) * step_size;
            if let Some(value) = store.value_mut(&name) {
                value.0 = &value.0 - &update;
            }
        }
    }
}
