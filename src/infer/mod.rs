// src/infer/mod.rs

pub mod elbo;
pub mod optim;

use rand::RngCore;
use tracing::debug;

use crate::params::ParamStore;
use crate::runtime::{Runtime, RuntimeResult};
use elbo::Elbo;
use optim::Optimizer;

/// One stochastic variational inference driver: zero the gradient slots,
/// estimate the loss and gradients, apply the optimizer.
pub struct Svi<O: Optimizer> {
    pub elbo: Elbo,
    pub optimizer: O,
}

impl<O: Optimizer> Svi<O> {
    pub fn new(elbo: Elbo, optimizer: O) -> Self {
        Svi { elbo, optimizer }
    }

    pub fn step<A, M, G>(
        &mut self,
        store: &mut ParamStore,
        rng: &mut dyn RngCore,
        model: M,
        guide: G,
        args: &A,
    ) -> RuntimeResult<f64>
    where
        A: ?Sized,
        M: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
        G: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
    {
        store.zero_grads();
        let loss = self.elbo.loss_and_grads(store, rng, model, guide, args)?;
        self.optimizer.step(store);
        debug!(loss, "svi step");
        Ok(loss)
    }
}
