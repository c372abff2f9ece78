// src/params.rs
//
// The parameter store persists learnable tensors across gradient steps,
// keyed by name. Gradients live alongside values and accumulate until
// zeroed, so optimizers can consume them after a backward pass.

use std::collections::HashMap;

use crate::ad::types::Tensor;
use crate::tensor::TensorData;

#[derive(Debug, Default)]
pub struct ParamStore {
    order: Vec<String>,
    values: HashMap<String, TensorData>,
    grads: HashMap<String, TensorData>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the named parameter, running `init` to create it on first use.
    pub fn get_or_create(&mut self, name: &str, init: impl FnOnce() -> TensorData) -> TensorData {
        if let Some(v) = self.values.get(name) {
            return v.clone();
        }
        let v = init();
        self.order.push(name.to_string());
        self.values.insert(name.to_string(), v.clone());
        v
    }

    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.values.get(name)
    }

    pub fn value_mut(&mut self, name: &str) -> Option<&mut TensorData> {
        self.values.get_mut(name)
    }

    /// Parameters in creation order.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.order
            .iter()
            .filter_map(|n| self.values.get(n).map(|v| (n.as_str(), v)))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn grad(&self, name: &str) -> Option<&TensorData> {
        self.grads.get(name)
    }

    pub fn accumulate_grad(&mut self, name: &str, grad: TensorData) {
        match self.grads.get_mut(name) {
            Some(g) => g.0 = &g.0 + &grad.0,
            None => {
                self.grads.insert(name.to_string(), grad);
            }
        }
    }

    pub fn zero_grads(&mut self) {
        self.grads.clear();
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
        self.grads.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-gradient-step registry of parameter tape leaves. Guide and model
/// executions share it so that one parameter gets exactly one leaf node,
/// no matter how many statements touch it.
#[derive(Debug, Default)]
pub struct ParamLeaves {
    order: Vec<String>,
    leaves: HashMap<String, Tensor>,
}

impl ParamLeaves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Tensor> {
        self.leaves.get(name).cloned()
    }

    pub fn insert(&mut self, name: &str, leaf: Tensor) {
        if !self.leaves.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.leaves.insert(name.to_string(), leaf);
    }

    /// Leaves in creation order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.order
            .iter()
            .filter_map(|n| self.leaves.get(n).map(|t| (n.as_str(), t)))
    }
}
