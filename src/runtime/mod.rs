// runtime/mod.rs
// Execution context for models and guides.
//
// A model is an ordinary function over a `Runtime`; draw and parameter
// statements route through the active handler stack, which is owned by the
// context rather than by ambient global state. Plates are entered through
// closures so the frame is deregistered on every exit path.

pub mod error;
pub mod handler;
pub mod plate;
pub mod trace;

use std::collections::HashSet;
use std::sync::Arc;

use rand::{Rng, RngCore};

pub use error::{RuntimeError, RuntimeResult};

use crate::ad::types::Tensor;
use crate::dist::Distribution;
use crate::params::{ParamLeaves, ParamStore};
use crate::tensor::{broadcast_shapes, TensorData};
use handler::{Handler, Message, PlateHandler};
use plate::{frames_shape, PlateFrame, PlateOptions};

pub struct Runtime<'a> {
    handlers: Vec<Handler>,
    store: &'a mut ParamStore,
    leaves: &'a mut ParamLeaves,
    rng: &'a mut dyn RngCore,
    tape: Option<usize>,
    max_plate_nesting: usize,
    seen: HashSet<String>,
}

impl<'a> Runtime<'a> {
    pub fn new(
        store: &'a mut ParamStore,
        leaves: &'a mut ParamLeaves,
        rng: &'a mut dyn RngCore,
        tape: Option<usize>,
        max_plate_nesting: usize,
        handlers: Vec<Handler>,
    ) -> Self {
        Runtime {
            handlers,
            store,
            leaves,
            rng,
            tape,
            max_plate_nesting,
            seen: HashSet::new(),
        }
    }

    pub fn into_handlers(self) -> Vec<Handler> {
        self.handlers
    }

    /// A latent draw: sampled from `dist` unless a handler resolves it.
    pub fn sample(
        &mut self,
        name: &str,
        dist: impl Distribution + 'static,
    ) -> RuntimeResult<Tensor> {
        self.apply_sample(name, Box::new(dist), None)
    }

    /// An observed draw: the value is fixed to user data.
    pub fn observe(
        &mut self,
        name: &str,
        dist: impl Distribution + 'static,
        value: impl Into<Tensor>,
    ) -> RuntimeResult<Tensor> {
        self.apply_sample(name, Box::new(dist), Some(value.into()))
    }

    /// Fetch-or-register a learnable parameter. The first access in a
    /// gradient step mints the tape leaf; later accesses (from either the
    /// guide or the model) return the same leaf.
    pub fn param(
        &mut self,
        name: &str,
        init: impl FnOnce() -> TensorData,
    ) -> RuntimeResult<Tensor> {
        if self.seen.contains(name) {
            // A repeated param access in the same execution is a read, not
            // a re-declaration; any other reuse of the name is an error.
            return self
                .leaves
                .get(name)
                .ok_or_else(|| RuntimeError::DuplicateSite {
                    name: name.to_string(),
                });
        }
        self.seen.insert(name.to_string());

        let leaf = match self.leaves.get(name) {
            Some(existing) => existing,
            None => {
                let data = self.store.get_or_create(name, init);
                let tensor = match self.tape {
                    Some(tape_id) => Tensor::leaf(data, tape_id),
                    None => Tensor::from_data(data),
                };
                self.leaves.insert(name, tensor.clone());
                tensor
            }
        };

        let mut msg = Message::param(name, leaf);
        self.dispatch(&mut msg)?;
        msg.value.ok_or_else(|| RuntimeError::InvalidOperation {
            message: format!("parameter '{}' left unresolved", name),
        })
    }

    /// Enter a conditionally-independent batch dimension for the duration
    /// of `body`, which receives the (sub)sample index array. The frame is
    /// popped when `body` returns, error or not.
    pub fn plate<R>(
        &mut self,
        name: &str,
        size: usize,
        body: impl FnOnce(&mut Self, &Tensor) -> RuntimeResult<R>,
    ) -> RuntimeResult<R> {
        self.plate_with(name, size, PlateOptions::default(), body)
    }

    pub fn plate_with<R>(
        &mut self,
        name: &str,
        size: usize,
        opts: PlateOptions,
        body: impl FnOnce(&mut Self, &Tensor) -> RuntimeResult<R>,
    ) -> RuntimeResult<R> {
        let dim = self.resolve_dim(name, opts.dim)?;

        let (subsample, scale) = match opts.subsample_size {
            Some(m) if m == 0 => {
                return Err(RuntimeError::InvalidOperation {
                    message: format!("plate '{}': subsample_size must be positive", name),
                })
            }
            Some(m) if m < size => {
                // partial Fisher-Yates: m distinct indices
                let mut idx: Vec<usize> = (0..size).collect();
                for i in 0..m {
                    let j = self.rng.gen_range(i..size);
                    idx.swap(i, j);
                }
                idx.truncate(m);
                (Some(Arc::new(idx)), size as f64 / m as f64)
            }
            _ => (None, 1.0),
        };

        let indices: Vec<f64> = match &subsample {
            Some(s) => s.iter().map(|&i| i as f64).collect(),
            None => (0..size).map(|i| i as f64).collect(),
        };
        let index = Tensor::from_vec(indices);

        self.handlers.push(Handler::Plate(PlateHandler {
            frame: PlateFrame {
                name: name.to_string(),
                size,
                dim,
                subsample,
                scale,
            },
        }));
        let result = body(self, &index);
        self.handlers.pop();
        result
    }

    fn resolve_dim(&self, name: &str, requested: Option<isize>) -> RuntimeResult<isize> {
        let used: Vec<isize> = self
            .handlers
            .iter()
            .filter_map(|h| match h {
                Handler::Plate(p) => Some(p.frame.dim),
                _ => None,
            })
            .collect();

        let dim = match requested {
            Some(d) => {
                if d >= 0 {
                    return Err(RuntimeError::InvalidOperation {
                        message: format!("plate '{}': dim must be negative, got {}", name, d),
                    });
                }
                if used.contains(&d) {
                    return Err(RuntimeError::DimCollision {
                        name: name.to_string(),
                        dim: d,
                    });
                }
                d
            }
            None => {
                let mut d = -1;
                while used.contains(&d) {
                    d -= 1;
                }
                d
            }
        };

        if (-dim) as usize > self.max_plate_nesting {
            return Err(RuntimeError::PlateNesting {
                name: name.to_string(),
                dim,
                max: self.max_plate_nesting,
            });
        }
        Ok(dim)
    }

    fn apply_sample(
        &mut self,
        name: &str,
        dist: Box<dyn Distribution>,
        observed: Option<Tensor>,
    ) -> RuntimeResult<Tensor> {
        if !self.seen.insert(name.to_string()) {
            return Err(RuntimeError::DuplicateSite {
                name: name.to_string(),
            });
        }
        let mut msg = Message::sample(name, dist, observed);
        self.dispatch(&mut msg)?;
        msg.value.ok_or_else(|| RuntimeError::InvalidOperation {
            message: format!("statement '{}' left unresolved", name),
        })
    }

    /// Two-pass dispatch: process outermost-in, default effect, then
    /// postprocess innermost-out.
    fn dispatch(&mut self, msg: &mut Message) -> RuntimeResult<()> {
        for h in self.handlers.iter_mut() {
            h.process(msg)?;
        }
        if msg.value.is_none() && !msg.done {
            self.default_effect(msg)?;
        }
        for h in self.handlers.iter_mut().rev() {
            h.postprocess(msg)?;
        }
        Ok(())
    }

    fn default_effect(&mut self, msg: &mut Message) -> RuntimeResult<()> {
        let handler::MessageKind::Sample { dist } = &msg.kind else {
            return Ok(());
        };
        let dist = dist.as_ref().ok_or_else(|| RuntimeError::InvalidOperation {
            message: format!("statement '{}' has no distribution", msg.name),
        })?;
        let pshape = frames_shape(&msg.plates);
        let batch =
            broadcast_shapes(dist.batch_shape(), &pshape).ok_or_else(|| {
                RuntimeError::ShapeMismatch {
                    message: format!(
                        "statement '{}': batch shape {:?} incompatible with plates {:?}",
                        msg.name,
                        dist.batch_shape(),
                        pshape
                    ),
                }
            })?;
        let data = dist.sample(&batch, self.rng)?;
        msg.value = Some(Tensor::from_data(data));
        Ok(())
    }
}
