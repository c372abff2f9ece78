// Skein - probabilistic programming runtime
//
// Models and guides are ordinary Rust closures over a `Runtime` context.
// Random-draw and parameter statements are routed through a stack of
// handlers (trace recording, replay, provenance tracking, plates); the
// `Elbo` estimator consumes the recorded traces and produces score-function
// gradient estimates with provenance-scoped variance reduction.

pub mod tensor;
pub mod provenance;
pub mod ad;
pub mod dist;
pub mod params;
pub mod runtime;
pub mod infer;

// Re-export the types a model author touches.
pub use ad::types::Tensor;
pub use tensor::TensorData;
pub use provenance::Provenance;
pub use params::{ParamLeaves, ParamStore};
pub use runtime::{Runtime, RuntimeError, RuntimeResult};
pub use runtime::plate::PlateOptions;
pub use dist::{Bernoulli, Categorical, Distribution, Normal, Poisson};
pub use infer::elbo::Elbo;
pub use infer::optim::{Adam, Optimizer, Sgd};
pub use infer::Svi;

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
