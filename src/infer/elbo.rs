// src/infer/elbo.rs
//
// Score-function ELBO estimator with provenance-scoped variance reduction.
// The guide runs under {trace, provenance}; the model replays the guide's
// draws under {trace, provenance, replay}; the surrogate multiplies each
// latent's score by only the cost terms of its causal descendants.

use std::rc::Rc;

use rand::RngCore;
use tracing::debug;

use crate::ad;
use crate::ad::types::Tensor;
use crate::ad::{backward, with_tape};
use crate::params::{ParamLeaves, ParamStore};
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::handler::{
    Handler, PlateHandler, ProvenanceTracker, ReplayHandler, TraceHandler,
};
use crate::runtime::plate::PlateFrame;
use crate::runtime::trace::{Site, Trace};
use crate::runtime::Runtime;

/// Estimator configuration. `strict_enumeration_warning` is accepted for
/// configuration compatibility and has no effect here.
pub struct Elbo {
    pub num_particles: usize,
    pub vectorize_particles: bool,
    pub max_plate_nesting: usize,
    pub strict_enumeration_warning: bool,
}

impl Default for Elbo {
    fn default() -> Self {
        Elbo {
            num_particles: 1,
            vectorize_particles: false,
            max_plate_nesting: 1,
            strict_enumeration_warning: true,
        }
    }
}

impl Elbo {
    pub fn new(max_plate_nesting: usize) -> Self {
        Elbo {
            max_plate_nesting,
            ..Default::default()
        }
    }

    pub fn with_particles(mut self, num_particles: usize, vectorize: bool) -> Self {
        self.num_particles = num_particles;
        self.vectorize_particles = vectorize;
        self
    }

    /// Estimate the loss (negative ELBO) and accumulate its gradient into
    /// the store, one entry per registered parameter.
    pub fn loss_and_grads<A, M, G>(
        &self,
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
        self.loss_and_grads_traced(store, rng, model, guide, args)
            .map(|(loss, _)| loss)
    }

    /// Like `loss_and_grads`, additionally returning the per-particle
    /// (guide, model) trace pairs with densities computed.
    pub fn loss_and_grads_traced<A, M, G>(
        &self,
        store: &mut ParamStore,
        rng: &mut dyn RngCore,
        model: M,
        guide: G,
        args: &A,
    ) -> RuntimeResult<(f64, Vec<(Trace, Trace)>)>
    where
        A: ?Sized,
        M: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
        G: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
    {
        if self.num_particles == 0 {
            return Err(RuntimeError::InvalidOperation {
                message: "num_particles must be positive".to_string(),
            });
        }
        let tape_id = ad::create_tape();
        let result = self.run(store, rng, &model, &guide, args, tape_id);
        ad::remove_tape(tape_id);
        result
    }

    fn run<A, M, G>(
        &self,
        store: &mut ParamStore,
        rng: &mut dyn RngCore,
        model: &M,
        guide: &G,
        args: &A,
        tape_id: usize,
    ) -> RuntimeResult<(f64, Vec<(Trace, Trace)>)>
    where
        A: ?Sized,
        M: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
        G: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
    {
        let mut leaves = ParamLeaves::new();

        // Vectorized particles ride an implicit plate one dim beyond
        // max_plate_nesting, so user plates keep their reserved axes.
        let particle_frame = if self.vectorize_particles && self.num_particles > 1 {
            Some(PlateFrame {
                name: "_particles".to_string(),
                size: self.num_particles,
                dim: -(self.max_plate_nesting as isize) - 1,
                subsample: None,
                scale: 1.0,
            })
        } else {
            None
        };
        let iters = if particle_frame.is_some() {
            1
        } else {
            self.num_particles
        };

        let mut surrogate = Tensor::scalar(0.0);
        let mut elbo_acc = 0.0;
        let mut pairs = Vec::with_capacity(iters);
        for _ in 0..iters {
            let (guide_trace, model_trace) = self.particle(
                store,
                &mut leaves,
                rng,
                model,
                guide,
                args,
                tape_id,
                particle_frame.as_ref(),
            )?;
            elbo_acc += elbo_value(&model_trace, &guide_trace);
            surrogate = surrogate + self.surrogate(&model_trace, &guide_trace)?;
            pairs.push((guide_trace, model_trace));
        }

        let scale = 1.0 / self.num_particles as f64;
        let loss = -elbo_acc * scale;
        let surrogate_loss = surrogate * scale;

        if let Some((tid, root)) = surrogate_loss.dual() {
            let grads = with_tape(tid, |tape| backward(tape, root));
            for (name, leaf) in leaves.entries() {
                if let Some(node) = leaf.node_id() {
                    if let Some(g) = grads.get(&node) {
                        store.accumulate_grad(name, g.clone());
                    }
                }
            }
        }

        debug!(loss, particles = self.num_particles, "elbo gradient step");
        Ok((loss, pairs))
    }

    #[allow(clippy::too_many_arguments)]
    fn particle<A, M, G>(
        &self,
        store: &mut ParamStore,
        leaves: &mut ParamLeaves,
        rng: &mut dyn RngCore,
        model: &M,
        guide: &G,
        args: &A,
        tape_id: usize,
        particle_frame: Option<&PlateFrame>,
    ) -> RuntimeResult<(Trace, Trace)>
    where
        A: ?Sized,
        M: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
        G: Fn(&mut Runtime, &A) -> RuntimeResult<()>,
    {
        let base_handlers = |extra: Option<Handler>| {
            let mut handlers = vec![
                Handler::Trace(TraceHandler::new(self.max_plate_nesting)),
                Handler::Provenance(ProvenanceTracker),
            ];
            if let Some(h) = extra {
                handlers.push(h);
            }
            if let Some(f) = particle_frame {
                handlers.push(Handler::Plate(PlateHandler { frame: f.clone() }));
            }
            handlers
        };

        // guide pass
        let mut rt = Runtime::new(
            store,
            leaves,
            rng,
            Some(tape_id),
            self.max_plate_nesting,
            base_handlers(None),
        );
        guide(&mut rt, args)?;
        let mut handlers = rt.into_handlers();
        let mut guide_trace = take_trace(&mut handlers)?;
        guide_trace.compute_log_prob()?;
        let guide_rc = Rc::new(guide_trace);

        // model pass, replaying the guide's draws
        let mut rt = Runtime::new(
            store,
            leaves,
            rng,
            Some(tape_id),
            self.max_plate_nesting,
            base_handlers(Some(Handler::Replay(ReplayHandler::new(guide_rc.clone())))),
        );
        model(&mut rt, args)?;
        let mut handlers = rt.into_handlers();
        let mut model_trace = take_trace(&mut handlers)?;
        drop(handlers);
        model_trace.compute_log_prob()?;

        let guide_trace = Rc::try_unwrap(guide_rc).map_err(|_| RuntimeError::InvalidOperation {
            message: "reference trace still shared after model pass".to_string(),
        })?;
        Ok((guide_trace, model_trace))
    }

    /// The provenance-weighted surrogate for one particle batch:
    ///
    ///   Σ logq(z).sum() − Σ logp(s).sum()
    ///   − Σ_z Σ_{s ∈ model, z ∈ prov(s)} (logq_z ⊙ detach(logp_s)).sum()
    ///   + Σ_z Σ_{s ∈ guide, z ∈ prov(s)} (logq_z ⊙ detach(logq_s)).sum()
    ///
    /// Each product is broadcast elementwise before its own reduction, so
    /// plate axes pair up score and cost elements and are never collapsed
    /// first. Expanding the terms shows each score multiplied by exactly
    /// its downstream log p − log q closure minus the −1 baseline.
    fn surrogate(&self, model_trace: &Trace, guide_trace: &Trace) -> RuntimeResult<Tensor> {
        let mut s = Tensor::scalar(0.0);

        for site in model_trace.sites().filter(|s| s.is_draw()) {
            let lp = site_log_prob(site)?;
            s = s - lp.clone().sum();
        }
        for site in guide_trace.sites().filter(|s| s.is_latent()) {
            let lq = site_log_prob(site)?;
            s = s + lq.clone().sum();
        }

        for z in guide_trace.sites().filter(|s| s.is_latent()) {
            let lq = site_log_prob(z)?;
            for site in model_trace.sites().filter(|s| s.is_draw()) {
                if site.provenance.contains(&z.name) {
                    let cost = site_log_prob(site)?.detach();
                    s = s - (lq.clone() * cost).sum();
                }
            }
            for site in guide_trace.sites().filter(|s| s.is_latent()) {
                if site.provenance.contains(&z.name) {
                    let cost = site_log_prob(site)?.detach();
                    s = s + (lq.clone() * cost).sum();
                }
            }
        }

        Ok(s)
    }
}

fn site_log_prob(site: &Site) -> RuntimeResult<&Tensor> {
    site.log_prob
        .as_ref()
        .ok_or_else(|| RuntimeError::InvalidOperation {
            message: format!("density missing at site '{}'", site.name),
        })
}

fn take_trace(handlers: &mut Vec<Handler>) -> RuntimeResult<Trace> {
    for i in 0..handlers.len() {
        if matches!(handlers[i], Handler::Trace(_)) {
            if let Handler::Trace(t) = handlers.remove(i) {
                return Ok(t.into_trace());
            }
        }
    }
    Err(RuntimeError::InvalidOperation {
        message: "no trace handler on the stack".to_string(),
    })
}

/// Monte Carlo ELBO value from the recorded densities.
fn elbo_value(model_trace: &Trace, guide_trace: &Trace) -> f64 {
    let model_lp = model_trace.log_prob_sum();
    let guide_lp: f64 = guide_trace
        .sites()
        .filter(|s| s.is_latent())
        .filter_map(|s| s.log_prob.as_ref())
        .map(|lp| lp.data().sum())
        .sum();
    model_lp - guide_lp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{Bernoulli, Categorical, Normal, Poisson};
    use crate::tensor::TensorData;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn norm_lpdf(x: f64, mean: f64, std: f64) -> f64 {
        let z = (x - mean) / std;
        -0.5 * (2.0 * std::f64::consts::PI).ln() - std.ln() - 0.5 * z * z
    }

    // --- two-site categorical model over a size-2 plate ---

    fn cat_model(rt: &mut Runtime, data: &TensorData) -> RuntimeResult<()> {
        rt.plate("data", 2, |rt, _| {
            let z = rt.sample("z", Categorical::new(vec![0.3, 0.7])?)?;
            rt.observe("x", Normal::new(z, 1.0)?, data.clone())?;
            Ok(())
        })
    }

    fn cat_guide(rt: &mut Runtime, _data: &TensorData) -> RuntimeResult<()> {
        rt.plate("data", 2, |rt, _| {
            let probs = rt.param("probs", || {
                TensorData::from_shape_vec(&[2, 2], vec![0.4, 0.6, 0.5, 0.5]).unwrap()
            })?;
            rt.sample("z", Categorical::new(probs)?)?;
            Ok(())
        })
    }

    /// Exact ELBO for the categorical pair by brute-force enumeration,
    /// as a plain function of the (unnormalized) guide probabilities.
    fn cat_exact_elbo(p: &[f64]) -> f64 {
        let data = [-0.5, 2.0];
        let prior: [f64; 2] = [0.3, 0.7];
        let mut elbo = 0.0;
        for j in 0..2 {
            let row = &p[2 * j..2 * j + 2];
            let total: f64 = row[0] + row[1];
            for k in 0..2 {
                let q = row[k] / total;
                let logp = prior[k].ln() + norm_lpdf(data[j], k as f64, 1.0);
                elbo += q * (logp - q.ln());
            }
        }
        elbo
    }

    #[test]
    fn test_gradient_matches_exact_integration() {
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);

        let elbo = Elbo::new(1).with_particles(100_000, true);
        elbo.loss_and_grads(&mut store, &mut rng, cat_model, cat_guide, &data)
            .unwrap();
        let actual = store.grad("probs").unwrap().to_flat_vec();

        // expected loss gradient: central differences of the exact ELBO
        let p0 = [0.4, 0.6, 0.5, 0.5];
        let h = 1e-5;
        for i in 0..4 {
            let mut hi = p0;
            let mut lo = p0;
            hi[i] += h;
            lo[i] -= h;
            let exact = -(cat_exact_elbo(&hi) - cat_exact_elbo(&lo)) / (2.0 * h);
            assert!(
                approx_eq(actual[i], exact, 0.02),
                "grad[{}]: estimated {} vs exact {}",
                i,
                actual[i],
                exact
            );
        }
    }

    // --- Poisson-latent pair, single-particle hand-derived gradient ---

    fn poisson_model(rt: &mut Runtime, data: &TensorData) -> RuntimeResult<()> {
        rt.plate("data", 2, |rt, _| {
            let z = rt.sample("z", Poisson::new(3.0)?)?;
            rt.observe("x", Normal::new(z, 1.0)?, data.clone())?;
            Ok(())
        })
    }

    fn poisson_guide(rt: &mut Runtime, _data: &TensorData) -> RuntimeResult<()> {
        rt.plate("data", 2, |rt, _| {
            let rate = rt.param("rate", || TensorData::from_vec(vec![3.5, 1.5]))?;
            rt.sample("z", Poisson::new(rate)?)?;
            Ok(())
        })
    }

    #[test]
    fn test_single_particle_gradient_matches_hand_derivation() {
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);

        let elbo = Elbo::new(1);
        let (_, pairs) = elbo
            .loss_and_grads_traced(&mut store, &mut rng, poisson_model, poisson_guide, &data)
            .unwrap();
        let (guide_tr, model_tr) = &pairs[0];

        let z = guide_tr.get("z").unwrap().value.data().to_flat_vec();
        let rate = store.get("rate").unwrap().to_flat_vec();
        let logqz = guide_tr.get("z").unwrap().log_prob.as_ref().unwrap();
        let logpz = model_tr.get("z").unwrap().log_prob.as_ref().unwrap();
        let logpx = model_tr.get("x").unwrap().log_prob.as_ref().unwrap();
        let logqz = logqz.data().to_flat_vec();
        let logpz = logpz.data().to_flat_vec();
        let logpx = logpx.data().to_flat_vec();

        let actual = store.grad("rate").unwrap().to_flat_vec();
        for j in 0..2 {
            let dlogq_drate = z[j] / rate[j] - 1.0;
            let loss_j = logpx[j] + logpz[j] - logqz[j];
            let expected = -(dlogq_drate * loss_j - dlogq_drate);
            assert!(
                approx_eq(actual[j], expected, 1e-4),
                "rate grad[{}]: {} vs {}",
                j,
                actual[j],
                expected
            );
        }
    }

    // --- 5-site chain a -> b -> {c, d} -> e, e observed ---

    fn chain_model(rt: &mut Runtime, data: &TensorData) -> RuntimeResult<()> {
        let a = rt.sample("a", Bernoulli::new(0.3)?)?;
        rt.plate("data", 2, |rt, _| {
            let b = rt.sample("b", Bernoulli::new(Tensor::from_vec(vec![0.3, 0.4]).gather0(&a))?)?;
            let c = rt.sample("c", Bernoulli::new(Tensor::from_vec(vec![0.5, 0.6]).gather0(&b))?)?;
            rt.sample("d", Bernoulli::new(Tensor::from_vec(vec![0.2, 0.3]).gather0(&b))?)?;
            rt.observe(
                "e",
                Bernoulli::new(Tensor::from_vec(vec![0.5, 0.1]).gather0(&c))?,
                data.clone(),
            )?;
            Ok(())
        })
    }

    fn chain_guide(rt: &mut Runtime, _data: &TensorData) -> RuntimeResult<()> {
        let pa = rt.param("prob_a", || TensorData::scalar(0.5))?;
        let a = rt.sample("a", Bernoulli::new(pa)?)?;
        rt.plate("data", 2, |rt, _| {
            let pb = rt.param("prob_b", || TensorData::from_vec(vec![0.4, 0.3]))?;
            let b = rt.sample("b", Bernoulli::new(pb.gather0(&a))?)?;
            let pc = rt.param("prob_c", || TensorData::from_vec(vec![0.3, 0.8]))?;
            rt.sample("c", Bernoulli::new(pc.gather0(&b))?)?;
            let pd = rt.param("prob_d", || TensorData::from_vec(vec![0.2, 0.9]))?;
            rt.sample("d", Bernoulli::new(pd.gather0(&b))?)?;
            Ok(())
        })
    }

    fn dlogq_bernoulli(v: f64, p: f64) -> f64 {
        (v - p) / (p * (1.0 - p))
    }

    #[test]
    fn test_chain_gradients_scope_to_descendants() {
        let data = TensorData::from_vec(vec![0.0, 1.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(5);

        let elbo = Elbo::new(1);
        let (_, pairs) = elbo
            .loss_and_grads_traced(&mut store, &mut rng, chain_model, chain_guide, &data)
            .unwrap();
        let (guide_tr, model_tr) = &pairs[0];

        let lp = |tr: &Trace, name: &str| -> Vec<f64> {
            tr.get(name)
                .unwrap()
                .log_prob
                .as_ref()
                .unwrap()
                .data()
                .to_flat_vec()
        };
        let val = |tr: &Trace, name: &str| -> Vec<f64> {
            tr.get(name).unwrap().value.data().to_flat_vec()
        };

        let a = val(guide_tr, "a")[0];
        let b = val(guide_tr, "b");
        let c = val(guide_tr, "c");

        let lpa = lp(model_tr, "a")[0];
        let lpb = lp(model_tr, "b");
        let lpc = lp(model_tr, "c");
        let lpd = lp(model_tr, "d");
        let lpe = lp(model_tr, "e");
        let lqa = lp(guide_tr, "a")[0];
        let lqb = lp(guide_tr, "b");
        let lqc = lp(guide_tr, "c");
        let lqd = lp(guide_tr, "d");

        let pa = store.get("prob_a").unwrap().scalar_value();
        let pb = store.get("prob_b").unwrap().to_flat_vec();
        let pc = store.get("prob_c").unwrap().to_flat_vec();
        let pd = store.get("prob_d").unwrap().to_flat_vec();

        // per-element downstream costs, from the exact descendant sets
        let cost_bcde: Vec<f64> = (0..2)
            .map(|j| lpb[j] + lpc[j] + lpd[j] + lpe[j] - lqb[j] - lqc[j] - lqd[j])
            .collect();
        let cost_a = (lpa - lqa) + cost_bcde.iter().sum::<f64>();
        let cost_c: Vec<f64> = (0..2).map(|j| lpc[j] + lpe[j] - lqc[j]).collect();
        let cost_d: Vec<f64> = (0..2).map(|j| lpd[j] - lqd[j]).collect();

        // loss gradient of each parameter: dlogq * (1 - cost), scattered
        // through the same indexing the guide used
        let expected_a = dlogq_bernoulli(a, pa) * (1.0 - cost_a);
        let mut expected_b = vec![0.0; 2];
        for j in 0..2 {
            expected_b[a as usize] +=
                dlogq_bernoulli(b[j], pb[a as usize]) * (1.0 - cost_bcde[j]);
        }
        let mut expected_c = vec![0.0; 2];
        let mut expected_d = vec![0.0; 2];
        for j in 0..2 {
            let bi = b[j] as usize;
            expected_c[bi] += dlogq_bernoulli(c[j], pc[bi]) * (1.0 - cost_c[j]);
            let dj = val(guide_tr, "d")[j];
            expected_d[bi] += dlogq_bernoulli(dj, pd[bi]) * (1.0 - cost_d[j]);
        }

        let actual_a = store.grad("prob_a").unwrap().scalar_value();
        let actual_b = store.grad("prob_b").unwrap().to_flat_vec();
        let actual_c = store.grad("prob_c").unwrap().to_flat_vec();
        let actual_d = store.grad("prob_d").unwrap().to_flat_vec();

        assert!(approx_eq(actual_a, expected_a, 1e-4), "{} vs {}", actual_a, expected_a);
        for j in 0..2 {
            assert!(approx_eq(actual_b[j], expected_b[j], 1e-4), "b[{}]", j);
            assert!(approx_eq(actual_c[j], expected_c[j], 1e-4), "c[{}]", j);
            assert!(approx_eq(actual_d[j], expected_d[j], 1e-4), "d[{}]", j);
        }
    }

    #[test]
    fn test_chain_provenance_sets() {
        let data = TensorData::from_vec(vec![0.0, 1.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(5);
        let elbo = Elbo::new(1);
        let (_, pairs) = elbo
            .loss_and_grads_traced(&mut store, &mut rng, chain_model, chain_guide, &data)
            .unwrap();
        let (_, model_tr) = &pairs[0];

        let prov = |name: &str| -> Vec<String> {
            model_tr
                .get(name)
                .unwrap()
                .provenance
                .names()
                .map(str::to_string)
                .collect()
        };
        assert_eq!(prov("a"), vec!["a"]);
        assert_eq!(prov("b"), vec!["a", "b"]);
        assert_eq!(prov("c"), vec!["a", "b", "c"]);
        assert_eq!(prov("d"), vec!["a", "b", "d"]);
        // e is observed: upstream only, no self tag, no d
        assert_eq!(prov("e"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_idempotent_under_same_seed() {
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let elbo = Elbo::new(1).with_particles(4, false);

        let mut grads = Vec::new();
        let mut losses = Vec::new();
        for _ in 0..2 {
            let mut store = ParamStore::new();
            let mut rng = StdRng::seed_from_u64(42);
            let loss = elbo
                .loss_and_grads(&mut store, &mut rng, poisson_model, poisson_guide, &data)
                .unwrap();
            losses.push(loss);
            grads.push(store.grad("rate").unwrap().to_flat_vec());
        }
        assert_eq!(losses[0], losses[1]);
        assert_eq!(grads[0], grads[1]);
    }

    #[test]
    fn test_vectorized_particles_add_leading_axis() {
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let elbo = Elbo::new(1).with_particles(8, true);
        let (loss, pairs) = elbo
            .loss_and_grads_traced(&mut store, &mut rng, poisson_model, poisson_guide, &data)
            .unwrap();
        assert!(loss.is_finite());
        assert_eq!(pairs.len(), 1);
        let (guide_tr, model_tr) = &pairs[0];
        assert_eq!(guide_tr.get("z").unwrap().value.shape(), &[8, 2]);
        assert_eq!(model_tr.get("x").unwrap().log_prob.as_ref().unwrap().shape(), &[8, 2]);
    }

    #[test]
    fn test_sequential_and_vectorized_agree_in_expectation() {
        // same seed gives different draws, so compare loosely over many
        // particles: both must land near the analytic ELBO neighborhood
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let elbo_seq = Elbo::new(1).with_particles(2000, false);
        let elbo_vec = Elbo::new(1).with_particles(2000, true);

        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(2);
        let loss_seq = elbo_seq
            .loss_and_grads(&mut store, &mut rng, poisson_model, poisson_guide, &data)
            .unwrap();

        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(3);
        let loss_vec = elbo_vec
            .loss_and_grads(&mut store, &mut rng, poisson_model, poisson_guide, &data)
            .unwrap();

        assert!(approx_eq(loss_seq, loss_vec, 1.5), "{} vs {}", loss_seq, loss_vec);
    }

    #[test]
    fn test_replay_miss_on_structural_mismatch() {
        fn bad_guide(rt: &mut Runtime, _data: &TensorData) -> RuntimeResult<()> {
            // missing the "z" the model expects to replay
            rt.param("rate", || TensorData::from_vec(vec![3.5, 1.5]))?;
            Ok(())
        }
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let err = Elbo::new(1).loss_and_grads(&mut store, &mut rng, poisson_model, bad_guide, &data);
        assert!(matches!(err, Err(RuntimeError::ReplayMiss { .. })));
    }

    #[test]
    fn test_shape_conflict_on_short_data() {
        // plate declares 2, observed data has a size-1 axis there
        let data = TensorData::from_vec(vec![-0.5]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let err = Elbo::new(1).loss_and_grads(
            &mut store,
            &mut rng,
            poisson_model,
            poisson_guide,
            &data,
        );
        assert!(matches!(err, Err(RuntimeError::ShapeConflict { .. })));
    }

    #[test]
    fn test_shape_mismatch_on_incompatible_data() {
        // data length 3 cannot broadcast against the plate's size-2 draws
        let data = TensorData::from_vec(vec![-0.5, 2.0, 1.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let err = Elbo::new(1).loss_and_grads(
            &mut store,
            &mut rng,
            poisson_model,
            poisson_guide,
            &data,
        );
        assert!(matches!(err, Err(RuntimeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zero_particles_rejected() {
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let elbo = Elbo {
            num_particles: 0,
            ..Default::default()
        };
        let err = elbo.loss_and_grads(&mut store, &mut rng, poisson_model, poisson_guide, &data);
        assert!(matches!(err, Err(RuntimeError::InvalidOperation { .. })));
    }

    #[test]
    fn test_strict_enumeration_flag_accepted() {
        let data = TensorData::from_vec(vec![-0.5, 2.0]);
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let elbo = Elbo {
            strict_enumeration_warning: false,
            ..Elbo::new(1)
        };
        let loss = elbo
            .loss_and_grads(&mut store, &mut rng, poisson_model, poisson_guide, &data)
            .unwrap();
        assert!(loss.is_finite());
    }
}
