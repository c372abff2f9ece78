// src/runtime/trace.rs

use std::collections::HashMap;

use crate::ad::types::Tensor;
use crate::dist::Distribution;
use crate::provenance::Provenance;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::plate::PlateFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Latent,
    Observed,
    Param,
}

/// One recorded statement: its identity, realized value, and the metadata
/// the estimator needs (distribution, enclosing plates, provenance).
#[derive(Debug)]
pub struct Site {
    pub name: String,
    pub kind: SiteKind,
    pub dist: Option<Box<dyn Distribution>>,
    pub value: Tensor,
    pub log_prob: Option<Tensor>,
    pub plates: Vec<PlateFrame>,
    pub provenance: Provenance,
}

impl Site {
    pub fn is_draw(&self) -> bool {
        matches!(self.kind, SiteKind::Latent | SiteKind::Observed)
    }

    pub fn is_latent(&self) -> bool {
        self.kind == SiteKind::Latent
    }
}

/// The ordered record of one execution. Built fresh per run, never mutated
/// afterwards except by `compute_log_prob`.
#[derive(Debug, Default)]
pub struct Trace {
    pub max_plate_nesting: usize,
    order: Vec<String>,
    sites: HashMap<String, Site>,
}

impl Trace {
    pub fn new(max_plate_nesting: usize) -> Self {
        Trace {
            max_plate_nesting,
            order: Vec::new(),
            sites: HashMap::new(),
        }
    }

    pub fn insert(&mut self, site: Site) -> RuntimeResult<()> {
        if self.sites.contains_key(&site.name) {
            return Err(RuntimeError::DuplicateSite {
                name: site.name.clone(),
            });
        }
        self.order.push(site.name.clone());
        self.sites.insert(site.name.clone(), site);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Site> {
        self.sites.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sites.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Sites in execution order.
    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.order.iter().filter_map(|n| self.sites.get(n))
    }

    /// Materialize the density of every draw site at its realized value.
    /// This is the only place densities are computed; plate shape
    /// conformance is validated here, and subsample scales are applied.
    pub fn compute_log_prob(&mut self) -> RuntimeResult<()> {
        let names = self.order.clone();
        for name in names {
            let site = match self.sites.get_mut(&name) {
                Some(s) => s,
                None => continue,
            };
            if site.log_prob.is_some() {
                continue;
            }
            let dist = match &site.dist {
                Some(d) => d,
                None => continue,
            };
            let mut lp = dist.log_prob(&site.value)?;
            check_plate_shapes(&site.name, &site.plates, site.value.shape(), lp.shape())?;
            let scale: f64 = site.plates.iter().map(|f| f.scale).product();
            if scale != 1.0 {
                lp = lp * scale;
            }
            site.log_prob = Some(lp);
        }
        Ok(())
    }

    /// Sum of the stored density values over all draw sites.
    pub fn log_prob_sum(&self) -> f64 {
        self.sites()
            .filter_map(|s| s.log_prob.as_ref())
            .map(|lp| lp.data().sum())
            .sum()
    }
}

fn dim_size(shape: &[usize], dim: isize) -> Option<usize> {
    let idx = shape.len() as isize + dim;
    if idx < 0 {
        None
    } else {
        Some(shape[idx as usize])
    }
}

/// The density shape must carry every enclosing plate's axis exactly; the
/// value may lack leading axes (observed data broadcasting across the
/// particle axis) but may not disagree where it has them.
fn check_plate_shapes(
    site: &str,
    frames: &[PlateFrame],
    value_shape: &[usize],
    lp_shape: &[usize],
) -> RuntimeResult<()> {
    for f in frames {
        let want = f.axis_len();
        match dim_size(lp_shape, f.dim) {
            Some(found) if found == want => {}
            _ => {
                return Err(RuntimeError::ShapeConflict {
                    site: site.to_string(),
                    plate: f.name.clone(),
                    dim: f.dim,
                    expected: want,
                    found: lp_shape.to_vec(),
                })
            }
        }
        if let Some(found) = dim_size(value_shape, f.dim) {
            if found != want {
                return Err(RuntimeError::ShapeConflict {
                    site: site.to_string(),
                    plate: f.name.clone(),
                    dim: f.dim,
                    expected: want,
                    found: value_shape.to_vec(),
                });
            }
        }
    }
    Ok(())
}
