// src/runtime/handler.rs
//
// Interceptors for draw/param statements. Each statement request travels
// through the active handlers twice: `process` from outermost to innermost
// before the default effect, `postprocess` from innermost to outermost
// after it. Recording, replay, provenance tagging and plate annotation are
// each one small handler composed on the stack.

use std::rc::Rc;

use crate::ad::types::Tensor;
use crate::dist::Distribution;
use crate::provenance::Provenance;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::plate::PlateFrame;
use crate::runtime::trace::{Site, SiteKind, Trace};

#[derive(Debug)]
pub enum MessageKind {
    Sample {
        dist: Option<Box<dyn Distribution>>,
    },
    Param,
}

/// One statement request, mutated in place as it moves through the stack.
#[derive(Debug)]
pub struct Message {
    pub name: String,
    pub kind: MessageKind,
    pub value: Option<Tensor>,
    pub observed: bool,
    /// Set when a handler resolved the statement; suppresses the default
    /// effect.
    pub done: bool,
    /// Enclosing plates, outermost first.
    pub plates: Vec<PlateFrame>,
    /// Site-level provenance, filled by the provenance tracker.
    pub provenance: Provenance,
}

impl Message {
    pub fn sample(name: &str, dist: Box<dyn Distribution>, observed: Option<Tensor>) -> Self {
        let is_observed = observed.is_some();
        Message {
            name: name.to_string(),
            kind: MessageKind::Sample { dist: Some(dist) },
            value: observed,
            observed: is_observed,
            done: false,
            plates: Vec::new(),
            provenance: Provenance::empty(),
        }
    }

    pub fn param(name: &str, value: Tensor) -> Self {
        Message {
            name: name.to_string(),
            kind: MessageKind::Param,
            value: Some(value),
            observed: false,
            done: true,
            plates: Vec::new(),
            provenance: Provenance::empty(),
        }
    }
}

/// The closed set of handler behaviors.
#[derive(Debug)]
pub enum Handler {
    Trace(TraceHandler),
    Replay(ReplayHandler),
    Provenance(ProvenanceTracker),
    Plate(PlateHandler),
}

impl Handler {
    pub fn process(&mut self, msg: &mut Message) -> RuntimeResult<()> {
        match self {
            Handler::Replay(h) => h.process(msg),
            Handler::Plate(h) => {
                h.process(msg);
                Ok(())
            }
            Handler::Trace(_) | Handler::Provenance(_) => Ok(()),
        }
    }

    pub fn postprocess(&mut self, msg: &mut Message) -> RuntimeResult<()> {
        match self {
            Handler::Trace(h) => h.postprocess(msg),
            Handler::Provenance(h) => {
                h.postprocess(msg);
                Ok(())
            }
            Handler::Replay(_) | Handler::Plate(_) => Ok(()),
        }
    }
}

/// Records every resolved statement into a trace, preserving order.
#[derive(Debug)]
pub struct TraceHandler {
    trace: Trace,
}

impl TraceHandler {
    pub fn new(max_plate_nesting: usize) -> Self {
        TraceHandler {
            trace: Trace::new(max_plate_nesting),
        }
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    fn postprocess(&mut self, msg: &mut Message) -> RuntimeResult<()> {
        let value = msg.value.clone().ok_or_else(|| RuntimeError::InvalidOperation {
            message: format!("statement '{}' reached recording unresolved", msg.name),
        })?;
        let (kind, dist) = match &mut msg.kind {
            MessageKind::Param => (SiteKind::Param, None),
            MessageKind::Sample { dist } => {
                let kind = if msg.observed {
                    SiteKind::Observed
                } else {
                    SiteKind::Latent
                };
                (kind, dist.take())
            }
        };
        self.trace.insert(Site {
            name: msg.name.clone(),
            kind,
            dist,
            value,
            log_prob: None,
            plates: msg.plates.clone(),
            provenance: msg.provenance.clone(),
        })
    }
}

/// Forces latent draws to the values a reference trace recorded. A latent
/// name absent from the source is a structural guide/model mismatch.
#[derive(Debug)]
pub struct ReplayHandler {
    source: Rc<Trace>,
}

impl ReplayHandler {
    pub fn new(source: Rc<Trace>) -> Self {
        ReplayHandler { source }
    }

    fn process(&mut self, msg: &mut Message) -> RuntimeResult<()> {
        if !matches!(msg.kind, MessageKind::Sample { .. }) || msg.observed {
            return Ok(());
        }
        match self.source.get(&msg.name) {
            Some(site) => {
                msg.value = Some(site.value.clone());
                msg.done = true;
                Ok(())
            }
            None => Err(RuntimeError::ReplayMiss {
                name: msg.name.clone(),
            }),
        }
    }
}

/// Attaches provenance: a latent draw's value is tagged with its own name
/// plus everything its distribution's parameters depend on; the site-level
/// set additionally backs the estimator's downstream scoping. Replayed
/// values keep their original tag and pick up the replaying execution's
/// parameter provenance.
#[derive(Debug, Default)]
pub struct ProvenanceTracker;

impl ProvenanceTracker {
    fn postprocess(&mut self, msg: &mut Message) {
        let MessageKind::Sample { dist } = &msg.kind else {
            return;
        };
        let dist_prov = dist
            .as_ref()
            .map(|d| d.provenance())
            .unwrap_or_default();
        if let Some(value) = msg.value.take() {
            let base = dist_prov.union(value.provenance());
            let site_prov = if msg.observed {
                base
            } else {
                base.with(&msg.name)
            };
            msg.provenance = site_prov.clone();
            msg.value = Some(value.with_provenance(site_prov));
        }
    }
}

/// Annotates statements with the enclosing plate frame.
#[derive(Debug)]
pub struct PlateHandler {
    pub frame: PlateFrame,
}

impl PlateHandler {
    fn process(&mut self, msg: &mut Message) {
        msg.plates.push(self.frame.clone());
    }
}
