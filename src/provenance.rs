// src/provenance.rs
//
// Provenance is the set of upstream latent-draw names a value causally
// depends on. Every tensor op unions the sets of its operands, so the
// transitive closure is maintained incrementally: a draw tagged {a} feeding
// a draw b makes b's value carry {a, b}, and anything downstream of b
// inherits both.

use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provenance(Option<Arc<BTreeSet<String>>>);

impl Provenance {
    pub fn empty() -> Self {
        Provenance(None)
    }

    pub fn of(name: &str) -> Self {
        let mut set = BTreeSet::new();
        set.insert(name.to_string());
        Provenance(Some(Arc::new(set)))
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            None => true,
            Some(set) => set.is_empty(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match &self.0 {
            None => false,
            Some(set) => set.contains(name),
        }
    }

    pub fn union(&self, other: &Provenance) -> Provenance {
        match (&self.0, &other.0) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(a), Some(b)) => {
                if a.is_superset(b) {
                    return self.clone();
                }
                if b.is_superset(a) {
                    return other.clone();
                }
                let merged: BTreeSet<String> = a.union(b).cloned().collect();
                Provenance(Some(Arc::new(merged)))
            }
        }
    }

    /// The set extended with one more draw name.
    pub fn with(&self, name: &str) -> Provenance {
        if self.contains(name) {
            return self.clone();
        }
        let mut set = match &self.0 {
            None => BTreeSet::new(),
            Some(s) => (**s).clone(),
        };
        set.insert(name.to_string());
        Provenance(Some(Arc::new(set)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().flat_map(|set| set.iter().map(|s| s.as_str()))
    }
}
