// src/ad/mod.rs

pub mod backward;
pub mod graph;
pub mod types;

use crate::ad::graph::Tape;
pub use backward::backward;
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static TAPE_STORAGE: RefCell<HashMap<usize, Tape>> = RefCell::new(HashMap::new());
    static NEXT_TAPE_ID: RefCell<usize> = RefCell::new(1);
}

pub fn create_tape() -> usize {
    TAPE_STORAGE.with(|storage| {
        let mut map = storage.borrow_mut();
        let id = NEXT_TAPE_ID.with(|n| {
            let mut i = n.borrow_mut();
            let res = *i;
            *i += 1;
            res
        });
        map.insert(id, Tape::new());
        id
    })
}

pub fn remove_tape(tape_id: usize) {
    TAPE_STORAGE.with(|storage| {
        storage.borrow_mut().remove(&tape_id);
    });
}

pub fn with_tape<F, R>(tape_id: usize, f: F) -> R
where
    F: FnOnce(&Tape) -> R,
{
    TAPE_STORAGE.with(|storage| {
        let map = storage.borrow();
        let tape = map
            .get(&tape_id)
            .expect("Tape accessing error: Tape ID not found in current thread storage.");
        f(tape)
    })
}
