use std::cell::Cell;

use crate::config::MAP_SIZE;
use crate::map::{self, Area};

const INDEX_MASK: u32 = (MAP_SIZE - 1) as u32;

thread_local! {
    static PREV_LOC: Cell<u32> = const { Cell::new(0) };
}

/// Order-sensitive edge hashing over a coverage map.
///
/// `prev_loc` carries the last visited edge shifted right by one, so A→B and
/// B→A land in different slots and A→A does not collapse to slot 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EdgeHasher {
    pub prev_loc: u32,
}

impl EdgeHasher {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the slot the next hit of `edge_id` would land in.
    pub fn index(&self, edge_id: u32) -> usize {
        ((edge_id ^ self.prev_loc) & INDEX_MASK) as usize
    }

    /// Records one hit of `edge_id` and returns the slot it bumped.
    pub fn hit(&mut self, area: Area<'_>, edge_id: u32) -> usize {
        let index = self.index(edge_id);
        area.bump(index);
        self.prev_loc = (edge_id & INDEX_MASK) >> 1;
        index
    }

    pub fn reset(&mut self) {
        self.prev_loc = 0;
    }
}

/// Records an edge hit in the active map using the calling thread's state.
pub fn trace_edge(edge_id: u32) {
    PREV_LOC.with(|prev| {
        let mut hasher = EdgeHasher {
            prev_loc: prev.get(),
        };
        hasher.hit(map::active(), edge_id);
        prev.set(hasher.prev_loc);
    });
}

pub fn prev_loc() -> u32 {
    PREV_LOC.with(Cell::get)
}

pub fn set_prev_loc(value: u32) {
    PREV_LOC.with(|prev| prev.set(value));
}

/// Resets the calling thread's previous location.
pub fn reset_prev_loc() {
    set_prev_loc(0);
}
