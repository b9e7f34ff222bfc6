//! Extraction mode: report the concrete operands of one pre-selected
//! comparison and end the run.
//!
//! The driver writes the wanted branch id into word 0 of the map before
//! sending the go token. The first comparison site with that id fills
//! words 1 to 3 and the process exits; every other site is a single compare.

use std::ffi::c_char;

use crate::cmp::Operand;
use crate::map::{Area, read_word};

pub const TARGET_WORD: usize = 0;
pub const OP1_WORD: usize = 1;
pub const OP2_WORD: usize = 2;
pub const MARKER_WORD: usize = 3;

/// Written to word 3 once both operands are in place.
pub const COMPLETION_MARKER: i32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub op1: i32,
    pub op2: i32,
}

impl Capture {
    /// Reads a completed record back out of a map.
    pub fn from_map(area: &[u8]) -> Option<Self> {
        (read_word(area, MARKER_WORD) == COMPLETION_MARKER).then(|| Capture {
            op1: read_word(area, OP1_WORD),
            op2: read_word(area, OP2_WORD),
        })
    }
}

pub fn target_id(area: Area<'_>) -> i32 {
    area.read_word(TARGET_WORD)
}

fn store(area: Area<'_>, br_id: i32, op1: i32, op2: i32) -> Option<Capture> {
    if br_id != target_id(area) {
        return None;
    }
    area.write_word(OP1_WORD, op1);
    area.write_word(OP2_WORD, op2);
    area.write_word(MARKER_WORD, COMPLETION_MARKER);
    Some(Capture { op1, op2 })
}

/// Writes the operands if `br_id` is the seeded target. Never touches the
/// map otherwise.
pub fn capture<T: Operand>(area: Area<'_>, br_id: i32, op1: T, op2: T) -> Option<Capture> {
    store(area, br_id, op1.as_record(), op2.as_record())
}

/// String variant: records the first byte of each operand.
pub fn capture_bytes(area: Area<'_>, br_id: i32, op1: &[u8], op2: &[u8]) -> Option<Capture> {
    let first = |s: &[u8]| s.first().map_or(0, |&b| b as c_char as i32);
    store(area, br_id, first(op1), first(op2))
}

/// First byte of a C string as a signed `char`; null counts as 0.
///
/// # Safety
///
/// A non-null `s` must point to at least one readable byte.
pub unsafe fn first_c_byte(s: *const c_char) -> i32 {
    if s.is_null() {
        0
    } else {
        // SAFETY: guaranteed by the caller.
        unsafe { *s as i32 }
    }
}

/// C-string variant used by the ABI shims.
///
/// # Safety
///
/// See [`first_c_byte`].
pub unsafe fn capture_c_strings(
    area: Area<'_>,
    br_id: i32,
    op1: *const c_char,
    op2: *const c_char,
) -> Option<Capture> {
    if br_id != target_id(area) {
        return None;
    }
    // SAFETY: forwarded from the caller.
    let (a, b) = unsafe { (first_c_byte(op1), first_c_byte(op2)) };
    store(area, br_id, a, b)
}
