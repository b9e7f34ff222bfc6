//! Safe instrumentation entry points over the active map.
//!
//! The C ABI exported by `siderail_rt` forwards here; Rust harnesses that
//! are not compiled with the instrumentation pass can call these directly.

use crate::cmp::{self, BranchState, Operand, PrefixRecord};
use std::ffi::c_char;

use crate::extract::{self, Capture};
use crate::map;

pub use crate::edge::trace_edge;
pub use crate::persistent::persistent_loop;

pub fn log_cmp<T: Operand>(br_id: i32, tag: i32, op1: T, op2: T) -> Option<BranchState> {
    cmp::log_branch(map::active(), br_id, tag, op1, op2)
}

pub fn log_strcmp(br_id: i32, ret: i32) -> Option<BranchState> {
    cmp::log_strcmp(map::active(), br_id, ret)
}

pub fn log_strncmp(br_id: i32, len: i32, ret: i32) -> PrefixRecord {
    cmp::log_strncmp(map::active(), br_id, len, ret)
}

/// Ends the process if `br_id` is the extraction target.
pub fn check_cmp<T: Operand>(br_id: i32, op1: T, op2: T) {
    finish(extract::capture(map::active(), br_id, op1, op2));
}

pub fn check_bytes(br_id: i32, op1: &[u8], op2: &[u8]) {
    finish(extract::capture_bytes(map::active(), br_id, op1, op2));
}

/// C-string form of [`check_bytes`].
///
/// # Safety
///
/// Non-null `op1`/`op2` must point to at least one readable byte.
pub unsafe fn check_c_strings(br_id: i32, op1: *const c_char, op2: *const c_char) {
    // SAFETY: forwarded from the caller.
    finish(unsafe { extract::capture_c_strings(map::active(), br_id, op1, op2) });
}

fn finish(captured: Option<Capture>) {
    if captured.is_some() {
        std::process::exit(0);
    }
}
