//! C ABI expected by the instrumentation pass and by sancov.
//!
//! Trailing `constant_loc` arguments tell which operand is a literal; the
//! runtime accepts and ignores them.

use std::ffi::{c_char, c_int, c_uint};

use siderail_core::{edge, init, instr, map, selector};

#[unsafe(no_mangle)]
pub extern "C" fn __afl_manual_init() {
    init::manual_init();
}

#[unsafe(no_mangle)]
pub extern "C" fn __afl_auto_init() {
    init::auto_init();
}

/// Returns 1 while the persistent loop body should run again.
#[unsafe(no_mangle)]
pub extern "C" fn __afl_persistent_loop(max_cnt: c_uint) -> c_int {
    c_int::from(instr::persistent_loop(max_cnt))
}

#[unsafe(no_mangle)]
pub extern "C" fn __afl_trace_edge(edge_id: u32) {
    edge::trace_edge(edge_id);
}

/// # Safety
///
/// `guard` must point to a guard initialised by
/// [`__sanitizer_cov_trace_pc_guard_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    // SAFETY: guaranteed by the caller.
    let guard = unsafe { *guard };
    selector::trace_pc_guard(map::active(), guard);
}

/// # Safety
///
/// `[start, stop)` must be a valid, writable guard range.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    if start.is_null() || start >= stop {
        return;
    }
    // SAFETY: guaranteed by the caller.
    let guards = unsafe {
        let len = stop.offset_from(start) as usize;
        std::slice::from_raw_parts_mut(start, len)
    };
    selector::init_guards(guards);
}

macro_rules! int_cmp_abi {
    ($($log:ident, $check:ident: $ty:ty);* $(;)?) => {
        $(
            #[unsafe(no_mangle)]
            pub extern "C" fn $log(br_id: c_int, ty: c_int, op1: $ty, op2: $ty, _constant_loc: c_int) {
                instr::log_cmp(br_id, ty, op1, op2);
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn $check(br_id: c_int, op1: $ty, op2: $ty, _constant_loc: c_int) {
                instr::check_cmp(br_id, op1, op2);
            }
        )*
    };
}

int_cmp_abi! {
    log_br8, check_br8: i8;
    log_br16, check_br16: i16;
    log_br32, check_br32: i32;
    log_br64, check_br64: i64;
}

#[unsafe(no_mangle)]
pub extern "C" fn log_strcmp(br_id: c_int, _ty: c_int, ret: c_int, _constant_loc: c_int) {
    instr::log_strcmp(br_id, ret);
}

#[unsafe(no_mangle)]
pub extern "C" fn log_strncmp(
    br_id: c_int,
    _ty: c_int,
    len: c_int,
    ret: c_int,
    _constant_loc: c_int,
) {
    instr::log_strncmp(br_id, len, ret);
}

/// # Safety
///
/// Non-null `op1`/`op2` must point to at least one readable byte.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn check_strcmp(
    br_id: c_int,
    _ty: c_int,
    op1: *const c_char,
    op2: *const c_char,
    _ret: c_int,
    _constant_loc: c_int,
) {
    // SAFETY: guaranteed by the caller.
    unsafe { instr::check_c_strings(br_id, op1, op2) };
}

/// # Safety
///
/// Same contract as [`check_strcmp`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn check_strncmp(
    br_id: c_int,
    _ty: c_int,
    op1: *const c_char,
    op2: *const c_char,
    _len: c_int,
    _ret: c_int,
    _constant_loc: c_int,
) {
    // SAFETY: guaranteed by the caller.
    unsafe { instr::check_c_strings(br_id, op1, op2) };
}
