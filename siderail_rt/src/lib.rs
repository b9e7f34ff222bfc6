//! Link this archive into a C or C++ target built with the instrumentation
//! pass. It carries the whole runtime ABI and starts the fork server from
//! an ELF constructor.
//!
//! The constructor lives in the same object file as the exported symbols,
//! so a plain `cc target.c libsiderail_rt.a` pulls it in as soon as the
//! target references any hook. The workspace profiles build this crate as a
//! single codegen unit to keep it that way; a target that references no hook
//! at all needs `-Wl,--whole-archive`.

mod ffi;

pub use ffi::*;

siderail_core::auto_init!();
