//! Body of the `siderail-demo` target.
//!
//! It calls the runtime through the safe instrumentation API, so it needs no
//! compiler pass. Branch ids are fixed so drivers and tests can look them up.

use std::cmp::Ordering;
use std::time::Duration;

use siderail_core::instr;

/// When set, the demo runs its extraction checks instead of its logging sites.
pub const EXTRACT_ENV_VAR: &str = "SIDERAIL_DEMO_EXTRACT";

pub const BR_FIRST_BYTE: i32 = 0x101;
pub const BR_LENGTH: i32 = 0x102;
pub const BR_MAGIC: i32 = 0x103;
pub const BR_PREFIX: i32 = 0x104;

pub const MAGIC: &[u8] = b"GOOD";
pub const PREFIX_LEN: usize = 3;

const EDGE_ENTRY: u32 = 0x1a2b;
const EDGE_LEADING_C: u32 = 0x3c4d;
const EDGE_MAGIC: u32 = 0x5e6f;

const TAG_GT: i32 = 0;
const TAG_EQ: i32 = 2;

fn strcmp_like(a: &[u8], b: &[u8]) -> i32 {
    match a.cmp(b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn first_byte(data: &[u8]) -> i8 {
    data.first().map_or(0, |&b| b as i8)
}

/// One iteration in coverage mode.
///
/// `CRASH...` aborts and `HANG...` never returns.
pub fn exercise(data: &[u8]) {
    instr::trace_edge(EDGE_ENTRY);

    let first = first_byte(data);
    instr::log_cmp(BR_FIRST_BYTE, TAG_EQ, first, b'C' as i8);
    instr::log_cmp(BR_LENGTH, TAG_GT, data.len() as i64, MAGIC.len() as i64);

    let magic = strcmp_like(data, MAGIC);
    instr::log_strcmp(BR_MAGIC, magic);
    let head = &data[..data.len().min(PREFIX_LEN)];
    instr::log_strncmp(BR_PREFIX, PREFIX_LEN as i32, strcmp_like(head, &MAGIC[..PREFIX_LEN]));

    if first == b'C' as i8 {
        instr::trace_edge(EDGE_LEADING_C);
        if data.starts_with(b"CRASH") {
            std::process::abort();
        }
    }
    if magic == 0 {
        instr::trace_edge(EDGE_MAGIC);
    }
    if data.starts_with(b"HANG") {
        loop {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

/// One iteration in extraction mode. Exits the process at the seeded site.
pub fn check_sites(data: &[u8]) {
    instr::check_cmp(BR_FIRST_BYTE, first_byte(data), b'C' as i8);
    instr::check_cmp(BR_LENGTH, data.len() as i64, MAGIC.len() as i64);
    instr::check_bytes(BR_MAGIC, data, MAGIC);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strcmp_like_orders_bytes() {
        assert_eq!(strcmp_like(b"GOOD", MAGIC), 0);
        assert_eq!(strcmp_like(b"BAD", MAGIC), -1);
        assert_eq!(strcmp_like(b"GOODS", MAGIC), 1);
    }

    #[test]
    fn branch_ids_stay_clear_of_extraction_words() {
        for id in [BR_FIRST_BYTE, BR_LENGTH, BR_MAGIC, BR_PREFIX] {
            assert!(id as usize >= 16, "branch {id:#x} overlaps words 0 to 3");
        }
    }
}
