//! The coverage map every instrumentation callback writes into.
//!
//! Two regions exist: a static fallback that is valid from the first
//! instruction of the process, so constructor-time instrumentation has
//! somewhere to write, and the driver's shared-memory segment once
//! [`attach`] has run. Exactly one of them is active; switching is a pointer
//! swap.
//!
//! Bytes 0..16 double as the extraction record (four native-endian 32-bit
//! words: target id, operand 1, operand 2, completion marker). In coverage
//! builds byte 0 is the liveness marker instead.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use tracing::{debug, info};

use crate::config::{MAP_SIZE, RuntimeConfig};
use crate::error::RuntimeError;

/// Value written to slot 0 so the driver can tell an attached map from an empty one.
pub const LIVE_MARKER: u8 = 1;

static FALLBACK: [AtomicU8; MAP_SIZE] = [const { AtomicU8::new(0) }; MAP_SIZE];

/// Null means the fallback region is active.
static ACTIVE: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());

fn fallback_ptr() -> *mut u8 {
    FALLBACK.as_ptr().cast_mut().cast()
}

pub fn active_ptr() -> *mut u8 {
    let attached = ACTIVE.load(Ordering::Relaxed);
    if attached.is_null() {
        fallback_ptr()
    } else {
        attached
    }
}

pub fn is_attached() -> bool {
    !ACTIVE.load(Ordering::Relaxed).is_null()
}

/// A view of a coverage region.
///
/// Every access is one relaxed atomic load or store, so any number of
/// instrumented threads can hold the same view. Racing updates of one byte
/// may drop a count; they never tear it.
#[derive(Debug, Clone, Copy)]
pub struct Area<'a> {
    bytes: &'a [AtomicU8],
}

impl<'a> Area<'a> {
    pub fn new(bytes: &'a [AtomicU8]) -> Self {
        Self { bytes }
    }

    /// Views an exclusively borrowed buffer.
    pub fn from_mut(bytes: &'a mut [u8]) -> Self {
        // SAFETY: AtomicU8 has the size, alignment and bit validity of u8,
        // and the unique borrow rules out plain accesses while the view lives.
        let bytes = unsafe { &*(ptr::from_mut(bytes) as *const [AtomicU8]) };
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, idx: usize) -> u8 {
        self.bytes[idx].load(Ordering::Relaxed)
    }

    pub fn set(&self, idx: usize, value: u8) {
        self.bytes[idx].store(value, Ordering::Relaxed);
    }

    /// Hit counter increment, wrapping at 256.
    pub fn bump(&self, idx: usize) {
        let byte = &self.bytes[idx];
        byte.store(byte.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
    }

    pub fn fill(&self, value: u8) {
        for byte in self.bytes {
            byte.store(value, Ordering::Relaxed);
        }
    }

    /// Reads 32-bit word `index` of the extraction record.
    pub fn read_word(&self, index: usize) -> i32 {
        let start = index * 4;
        let mut word = [0u8; 4];
        for (i, out) in word.iter_mut().enumerate() {
            *out = self.get(start + i);
        }
        i32::from_ne_bytes(word)
    }

    pub fn write_word(&self, index: usize, value: i32) {
        let start = index * 4;
        for (i, byte) in value.to_ne_bytes().into_iter().enumerate() {
            self.set(start + i, byte);
        }
    }
}

/// The currently active region.
pub fn active() -> Area<'static> {
    // SAFETY: both regions are MAP_SIZE bytes, stay mapped for the rest of
    // the process, and inside the process are only touched through `Area`.
    let bytes = unsafe { std::slice::from_raw_parts(active_ptr().cast_const().cast::<AtomicU8>(), MAP_SIZE) };
    Area::new(bytes)
}

/// Makes `area` the active region.
///
/// # Safety
///
/// `area` must point to at least `MAP_SIZE` writable bytes that stay mapped
/// for the rest of the process lifetime.
pub unsafe fn set_active(area: *mut u8) {
    ACTIVE.store(area, Ordering::Relaxed);
}

/// Pivots back to the private fallback region.
pub fn detach_to_fallback() {
    ACTIVE.store(ptr::null_mut(), Ordering::Relaxed);
}

/// Maps the SysV segment `shm_id` and makes it the active region.
pub fn attach(shm_id: i32) -> Result<(), RuntimeError> {
    // SAFETY: shmat either maps the segment or returns (void*)-1.
    let area = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
    if area as isize == -1 {
        return Err(RuntimeError::ShmAttach {
            shm_id,
            source: std::io::Error::last_os_error(),
        });
    }

    // SAFETY: the driver allocates MAP_SIZE bytes and owns the segment's
    // lifetime; we never detach it.
    unsafe { set_active(area.cast()) };
    mark_live();
    info!(shm_id, "attached coverage map");
    Ok(())
}

/// Attaches when the driver supplied a segment. Returns whether it did.
pub fn attach_from(config: &RuntimeConfig) -> Result<bool, RuntimeError> {
    match config.shm_id {
        Some(shm_id) => attach(shm_id).map(|()| true),
        None => {
            debug!("no shared memory id supplied, keeping fallback map");
            Ok(false)
        }
    }
}

pub fn clear() {
    active().fill(0);
}

pub fn mark_live() {
    active().set(0, LIVE_MARKER);
}

/// Driver-side twin of [`Area::read_word`] for a plain buffer.
pub fn read_word(area: &[u8], index: usize) -> i32 {
    let start = index * 4;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&area[start..start + 4]);
    i32::from_ne_bytes(bytes)
}

pub fn write_word(area: &mut [u8], index: usize, value: i32) {
    let start = index * 4;
    area[start..start + 4].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
pub(crate) fn scratch(len: usize) -> Vec<AtomicU8> {
    (0..len).map(|_| AtomicU8::new(0)).collect()
}
