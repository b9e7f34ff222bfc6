//! In-process iteration: the target runs several inputs inside one forked
//! child, stopping itself between iterations so the fork server can report
//! each one to the driver.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nix::sys::signal::{Signal, raise};
use tracing::debug;

use crate::error::{RuntimeError, fatal};
use crate::{edge, map};

static PERSISTENT_MODE: AtomicBool = AtomicBool::new(false);
static LOOP: PersistentLoop = PersistentLoop::new();

pub fn set_persistent_mode(enabled: bool) {
    PERSISTENT_MODE.store(enabled, Ordering::Relaxed);
}

pub fn persistent_mode() -> bool {
    PERSISTENT_MODE.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// The per-run state the loop has to reset, plus the suspend/resume handshake.
pub trait LoopEnv {
    fn clear_map(&mut self);
    fn mark_live(&mut self);
    fn reset_prev_loc(&mut self);
    /// Stops attributing coverage to the loop body.
    fn detach(&mut self);
    /// Hands control back to the fork server and blocks until resumed.
    ///
    /// There is no way to cancel a suspension from inside; the driver either
    /// resumes the process or kills it.
    fn suspend(&mut self) -> Result<(), RuntimeError>;
}

/// The real environment: global map, calling thread's edge state, SIGSTOP.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLoopEnv;

impl LoopEnv for ProcessLoopEnv {
    fn clear_map(&mut self) {
        map::clear();
    }

    fn mark_live(&mut self) {
        map::mark_live();
    }

    fn reset_prev_loc(&mut self) {
        edge::reset_prev_loc();
    }

    fn detach(&mut self) {
        map::detach_to_fallback();
    }

    fn suspend(&mut self) -> Result<(), RuntimeError> {
        raise(Signal::SIGSTOP).map_err(|source| RuntimeError::Signal {
            pid: std::process::id() as i32,
            source,
        })
    }
}

/// Iteration budget bookkeeping for `__AFL_LOOP`-style harnesses.
#[derive(Debug)]
pub struct PersistentLoop {
    first_pass: AtomicBool,
    remaining: AtomicU32,
    exhausted: AtomicBool,
}

impl PersistentLoop {
    pub const fn new() -> Self {
        Self {
            first_pass: AtomicBool::new(true),
            remaining: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Called at the top of every loop iteration.
    ///
    /// Outside persistent mode this lets the body run exactly once. A budget
    /// of 0 behaves like 1.
    pub fn next<E: LoopEnv>(
        &self,
        persistent: bool,
        max_cnt: u32,
        env: &mut E,
    ) -> Result<LoopControl, RuntimeError> {
        if self.first_pass.swap(false, Ordering::Relaxed) {
            // Erase whatever ran before the loop; later iterations are
            // cleaned by the driver.
            if persistent {
                env.clear_map();
                env.mark_live();
                env.reset_prev_loc();
            }
            self.remaining.store(max_cnt.max(1), Ordering::Relaxed);
            return Ok(LoopControl::Continue);
        }

        if !persistent || self.exhausted.load(Ordering::Relaxed) {
            return Ok(LoopControl::Stop);
        }

        let left = self.remaining.load(Ordering::Relaxed).saturating_sub(1);
        self.remaining.store(left, Ordering::Relaxed);
        if left > 0 {
            env.suspend()?;
            env.mark_live();
            env.reset_prev_loc();
            return Ok(LoopControl::Continue);
        }

        env.detach();
        self.exhausted.store(true, Ordering::Relaxed);
        debug!("persistent loop budget exhausted");
        Ok(LoopControl::Stop)
    }
}

impl Default for PersistentLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide loop driver. Returns `true` while the body should run again.
pub fn persistent_loop(max_cnt: u32) -> bool {
    match LOOP.next(persistent_mode(), max_cnt, &mut ProcessLoopEnv) {
        Ok(control) => control == LoopControl::Continue,
        Err(err) => fatal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockEnv {
        area: Vec<u8>,
        prev_loc: u32,
        suspends: usize,
        detached: bool,
    }

    impl MockEnv {
        fn new() -> Self {
            Self {
                area: vec![0xAA; 64],
                prev_loc: 0x55,
                suspends: 0,
                detached: false,
            }
        }

        fn dirty(&mut self) {
            self.area[0] = 0;
            self.area[9] = 7;
            self.prev_loc = 1234;
        }
    }

    impl LoopEnv for MockEnv {
        fn clear_map(&mut self) {
            self.area.fill(0);
        }
        fn mark_live(&mut self) {
            self.area[0] = 1;
        }
        fn reset_prev_loc(&mut self) {
            self.prev_loc = 0;
        }
        fn detach(&mut self) {
            self.detached = true;
        }
        fn suspend(&mut self) -> Result<(), RuntimeError> {
            self.suspends += 1;
            Ok(())
        }
    }

    #[test]
    fn persistent_budget_of_three() {
        let controller = PersistentLoop::new();
        let mut env = MockEnv::new();

        assert_eq!(controller.next(true, 3, &mut env).unwrap(), LoopControl::Continue);
        assert!(env.area.iter().skip(1).all(|&b| b == 0), "First pass clears the map");
        assert_eq!((env.area[0], env.prev_loc), (1, 0));

        for call in 2..=3 {
            env.dirty();
            assert_eq!(
                controller.next(true, 3, &mut env).unwrap(),
                LoopControl::Continue,
                "Call {call} should continue"
            );
            assert_eq!(env.area[0], 1, "Slot 0 re-marked on call {call}");
            assert_eq!(env.prev_loc, 0, "prev_loc reset on call {call}");
            assert_eq!(env.area[9], 7, "Later calls leave the rest of the map to the driver");
        }
        assert_eq!(env.suspends, 2);
        assert!(!env.detached);

        assert_eq!(controller.next(true, 3, &mut env).unwrap(), LoopControl::Stop);
        assert!(env.detached, "Exiting the loop pivots to the fallback map");
        assert_eq!(env.suspends, 2, "The final call must not suspend");
    }

    #[test]
    fn stays_stopped_after_exhaustion() {
        let controller = PersistentLoop::new();
        let mut env = MockEnv::new();
        controller.next(true, 1, &mut env).unwrap();
        assert_eq!(controller.next(true, 1, &mut env).unwrap(), LoopControl::Stop);
        for _ in 0..3 {
            assert_eq!(controller.next(true, 1, &mut env).unwrap(), LoopControl::Stop);
        }
        assert_eq!(env.suspends, 0);
    }

    #[test]
    fn zero_budget_runs_once() {
        let controller = PersistentLoop::new();
        let mut env = MockEnv::new();
        assert_eq!(controller.next(true, 0, &mut env).unwrap(), LoopControl::Continue);
        assert_eq!(controller.next(true, 0, &mut env).unwrap(), LoopControl::Stop);
        assert_eq!(env.suspends, 0);
    }

    #[test]
    fn non_persistent_is_single_shot() {
        let controller = PersistentLoop::new();
        let mut env = MockEnv::new();
        assert_eq!(controller.next(false, 1000, &mut env).unwrap(), LoopControl::Continue);
        assert_eq!(env.area[5], 0xAA, "Map untouched outside persistent mode");
        assert_eq!(env.prev_loc, 0x55);
        for _ in 0..3 {
            assert_eq!(controller.next(false, 1000, &mut env).unwrap(), LoopControl::Stop);
        }
        assert_eq!(env.suspends, 0);
        assert!(!env.detached);
    }

    #[test]
    fn suspend_failure_propagates() {
        struct Broken(MockEnv);
        impl LoopEnv for Broken {
            fn clear_map(&mut self) {}
            fn mark_live(&mut self) {}
            fn reset_prev_loc(&mut self) {}
            fn detach(&mut self) {
                self.0.detached = true;
            }
            fn suspend(&mut self) -> Result<(), RuntimeError> {
                Err(RuntimeError::Signal {
                    pid: 1,
                    source: nix::Error::EPERM,
                })
            }
        }

        let controller = PersistentLoop::new();
        let mut env = Broken(MockEnv::new());
        controller.next(true, 5, &mut env).unwrap();
        assert!(matches!(
            controller.next(true, 5, &mut env),
            Err(RuntimeError::Signal { .. })
        ));
    }
}
