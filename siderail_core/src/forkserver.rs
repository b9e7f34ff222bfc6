//! Fork server: lets the driver run the target repeatedly without paying for
//! `execve` and start-up on every iteration.
//!
//! The protocol runs over two pipes on fixed descriptors. Every frame is
//! exactly four bytes:
//!
//! 1. server → driver: hello (once; failure means no driver, run standalone)
//! 2. driver → server: go token (non-zero: "I already killed your stopped child")
//! 3. server → driver: child pid
//! 4. server → driver: raw wait status
//!
//! Steps 2 to 4 repeat until the driver closes its end.

use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid};
use tracing::{debug, trace};

use crate::config::FORKSRV_FD;
use crate::error::RuntimeError;

pub const FRAME_LEN: usize = 4;
const HELLO: [u8; FRAME_LEN] = [0; FRAME_LEN];

/// Where the server is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingHandshake,
    Idle,
    ChildRunning(Pid),
    /// Persistent mode: the child stopped itself after an iteration and can be resumed.
    ChildStopped(Pid),
}

/// How control leaves [`ForkServer::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// No driver answered the hello; the target runs once, outside the protocol.
    Standalone,
    /// We are the freshly forked child and should run the target.
    Child,
}

/// Result of duplicating the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(Pid),
    Child,
}

/// Re-encodes a decoded wait status in the kernel's `wait(2)` layout, which
/// is what the driver expects on the status pipe.
pub fn raw_status(status: &WaitStatus) -> i32 {
    match *status {
        WaitStatus::Exited(_, code) => (code & 0xff) << 8,
        WaitStatus::Signaled(_, sig, core_dumped) => (sig as i32) | if core_dumped { 0x80 } else { 0 },
        WaitStatus::Stopped(_, sig) => ((sig as i32) << 8) | 0x7f,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        WaitStatus::PtraceEvent(_, sig, event) => (event << 16) | ((sig as i32) << 8) | 0x7f,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        WaitStatus::PtraceSyscall(_) => ((libc::SIGTRAP | 0x80) << 8) | 0x7f,
        WaitStatus::Continued(_) => 0xffff,
        WaitStatus::StillAlive => 0,
    }
}

/// The two fork server pipes.
pub trait ControlPipe {
    /// Reads one go token.
    fn read_frame(&mut self) -> Result<u32, RuntimeError>;
    fn write_frame(&mut self, frame: [u8; FRAME_LEN]) -> Result<(), RuntimeError>;
    /// Drops both descriptors. Called in the child right after fork.
    fn close(&mut self);
}

/// Process management the server relies on.
pub trait ProcessOps {
    fn fork(&mut self) -> Result<Fork, RuntimeError>;
    /// Blocks until `pid` exits, or also until it stops when `untraced` is set.
    fn wait(&mut self, pid: Pid, untraced: bool) -> Result<WaitStatus, RuntimeError>;
    /// Resumes a child that stopped itself (SIGCONT).
    fn resume(&mut self, pid: Pid) -> Result<(), RuntimeError>;
}

/// Hooks run at fixed points of each fork server iteration.
pub trait ForkServerHook {
    /// Runs before fork, so its effects are shared by parent and child.
    fn pre_fork(&mut self) {}

    /// Runs in the child just after it has been created.
    fn post_child_fork(&mut self) {}

    /// Runs in the parent just after the child has been created.
    fn post_parent_fork(&mut self, _child: Pid) {}

    /// Runs in the parent after the child exited or stopped.
    fn post_parent_wait(&mut self, _status: &WaitStatus) {}
}

/// Traces every iteration the server relays.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceHook {
    iterations: u64,
}

impl TraceHook {
    /// Children reported to the driver so far, resumed ones included.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

impl ForkServerHook for TraceHook {
    fn post_parent_fork(&mut self, child: Pid) {
        trace!(pid = child.as_raw(), "forked child");
    }

    fn post_parent_wait(&mut self, status: &WaitStatus) {
        self.iterations += 1;
        trace!(iteration = self.iterations, ?status, "child iteration done");
    }
}

/// Pipes on raw descriptors, by default [`FORKSRV_FD`] and `FORKSRV_FD + 1`.
#[derive(Debug, Clone, Copy)]
pub struct FdPipe {
    control: RawFd,
    status: RawFd,
}

impl FdPipe {
    pub fn new(control: RawFd, status: RawFd) -> Self {
        Self { control, status }
    }
}

impl Default for FdPipe {
    fn default() -> Self {
        Self::new(FORKSRV_FD, FORKSRV_FD + 1)
    }
}

/// Retries `op` while it fails with `EINTR`.
fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

impl ControlPipe for FdPipe {
    fn read_frame(&mut self) -> Result<u32, RuntimeError> {
        let mut frame = [0u8; FRAME_LEN];
        let n = retry_eintr(|| nix::unistd::read(self.control, &mut frame))
            .map_err(|errno| RuntimeError::PipeIo(errno.into()))?;
        match n {
            0 => Err(RuntimeError::DriverGone),
            FRAME_LEN => Ok(u32::from_ne_bytes(frame)),
            short => Err(RuntimeError::ShortRead(short)),
        }
    }

    fn write_frame(&mut self, frame: [u8; FRAME_LEN]) -> Result<(), RuntimeError> {
        // SAFETY: the status descriptor stays open until `close`.
        let status = unsafe { BorrowedFd::borrow_raw(self.status) };
        let n = retry_eintr(|| nix::unistd::write(status, &frame))
            .map_err(|errno| RuntimeError::PipeIo(errno.into()))?;
        if n != FRAME_LEN {
            return Err(RuntimeError::ShortWrite(n));
        }
        Ok(())
    }

    fn close(&mut self) {
        // Errors are irrelevant in the child.
        let _ = nix::unistd::close(self.control);
        let _ = nix::unistd::close(self.status);
    }
}

/// The real `fork`/`waitpid`/`kill` trio.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcess;

impl ProcessOps for UnixProcess {
    fn fork(&mut self) -> Result<Fork, RuntimeError> {
        // SAFETY: the target is single-threaded at this point by contract; the
        // child only returns into the target's own start-up path.
        match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Parent { child }) => Ok(Fork::Parent(child)),
            Ok(ForkResult::Child) => Ok(Fork::Child),
            Err(errno) => Err(RuntimeError::Fork(errno)),
        }
    }

    fn wait(&mut self, pid: Pid, untraced: bool) -> Result<WaitStatus, RuntimeError> {
        let flags = untraced.then_some(WaitPidFlag::WUNTRACED);
        retry_eintr(|| waitpid(pid, flags)).map_err(|source| RuntimeError::Wait {
            pid: pid.as_raw(),
            source,
        })
    }

    fn resume(&mut self, pid: Pid) -> Result<(), RuntimeError> {
        kill(pid, Signal::SIGCONT).map_err(|source| RuntimeError::Signal {
            pid: pid.as_raw(),
            source,
        })
    }
}

pub struct ForkServer<P, O, H = TraceHook> {
    pipe: P,
    procs: O,
    hook: H,
    persistent: bool,
    state: ServerState,
}

impl ForkServer<FdPipe, UnixProcess, TraceHook> {
    /// A server on the standard descriptors with real process control.
    pub fn standard(persistent: bool) -> Self {
        Self::new(FdPipe::default(), UnixProcess, TraceHook::default(), persistent)
    }
}

impl<P, O, H> ForkServer<P, O, H>
where
    P: ControlPipe,
    O: ProcessOps,
    H: ForkServerHook,
{
    pub fn new(pipe: P, procs: O, hook: H, persistent: bool) -> Self {
        Self {
            pipe,
            procs,
            hook,
            persistent,
            state: ServerState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// Runs the protocol.
    ///
    /// Returns in the child (once per fork) and when no driver is present.
    /// The parent side only comes back with an error, which the caller is
    /// expected to treat as fatal.
    pub fn run(&mut self) -> Result<ServerExit, RuntimeError> {
        if self.pipe.write_frame(HELLO).is_err() {
            debug!("no fork server driver, running standalone");
            return Ok(ServerExit::Standalone);
        }
        self.state = ServerState::Idle;
        debug!(persistent = self.persistent, "fork server handshake done");

        loop {
            if let Some(exit) = self.serve_one()? {
                return Ok(exit);
            }
        }
    }

    fn serve_one(&mut self) -> Result<Option<ServerExit>, RuntimeError> {
        let was_killed = self.pipe.read_frame()?;

        // The driver may have SIGKILLed a stopped child on timeout; write it off.
        if let ServerState::ChildStopped(pid) = self.state {
            if was_killed != 0 {
                self.procs.wait(pid, false)?;
                self.state = ServerState::Idle;
            }
        }

        let child = match self.state {
            ServerState::ChildStopped(pid) => {
                self.procs.resume(pid)?;
                pid
            }
            _ => {
                self.hook.pre_fork();
                match self.procs.fork()? {
                    Fork::Child => {
                        self.pipe.close();
                        self.hook.post_child_fork();
                        return Ok(Some(ServerExit::Child));
                    }
                    Fork::Parent(pid) => {
                        self.hook.post_parent_fork(pid);
                        pid
                    }
                }
            }
        };
        self.state = ServerState::ChildRunning(child);

        self.pipe.write_frame(child.as_raw().to_ne_bytes())?;
        let status = self.procs.wait(child, self.persistent)?;
        self.hook.post_parent_wait(&status);

        self.state = if matches!(status, WaitStatus::Stopped(..)) {
            ServerState::ChildStopped(child)
        } else {
            ServerState::Idle
        };

        self.pipe.write_frame(raw_status(&status).to_ne_bytes())?;
        Ok(None)
    }
}
