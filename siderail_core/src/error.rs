use thiserror::Error;

/// Failures that break the contract between the runtime and its driver.
///
/// None of these are recoverable from inside the target: the C ABI turns
/// every one of them into process termination through [`fatal`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid AFL_INST_RATIO {0:?} (must be 1-100)")]
    InvalidInstRatio(String),
    #[error("Invalid __AFL_SHM_ID {0:?}")]
    InvalidShmId(String),
    #[error("Unable to attach shared memory segment {shm_id}: {source}")]
    ShmAttach {
        shm_id: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("Short read on fork server control pipe: expected 4 bytes, got {0}")]
    ShortRead(usize),
    #[error("Short write on fork server status pipe: expected 4 bytes, wrote {0}")]
    ShortWrite(usize),
    #[error("Fork server control pipe closed by driver")]
    DriverGone,
    #[error("Fork server pipe I/O failed: {0}")]
    PipeIo(#[source] std::io::Error),
    #[error("Unable to fork target process: {0}")]
    Fork(#[source] nix::Error),
    #[error("Unable to wait for child {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: nix::Error,
    },
    #[error("Unable to signal child {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

/// How the process goes down after a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `abort()`: raises SIGABRT so the driver sees a crash-like status.
    Abort,
    /// `_exit(code)`: skips exit handlers, which matters in a freshly forked child.
    Exit(i32),
}

impl RuntimeError {
    pub fn termination(&self) -> Termination {
        match self {
            RuntimeError::InvalidInstRatio(_) => Termination::Abort,
            _ => Termination::Exit(1),
        }
    }
}

/// Prints a diagnostic to stderr and terminates the process.
pub fn fatal(err: RuntimeError) -> ! {
    eprintln!("[-] ERROR: {err}");
    match err.termination() {
        Termination::Abort => std::process::abort(),
        // SAFETY: _exit only ends the process; skipping atexit handlers and
        // stdio flushing is wanted in a forked child.
        Termination::Exit(code) => unsafe { libc::_exit(code) },
    }
}
