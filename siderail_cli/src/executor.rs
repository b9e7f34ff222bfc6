//! Driver side of the fork-server protocol.
//!
//! [`ForkServerExecutor`] spawns an instrumented target once, with the
//! control and status pipes installed on the runtime's well-known fds, and
//! then asks its fork server for one child per input.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde::Serialize;
use siderail_core::config::{INST_RATIO_ENV_VAR, PERSIST_ENV_VAR, SHM_ENV_VAR};
use siderail_core::extract::TARGET_WORD;
use siderail_core::{Capture, FORKSRV_FD, MAP_SIZE, map};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigInputDelivery, ShowmapConfig};
use crate::shm::{SharedMap, ShmError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    Crash(String),
    Other(String),
}

impl ExecutionStatus {
    /// Maps a raw status relayed by the fork server.
    ///
    /// A child that stopped itself finished one persistent iteration.
    pub fn from_raw(pid: i32, raw: i32) -> Self {
        match WaitStatus::from_raw(Pid::from_raw(pid), raw) {
            Ok(WaitStatus::Exited(_, 0)) | Ok(WaitStatus::Stopped(_, _)) => ExecutionStatus::Ok,
            Ok(WaitStatus::Exited(_, code)) => ExecutionStatus::Crash(format!("Exited with code {code}")),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                ExecutionStatus::Crash(format!("Terminated by signal {}", signal as i32))
            }
            _ => ExecutionStatus::Other(format!("Unexpected wait status {raw:#x}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Target command is empty")]
    EmptyCommand,
    #[error("Temp file path is not valid UTF-8")]
    NonUtf8Path,
    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("Fork server handshake failed: {0}")]
    Handshake(String),
    #[error("Fork server went away")]
    ServerGone,
    #[error("Fork server sent an invalid child pid {0}")]
    BadPid(i32),
    #[error("Fork server did not report a child pid in time")]
    NoChild,
    #[error("I/O error talking to the fork server: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub pid: i32,
    pub raw_status: i32,
    pub status: ExecutionStatus,
}

pub struct ForkServerExecutor {
    server: Child,
    control: File,
    status: File,
    input: NamedTempFile,
    map: SharedMap,
    timeout: Duration,
    persistent: bool,
    child_killed: bool,
    last_pid: Option<i32>,
}

impl ForkServerExecutor {
    /// Starts the target and waits for its fork server to say hello.
    pub fn spawn(config: &ShowmapConfig) -> Result<Self, ExecutorError> {
        let settings = &config.executor;
        let runtime = &config.runtime;
        let (program, args) = settings
            .command
            .split_first()
            .ok_or(ExecutorError::EmptyCommand)?;

        let map = SharedMap::new(MAP_SIZE)?;
        let input = NamedTempFile::new()?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &settings.working_dir {
            cmd.current_dir(cwd);
        }

        match &settings.input_delivery {
            ConfigInputDelivery::StdIn => {
                // Shares the file offset with our handle so a rewind is seen
                // by every child the server forks.
                cmd.stdin(Stdio::from(input.as_file().try_clone()?));
            }
            ConfigInputDelivery::File { template } => {
                let path = input.path().to_str().ok_or(ExecutorError::NonUtf8Path)?;
                let final_arg = template.replace("{}", path);
                for part in final_arg.split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
            }
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        map.write_to_env(SHM_ENV_VAR)?;
        // Pinned on the command too: parallel executors share one process env.
        cmd.env(SHM_ENV_VAR, map.id());
        if runtime.persistent {
            cmd.env(PERSIST_ENV_VAR, "1");
        }
        if let Some(ratio) = runtime.inst_ratio {
            cmd.env(INST_RATIO_ENV_VAR, ratio.to_string());
        }
        cmd.envs(&runtime.extra_env);

        let (ctl_read, ctl_write) = cloexec_pipe()?;
        let (st_read, st_write) = cloexec_pipe()?;
        let (ctl_fd, st_fd) = (ctl_read.as_raw_fd(), st_write.as_raw_fd());
        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                install_fd(ctl_fd, FORKSRV_FD)?;
                install_fd(st_fd, FORKSRV_FD + 1)
            });
        }

        let server = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: settings.command.clone(),
            source,
        })?;
        drop(ctl_read);
        drop(st_write);

        let mut executor = Self {
            server,
            control: File::from(ctl_write),
            status: File::from(st_read),
            input,
            map,
            timeout: Duration::from_millis(settings.timeout_ms),
            persistent: runtime.persistent,
            child_killed: false,
            last_pid: None,
        };
        executor.handshake()?;
        info!(
            server_pid = executor.server.id(),
            shm_id = %executor.map.id(),
            persistent = executor.persistent,
            "fork server is up"
        );
        Ok(executor)
    }

    fn handshake(&mut self) -> Result<(), ExecutorError> {
        match self.read_frame(Some(HANDSHAKE_TIMEOUT)) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ExecutorError::Handshake(
                "timed out waiting for the hello frame".to_string(),
            )),
            Err(ExecutorError::ServerGone) => Err(ExecutorError::Handshake(
                "target exited before the hello frame; is it linked with the runtime?"
                    .to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    pub fn map(&self) -> &[u8] {
        self.map.as_slice()
    }

    pub fn shm_id(&self) -> String {
        self.map.id()
    }

    pub fn last_pid(&self) -> Option<i32> {
        self.last_pid
    }

    /// Runs one input against a cleared map.
    pub fn run(&mut self, input: &[u8]) -> Result<RunResult, ExecutorError> {
        self.map.clear();
        self.execute(input)
    }

    /// Runs one input with `br_id` seeded as the extraction target and
    /// returns whatever the target recorded for it.
    pub fn run_extract(
        &mut self,
        input: &[u8],
        br_id: i32,
    ) -> Result<(RunResult, Option<Capture>), ExecutorError> {
        self.map.clear();
        map::write_word(self.map.as_mut_slice(), TARGET_WORD, br_id);
        let result = self.execute(input)?;
        Ok((result, Capture::from_map(self.map.as_slice())))
    }

    fn execute(&mut self, input: &[u8]) -> Result<RunResult, ExecutorError> {
        self.stage_input(input)?;

        let token = u32::from(self.child_killed);
        self.control
            .write_all(&token.to_ne_bytes())
            .map_err(server_io)?;
        self.child_killed = false;

        let pid = self
            .read_frame(Some(HANDSHAKE_TIMEOUT))?
            .map(i32::from_ne_bytes)
            .ok_or(ExecutorError::NoChild)?;
        if pid <= 0 {
            return Err(ExecutorError::BadPid(pid));
        }
        if self.last_pid != Some(pid) {
            debug!(pid, "fork server started a new child");
        }
        self.last_pid = Some(pid);

        let (raw_status, status) = match self.read_frame(Some(self.timeout))? {
            Some(frame) => {
                let raw = i32::from_ne_bytes(frame);
                (raw, ExecutionStatus::from_raw(pid, raw))
            }
            None => {
                warn!(pid, "Target timed out, killing...");
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    warn!(pid, "Failed to kill child process: {e}");
                }
                self.child_killed = true;
                let raw = self
                    .read_frame(None)?
                    .map(i32::from_ne_bytes)
                    .ok_or(ExecutorError::ServerGone)?;
                (raw, ExecutionStatus::Timeout)
            }
        };

        Ok(RunResult {
            pid,
            raw_status,
            status,
        })
    }

    fn stage_input(&mut self, input: &[u8]) -> io::Result<()> {
        let file = self.input.as_file_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(input)?;
        file.flush()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// `None` timeout blocks; otherwise `Ok(None)` means nothing arrived.
    fn read_frame(&mut self, timeout: Option<Duration>) -> Result<Option<[u8; 4]>, ExecutorError> {
        if let Some(timeout) = timeout {
            if !wait_readable(self.status.as_fd(), timeout)? {
                return Ok(None);
            }
        }
        let mut frame = [0u8; 4];
        self.status.read_exact(&mut frame).map_err(server_io)?;
        Ok(Some(frame))
    }
}

impl Drop for ForkServerExecutor {
    fn drop(&mut self) {
        if self.persistent {
            if let Some(pid) = self.last_pid.take() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        let _ = self.server.kill();
        let _ = self.server.wait();
    }
}

fn server_io(err: io::Error) -> ExecutorError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ExecutorError::ServerGone,
        _ => ExecutorError::Io(err),
    }
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

/// Runs in the forked child: moves `fd` onto `target` and keeps it across exec.
fn install_fd(fd: RawFd, target: RawFd) -> io::Result<()> {
    nix::unistd::dup2(fd, target)?;
    fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(ready) => return Ok(ready > 0),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}
