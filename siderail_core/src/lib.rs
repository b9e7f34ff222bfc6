pub mod cmp;
pub mod config;
pub mod edge;
pub mod error;
pub mod extract;
pub mod forkserver;
pub mod init;
pub mod instr;
pub mod map;
pub mod persistent;
pub mod selector;

pub use cmp::{BranchState, CmpKind, Operand, PrefixRecord};
pub use config::{FORKSRV_FD, MAP_SIZE, RuntimeConfig};
pub use edge::EdgeHasher;
pub use error::{RuntimeError, Termination, fatal};
pub use extract::{COMPLETION_MARKER, Capture};
pub use forkserver::{
    ControlPipe, FdPipe, Fork, ForkServer, ForkServerHook, ProcessOps, ServerExit, ServerState,
    TraceHook, UnixProcess, raw_status,
};
pub use init::{auto_init, manual_init};
pub use persistent::{LoopControl, LoopEnv, PersistentLoop};
pub use map::Area;
pub use selector::SiteSelector;
