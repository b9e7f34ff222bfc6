pub mod config;
pub mod demo;
pub mod executor;
pub mod report;
pub mod shm;

pub use config::ShowmapConfig;
pub use executor::{ExecutionStatus, ExecutorError, ForkServerExecutor, RunResult};
pub use report::{ExtractReport, TraceReport};
