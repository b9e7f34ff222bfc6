use std::ffi::{OsStr, OsString};

use crate::error::RuntimeError;

/// Size of the coverage map in bytes. Must stay a power of two.
pub const MAP_SIZE: usize = 1 << 16;

/// Control pipe descriptor; the status pipe is `FORKSRV_FD + 1`.
pub const FORKSRV_FD: i32 = 198;

pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
pub const INST_RATIO_ENV_VAR: &str = "AFL_INST_RATIO";
pub const PERSIST_ENV_VAR: &str = "__AFL_PERSISTENT";
pub const DEFER_ENV_VAR: &str = "__AFL_DEFER_FORKSRV";

pub fn default_inst_ratio() -> u32 {
    100
}

/// Settings the driver hands to the runtime through the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub shm_id: Option<i32>,
    pub inst_ratio: u32,
    pub persistent: bool,
    pub deferred: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let shm_id = match lookup(SHM_ENV_VAR) {
            Some(raw) => Some(parse_shm_id(env_text(&raw, RuntimeError::InvalidShmId)?)?),
            None => None,
        };
        let inst_ratio = match lookup(INST_RATIO_ENV_VAR) {
            Some(raw) => parse_inst_ratio(env_text(&raw, RuntimeError::InvalidInstRatio)?)?,
            None => default_inst_ratio(),
        };

        Ok(Self {
            shm_id,
            inst_ratio,
            persistent: lookup(PERSIST_ENV_VAR).is_some(),
            deferred: lookup(DEFER_ENV_VAR).is_some(),
        })
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shm_id: None,
            inst_ratio: default_inst_ratio(),
            persistent: false,
            deferred: false,
        }
    }
}

/// A variable's value as text; anything else is rejected through `invalid`.
pub(crate) fn env_text(raw: &OsStr, invalid: fn(String) -> RuntimeError) -> Result<&str, RuntimeError> {
    raw.to_str().ok_or_else(|| invalid(raw.to_string_lossy().into_owned()))
}

fn parse_shm_id(raw: &str) -> Result<i32, RuntimeError> {
    match raw.trim().parse::<i32>() {
        Ok(id) if id >= 0 => Ok(id),
        _ => Err(RuntimeError::InvalidShmId(raw.to_string())),
    }
}

pub fn parse_inst_ratio(raw: &str) -> Result<u32, RuntimeError> {
    match raw.trim().parse::<u32>() {
        Ok(ratio) if (1..=100).contains(&ratio) => Ok(ratio),
        _ => Err(RuntimeError::InvalidInstRatio(raw.to_string())),
    }
}
