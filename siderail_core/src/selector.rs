use rand::Rng;
use rand_core::RngCore;
use tracing::debug;

use crate::config::{INST_RATIO_ENV_VAR, MAP_SIZE, RuntimeConfig, default_inst_ratio, env_text, parse_inst_ratio};
use crate::error::{RuntimeError, fatal};
use crate::map::Area;

/// Assigns map slots to guard-based instrumentation sites.
///
/// Slot 0 means "disabled": hits at such a site cost a load and a compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSelector {
    ratio: u32,
}

impl SiteSelector {
    pub fn new(ratio: u32) -> Result<Self, RuntimeError> {
        if !(1..=100).contains(&ratio) {
            return Err(RuntimeError::InvalidInstRatio(ratio.to_string()));
        }
        Ok(Self { ratio })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::new(config.inst_ratio)
    }

    /// Reads `AFL_INST_RATIO` directly; sancov may call the init hook before
    /// the rest of the runtime has loaded its configuration.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let ratio = match std::env::var_os(INST_RATIO_ENV_VAR) {
            Some(raw) => parse_inst_ratio(env_text(&raw, RuntimeError::InvalidInstRatio)?)?,
            None => default_inst_ratio(),
        };
        Self::new(ratio)
    }

    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// Fills a guard range handed over by the compiler.
    ///
    /// The first guard is always live. That doubles as the "already
    /// initialised" flag, since LLVM may report the same range twice.
    /// Returns the number of live sites written.
    pub fn assign<R: RngCore>(&self, guards: &mut [u32], rng: &mut R) -> usize {
        let Some((first, rest)) = guards.split_first_mut() else {
            return 0;
        };
        if *first != 0 {
            return 0;
        }

        *first = random_slot(rng);
        let mut live = 1;
        for guard in rest {
            if rng.random_range(0..100) < self.ratio {
                *guard = random_slot(rng);
                live += 1;
            } else {
                *guard = 0;
            }
        }

        debug!(sites = guards.len(), live, ratio = self.ratio, "assigned guard range");
        live
    }
}

/// Handles a guard range reported by the compiler's init hook.
///
/// An invalid `AFL_INST_RATIO` ends the process with a diagnostic.
pub fn init_guards(guards: &mut [u32]) -> usize {
    if guards.first().is_none_or(|&first| first != 0) {
        return 0;
    }
    let selector = SiteSelector::from_env().unwrap_or_else(|err| fatal(err));
    selector.assign(guards, &mut rand::rng())
}

fn random_slot<R: RngCore>(rng: &mut R) -> u32 {
    rng.random_range(1..MAP_SIZE as u32)
}

/// Bumps the slot assigned to `guard`; disabled sites are skipped.
pub fn trace_pc_guard(area: Area<'_>, guard: u32) {
    if guard == 0 {
        return;
    }
    area.bump(guard as usize & (MAP_SIZE - 1));
}
