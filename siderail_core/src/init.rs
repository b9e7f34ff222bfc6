use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, fatal};
use crate::forkserver::{ForkServer, ServerExit};
use crate::{map, persistent};

static INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Attaches the map and runs the fork server.
///
/// Returns in the forked child, or straight away when no driver is listening.
pub fn start(config: &RuntimeConfig) -> Result<ServerExit, RuntimeError> {
    persistent::set_persistent_mode(config.persistent);
    map::attach_from(config)?;
    ForkServer::standard(config.persistent).run()
}

/// Initialises the runtime once per process. Later calls are no-ops.
///
/// Deferred targets call this themselves after their expensive set-up, so
/// that every forked child starts from the initialised state.
pub fn manual_init() {
    if INIT_DONE.swap(true, Ordering::SeqCst) {
        return;
    }
    let exit = RuntimeConfig::from_env().and_then(|config| start(&config));
    match exit {
        Ok(exit) => debug!(?exit, "handing control to target"),
        Err(err) => fatal(err),
    }
}

/// Constructor entry point; skipped when the driver asked for a deferred start.
pub fn auto_init() {
    match RuntimeConfig::from_env() {
        Ok(config) if config.deferred => debug!("deferred fork server, waiting for manual init"),
        Ok(_) => manual_init(),
        Err(err) => fatal(err),
    }
}

/// Registers [`auto_init`] as an ELF constructor of the invoking binary.
///
/// ```ignore
/// siderail_core::auto_init!();
///
/// fn main() { /* already running under the fork server */ }
/// ```
#[macro_export]
macro_rules! auto_init {
    () => {
        #[used]
        #[unsafe(link_section = ".init_array")]
        static __SIDERAIL_AUTO_INIT: extern "C" fn() = {
            extern "C" fn __siderail_auto_init() {
                $crate::init::auto_init();
            }
            __siderail_auto_init
        };
    };
}
