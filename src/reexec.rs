//! Self re-execution: run a copy of the current binary dispatched to a named entrypoint.
//!
//! The child is the same executable started with `argv[0]` set to the entrypoint
//! name. Calling [`init`] first thing in `main` lets it recognise that name and run
//! the registered function instead of the regular program.
use std::{
    collections::HashMap,
    env,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::Command,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use tracing::debug;

type Entrypoint = Arc<dyn Fn() + Send + Sync>;

static REGISTRY: OnceLock<RwLock<HashMap<String, Entrypoint>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Entrypoint>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Associates `name` with an entrypoint.
///
/// # Panics
/// Registering the same name twice is a programming error and panics.
pub fn register<F>(name: &str, entrypoint: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let mut entries = registry().write().unwrap_or_else(PoisonError::into_inner);
    if entries.contains_key(name) {
        panic!("reexec entrypoint '{name}' is already registered");
    }
    entries.insert(name.to_string(), Arc::new(entrypoint));
}

/// Whether `name` has been registered in this process.
pub fn is_registered(name: &str) -> bool {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(name)
}

/// Runs the entrypoint named by `argv[0]`, if there is one.
///
/// Returns `true` when an entrypoint ran; the caller should then exit instead of
/// continuing as the main program.
pub fn init() -> bool {
    let Some(arg0) = env::args_os().next() else {
        return false;
    };
    let Some(name) = arg0.to_str() else {
        return false;
    };

    let entrypoint = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned();

    match entrypoint {
        Some(entrypoint) => {
            debug!("Dispatching to reexec entrypoint '{name}'");
            entrypoint();
            true
        }
        None => false,
    }
}

/// Path that re-executes the running binary.
pub fn self_exe() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/proc/self/exe")
    }
    #[cfg(not(target_os = "linux"))]
    {
        env::current_exe()
            .ok()
            .or_else(|| env::args_os().next().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Builds a command that runs a copy of this binary dispatched to `name`.
pub fn command(name: &str) -> Command {
    let mut cmd = Command::new(self_exe());
    cmd.arg0(name);
    cmd
}
