//! Subproc embeds named worker entrypoints in a single executable and supervises
//! each one as a restarted copy of that executable. Children report a structured
//! result back to the parent over an inherited side channel, and a [`Manager`]
//! keeps them running with crash-loop backoff.
//!
//! A program registers its entrypoints and calls [`init`] first thing in `main`:
//!
//! ```no_run
//! fn main() {
//!     subproc::register("echo", || subproc::succeed("pong"));
//!     if subproc::init() {
//!         return;
//!     }
//!
//!     let manager = subproc::Manager::new();
//!     manager.run("echo", subproc::CmdOptions::default()).unwrap();
//!     manager.wait();
//! }
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

/// Child process handle.
pub mod command;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Logging setup.
pub mod logs;

/// Worker collection and shutdown.
pub mod manager;

/// Worker selection predicates.
pub mod matcher;

/// Per-child configuration bundle.
pub mod options;

/// Self re-execution.
pub mod reexec;

/// Parent/child result protocol.
pub mod result;

/// Stop tokens and drain counting.
pub mod shutdown;

/// Supervised worker state machine.
pub mod worker;

pub use command::Cmd;
pub use config::{BackoffPolicy, ManagerConfig, load_config};
pub use error::{CommandError, HookError, SubprocError};
pub use manager::Manager;
pub use matcher::{MatchMode, MatchOptions};
pub use options::{CmdOptions, ResponseSlot, StdioConfig};
pub use result::{CommandResult, fail, report_failure, succeed};
pub use worker::{Metrics, Subproc, WorkerStatus};

/// Registers an entrypoint runnable as a supervised child under `name`.
///
/// A panic inside the entrypoint is reported to the parent as a failure.
/// An entrypoint that returns without reporting exits with status 0.
///
/// # Panics
/// Panics if `name` is already registered.
pub fn register<F>(name: &str, entrypoint: F)
where
    F: Fn() + Send + Sync + 'static,
{
    reexec::register(name, move || result::guard(&entrypoint));
}

/// Runs the entrypoint this process was spawned for, if any.
///
/// Returns `true` when this process is a child; `main` should return right away.
pub fn init() -> bool {
    reexec::init()
}

static DEFAULT_MANAGER: OnceLock<Manager> = OnceLock::new();

/// Process-wide manager for programs that do not pass one around.
pub fn default_manager() -> &'static Manager {
    DEFAULT_MANAGER.get_or_init(Manager::new)
}

/// [`Manager::run`] on the default manager.
pub fn run(cmd: &str, options: CmdOptions) -> Result<Arc<Subproc>, SubprocError> {
    default_manager().run(cmd, options)
}

/// [`Manager::kill`] on the default manager.
pub fn kill(opts: &MatchOptions) -> Result<(), SubprocError> {
    default_manager().kill(opts)
}

/// [`Manager::kill_all`] on the default manager.
pub fn kill_all() -> Result<(), SubprocError> {
    default_manager().kill_all()
}

/// [`Manager::restart`] on the default manager.
pub fn restart(opts: &MatchOptions) -> Result<(), SubprocError> {
    default_manager().restart(opts)
}

/// [`Manager::restart_all`] on the default manager.
pub fn restart_all() -> Result<(), SubprocError> {
    default_manager().restart_all()
}

/// [`Manager::list`] on the default manager.
pub fn list(opts: &MatchOptions) -> HashMap<String, Vec<Arc<Subproc>>> {
    default_manager().list(opts)
}

/// [`Manager::list_all`] on the default manager.
pub fn list_all() -> HashMap<String, Vec<Arc<Subproc>>> {
    default_manager().list_all()
}

/// [`Manager::wait`] on the default manager.
pub fn wait() {
    default_manager().wait()
}

/// [`Manager::stop`] on the default manager.
pub fn stop() {
    default_manager().stop()
}
