//! Supervisor manager: owns every worker, keyed by command name.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    thread,
};
use tracing::{debug, info};

use crate::{
    config::ManagerConfig,
    error::SubprocError,
    matcher::MatchOptions,
    options::CmdOptions,
    shutdown::{StopToken, WaitGroup},
    worker::Subproc,
};

type Workers = HashMap<String, Vec<Arc<Subproc>>>;

/// Owns a dynamic set of supervised workers.
///
/// All mutations are linearised by one read-write lock. A command name never
/// maps to an empty list; the entry is removed instead.
#[derive(Debug, Default)]
pub struct Manager {
    workers: RwLock<Workers>,
    config: ManagerConfig,
    drain: WaitGroup,
    closed: StopToken,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, Workers> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access for a mutating call; fails once the manager is closed.
    fn write_open(&self) -> Result<RwLockWriteGuard<'_, Workers>, SubprocError> {
        let workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        if self.closed.is_signaled() {
            return Err(SubprocError::ManagerClosed);
        }
        Ok(workers)
    }

    /// Starts a new worker for `cmd` and returns it without waiting for the child.
    ///
    /// Child failures never surface here; they show up as the worker's status
    /// and last error.
    pub fn run(&self, cmd: &str, options: CmdOptions) -> Result<Arc<Subproc>, SubprocError> {
        validate_cmd(cmd)?;
        let mut workers = self.write_open()?;
        let worker = self.spawn_worker(cmd, options)?;
        workers
            .entry(cmd.to_string())
            .or_default()
            .push(Arc::clone(&worker));
        Ok(worker)
    }

    /// Scales `cmd` to exactly `n` workers running with `options`.
    ///
    /// Extra workers are stopped from the tail, surviving ones are replaced with
    /// fresh workers using the new options and missing ones are appended.
    /// `n == 0` removes the command entirely.
    pub fn run_parallel(
        &self,
        n: usize,
        cmd: &str,
        options: CmdOptions,
    ) -> Result<(), SubprocError> {
        validate_cmd(cmd)?;
        let mut workers = self.write_open()?;
        let list = workers.entry(cmd.to_string()).or_default();
        let result = self.scale(list, n, cmd, &options);
        if list.is_empty() {
            workers.remove(cmd);
        }
        result
    }

    fn scale(
        &self,
        list: &mut Vec<Arc<Subproc>>,
        n: usize,
        cmd: &str,
        options: &CmdOptions,
    ) -> Result<(), SubprocError> {
        while list.len() > n {
            if let Some(extra) = list.pop() {
                extra.stop();
            }
        }

        for slot in list.iter_mut() {
            let fresh = self.spawn_worker(cmd, options.clone())?;
            std::mem::replace(slot, fresh).stop();
        }

        while list.len() < n {
            list.push(self.spawn_worker(cmd, options.clone())?);
        }

        debug!("Scaled '{cmd}' to {n} workers");
        Ok(())
    }

    /// Stops and removes every matching worker.
    pub fn kill(&self, opts: &MatchOptions) -> Result<(), SubprocError> {
        let mut workers = self.write_open()?;
        Self::kill_matching(&mut workers, opts)
    }

    pub fn kill_all(&self) -> Result<(), SubprocError> {
        self.kill(&MatchOptions::all())
    }

    fn kill_matching(workers: &mut Workers, opts: &MatchOptions) -> Result<(), SubprocError> {
        let mut matched = 0usize;
        workers.retain(|_, list| {
            list.retain(|worker| {
                if opts.matches(worker) {
                    worker.stop();
                    matched += 1;
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });

        debug!("Killed {matched} workers");
        Self::require_match(matched, opts)
    }

    /// Replaces every matching worker in place with a fresh one built from the
    /// same command and options; the stale worker is stopped.
    pub fn restart(&self, opts: &MatchOptions) -> Result<(), SubprocError> {
        let mut workers = self.write_open()?;
        let mut matched = 0usize;

        for list in workers.values_mut() {
            for slot in list.iter_mut() {
                if !opts.matches(slot) {
                    continue;
                }
                let fresh = self.spawn_worker(slot.cmd(), slot.options().clone())?;
                let stale = std::mem::replace(slot, fresh);
                debug!("Replacing worker '{}' with '{}'", stale.id(), slot.id());
                stale.stop();
                matched += 1;
            }
        }

        Self::require_match(matched, opts)
    }

    pub fn restart_all(&self) -> Result<(), SubprocError> {
        self.restart(&MatchOptions::all())
    }

    fn require_match(matched: usize, opts: &MatchOptions) -> Result<(), SubprocError> {
        if matched == 0 && !opts.is_match_all() {
            Err(SubprocError::NoMatch)
        } else {
            Ok(())
        }
    }

    /// Snapshot of the matching workers grouped by command.
    pub fn list(&self, opts: &MatchOptions) -> HashMap<String, Vec<Arc<Subproc>>> {
        self.read()
            .iter()
            .filter_map(|(cmd, list)| {
                let matched: Vec<_> = list
                    .iter()
                    .filter(|worker| opts.matches(worker))
                    .cloned()
                    .collect();
                (!matched.is_empty()).then(|| (cmd.clone(), matched))
            })
            .collect()
    }

    pub fn list_all(&self) -> HashMap<String, Vec<Arc<Subproc>>> {
        self.list(&MatchOptions::all())
    }

    /// Blocks until every worker thread ever started has left its restart loop.
    pub fn wait(&self) {
        self.drain.wait();
    }

    /// Closes the manager, stops every worker and waits for all of them to drain.
    ///
    /// Safe to call repeatedly and from several threads at once.
    pub fn stop(&self) {
        {
            let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
            if self.closed.signal() {
                info!("Stopping subproc manager");
            }
            let _ = Self::kill_matching(&mut workers, &MatchOptions::all());
        }
        self.drain.wait();
        debug!("Subproc manager drained");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_signaled()
    }

    /// Total number of workers across all commands.
    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn spawn_worker(&self, cmd: &str, options: CmdOptions) -> Result<Arc<Subproc>, SubprocError> {
        let worker = Arc::new(Subproc::new(cmd, options, &self.config));
        let guard = self.drain.enter();
        let runner = Arc::clone(&worker);

        thread::Builder::new()
            .name(worker.id().to_string())
            .spawn(move || {
                let _guard = guard;
                runner.run();
            })
            .map_err(|source| SubprocError::ThreadSpawn {
                cmd: cmd.to_string(),
                source,
            })?;

        debug!("Started worker '{}'", worker.id());
        Ok(worker)
    }
}

/// Command names become `argv[0]` and thread names, neither of which may hold NUL.
fn validate_cmd(cmd: &str) -> Result<(), SubprocError> {
    if cmd.contains('\0') {
        return Err(SubprocError::InvalidCommand(cmd.to_string()));
    }
    Ok(())
}
