//! Supervised worker: one logical slot that keeps re-spawning its entrypoint
//! with crash-loop backoff until it exits cleanly or is stopped.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString, FromRepr};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    command::{Cmd, Signaller},
    config::{BackoffPolicy, ManagerConfig},
    error::CommandError,
    matcher::WorkerView,
    options::CmdOptions,
    shutdown::StopToken,
};

/// Lifecycle state of a supervised worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, FromRepr, Serialize,
)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Created but no spawn attempt has been made yet.
    Creating,
    /// An attempt is in flight.
    Running,
    /// The last attempt failed; waiting out the backoff delay.
    CrashLoopBackOff,
    /// Terminal: finished cleanly or stopped.
    Exited,
}

/// Point-in-time lifecycle figures for one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    /// Length of the latest attempt, or of the running one.
    pub uptime: Duration,
    pub restarts: u32,
}

#[derive(Debug)]
struct Timestamps {
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    exited_at: Option<DateTime<Utc>>,
}

/// One supervised worker slot.
///
/// The restart loop in [`Subproc::run`] is driven by exactly one thread; every
/// other accessor may be called from anywhere at any time.
#[derive(Debug)]
pub struct Subproc {
    id: String,
    cmd: String,
    options: CmdOptions,
    policy: BackoffPolicy,
    kill_timeout: Option<Duration>,
    status: AtomicU8,
    restarts: AtomicU32,
    pid: AtomicU32,
    error: Mutex<Option<Arc<CommandError>>>,
    times: Mutex<Timestamps>,
    stop: StopToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Subproc {
    pub fn new(cmd: impl Into<String>, options: CmdOptions, config: &ManagerConfig) -> Self {
        let cmd = cmd.into();
        Self {
            id: format!("{cmd}-{}", Uuid::new_v4()),
            cmd,
            options,
            policy: config.backoff.clone(),
            kill_timeout: config.kill_timeout,
            status: AtomicU8::new(WorkerStatus::Creating as u8),
            restarts: AtomicU32::new(0),
            pid: AtomicU32::new(0),
            error: Mutex::new(None),
            times: Mutex::new(Timestamps {
                created_at: Utc::now(),
                started_at: None,
                exited_at: None,
            }),
            stop: StopToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn options(&self) -> &CmdOptions {
        &self.options
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_repr(self.status.load(Ordering::Acquire)).unwrap_or(WorkerStatus::Exited)
    }

    fn set_status(&self, status: WorkerStatus) {
        let previous = self.status.swap(status as u8, Ordering::AcqRel);
        if previous != status as u8 {
            debug!("Worker '{}' is now {status}", self.id);
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// PID of the in-flight child, if any.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Message of the most recent failed attempt.
    pub fn error(&self) -> Option<String> {
        lock(&self.error).as_ref().map(|err| err.to_string())
    }

    /// The most recent failure itself, for callers that need more than its message.
    pub fn last_error(&self) -> Option<Arc<CommandError>> {
        lock(&self.error).clone()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.error).is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_signaled()
    }

    pub fn metrics(&self) -> Metrics {
        let times = lock(&self.times);
        let uptime = match (times.started_at, times.exited_at) {
            (Some(started), Some(exited)) => exited - started,
            (Some(started), None) => Utc::now() - started,
            _ => chrono::Duration::zero(),
        };

        Metrics {
            created_at: times.created_at,
            started_at: times.started_at,
            exited_at: times.exited_at,
            uptime: uptime.to_std().unwrap_or_default(),
            restarts: self.restarts(),
        }
    }

    pub(crate) fn view(&self) -> WorkerView<'_> {
        WorkerView {
            id: &self.id,
            cmd: &self.cmd,
            status: self.status(),
            has_error: self.has_error(),
        }
    }

    /// Requests the worker to stop. Only the first call has an effect.
    ///
    /// A live child receives an interrupt from the attempt's watcher thread;
    /// this call never blocks.
    pub fn stop(&self) {
        if self.stop.signal() {
            debug!("Stop requested for worker '{}'", self.id);
        }
    }

    /// Runs the restart loop until a clean exit, a stop, or the restart budget
    /// runs out.
    pub fn run(&self) {
        loop {
            if self.stop.is_signaled() {
                debug!("Worker '{}' stopped before next attempt", self.id);
                return;
            }

            self.begin_attempt();
            let result = self.attempt();
            self.pid.store(0, Ordering::Release);
            lock(&self.times).exited_at = Some(Utc::now());

            let err = match result {
                Ok(()) => {
                    *lock(&self.error) = None;
                    self.set_status(WorkerStatus::Exited);
                    info!("Worker '{}' exited successfully", self.id);
                    return;
                }
                Err(err) if self.stop.is_signaled() => {
                    self.set_status(WorkerStatus::Exited);
                    debug!("Worker '{}' exited after stop: {err}", self.id);
                    return;
                }
                Err(err) => err,
            };

            let Some(delay) = self.record_failure(err) else {
                return;
            };
            debug!("Restarting worker '{}' in {delay:?}", self.id);
            if self.stop.wait_timeout(delay) {
                debug!("Worker '{}' stopped during backoff", self.id);
                return;
            }
        }
    }

    /// Records a failed attempt and returns the delay before the next one, or
    /// `None` once the restart budget is spent.
    ///
    /// The delay for the `n`th consecutive failure (0-indexed) is `policy.delay(n)`.
    fn record_failure(&self, err: CommandError) -> Option<Duration> {
        warn!("Worker '{}' failed: {err}", self.id);
        *lock(&self.error) = Some(Arc::new(err));
        self.set_status(WorkerStatus::CrashLoopBackOff);

        let failures = self.restarts.fetch_add(1, Ordering::AcqRel);
        if failures.saturating_add(1) >= self.policy.max_restarts {
            warn!(
                "Worker '{}' reached {} restarts; giving up",
                self.id, self.policy.max_restarts
            );
            return None;
        }
        Some(self.policy.delay(failures))
    }

    fn begin_attempt(&self) {
        {
            let mut times = lock(&self.times);
            times.started_at = Some(Utc::now());
            times.exited_at = None;
        }
        self.set_status(WorkerStatus::Running);
    }

    fn attempt(&self) -> Result<(), CommandError> {
        let mut cmd = Cmd::new(&self.cmd, self.options.clone());
        cmd.start()?;

        let Some(signaller) = cmd.signaller() else {
            return cmd.wait();
        };
        self.pid.store(signaller.pid(), Ordering::Release);

        let attempt_done = self.stop.child_token();
        let watcher = self.spawn_watcher(signaller, attempt_done.clone());

        let result = cmd.wait();
        attempt_done.signal();
        if let Some(handle) = watcher
            && handle.join().is_err()
        {
            warn!("Watcher thread for worker '{}' panicked", self.id);
        }
        result
    }

    /// Forwards a stop request into the running attempt.
    ///
    /// `attempt_done` fires either when the worker is stopped or when the
    /// attempt finishes on its own; only the former delivers a signal.
    fn spawn_watcher(
        &self,
        signaller: Signaller,
        attempt_done: StopToken,
    ) -> Option<JoinHandle<()>> {
        let stop = self.stop.clone();
        let kill_timeout = self.kill_timeout;
        let id = self.id.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-watch", self.cmd))
            .spawn(move || {
                attempt_done.wait();
                if !stop.is_signaled() {
                    return;
                }

                debug!("Interrupting worker '{id}' (PID {})", signaller.pid());
                if let Err(err) = signaller.interrupt() {
                    warn!("Failed to interrupt worker '{id}': {err}");
                }

                if let Some(timeout) = kill_timeout
                    && !signaller.wait_reaped(timeout)
                {
                    warn!("Worker '{id}' ignored interrupt for {timeout:?}; killing it");
                    if let Err(err) = signaller.kill() {
                        warn!("Failed to kill worker '{id}': {err}");
                    }
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("Failed to spawn watcher for worker '{}': {err}", self.id);
                None
            }
        }
    }
}
