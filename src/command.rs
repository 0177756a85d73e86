//! Child process handle: spawns a copy of this binary dispatched to a named
//! entrypoint and turns its exit status and reported result into one outcome.
use std::{
    io::{self, PipeReader, Read},
    os::{fd::AsRawFd, fd::RawFd, unix::process::CommandExt},
    process::{Child, Command, ExitStatus},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::{
    error::{CommandError, ExitDetail, HookStage},
    options::CmdOptions,
    reexec,
    result::{self, RESULT_FD},
    shutdown::StopToken,
};

/// One spawn attempt of a named entrypoint.
///
/// A handle is started once, waited once and then discarded; restarts create a
/// new handle from the same options.
pub struct Cmd {
    name: String,
    options: CmdOptions,
    child: Option<Child>,
    result_pipe: Option<PipeReader>,
    reaped: StopToken,
    reap_lock: Arc<Mutex<()>>,
    started: bool,
    finished: bool,
}

/// Delivers signals to a running child from another thread.
///
/// Delivery and reaping are serialised, and signals are dropped once the child
/// has been reaped, so on Linux a recycled PID is never hit.
#[derive(Debug, Clone)]
pub struct Signaller {
    pid: Pid,
    reaped: StopToken,
    reap_lock: Arc<Mutex<()>>,
}

impl Signaller {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn signal(&self, sig: Signal) -> Result<(), CommandError> {
        let _held = self.reap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.reaped.is_signaled() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(CommandError::Signal(err)),
        }
    }

    /// Graceful stop request.
    pub fn interrupt(&self) -> Result<(), CommandError> {
        self.signal(Signal::SIGINT)
    }

    /// Forceful termination.
    pub fn kill(&self) -> Result<(), CommandError> {
        self.signal(Signal::SIGKILL)
    }

    /// Waits up to `timeout` for the child to be reaped.
    pub fn wait_reaped(&self, timeout: Duration) -> bool {
        self.reaped.wait_timeout(timeout)
    }
}

impl Cmd {
    pub fn new(name: impl Into<String>, options: CmdOptions) -> Self {
        Self {
            name: name.into(),
            options,
            child: None,
            result_pipe: None,
            reaped: StopToken::new(),
            reap_lock: Arc::new(Mutex::new(())),
            started: false,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CmdOptions {
        &self.options
    }

    /// PID of the live child, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn signaller(&self) -> Option<Signaller> {
        self.pid().map(|pid| Signaller {
            pid: Pid::from_raw(pid as i32),
            reaped: self.reaped.clone(),
            reap_lock: Arc::clone(&self.reap_lock),
        })
    }

    /// Spawns the child, running `start_before` and `start_after` around it.
    ///
    /// On failure no process is left behind and `final_hook` has already run.
    pub fn start(&mut self) -> Result<(), CommandError> {
        if self.started {
            return Err(CommandError::AlreadyStarted);
        }
        self.started = true;

        let result = self.spawn();
        if let Err(err) = &result {
            self.abandon();
            self.finish(Some(err));
        }
        result
    }

    fn spawn(&mut self) -> Result<(), CommandError> {
        (self.options.start_before)().map_err(|source| CommandError::Hook {
            stage: HookStage::StartBefore,
            source,
        })?;

        let (reader, writer) = io::pipe().map_err(CommandError::Pipe)?;

        let mut command = reexec::command(&self.name);
        command.args(&self.options.args);
        if let Some(vars) = &self.options.env {
            command.env_clear();
            command.envs(vars.iter().map(|(key, value)| (key, value)));
        }
        command
            .stdin(self.options.stdin.to_stdio().map_err(CommandError::Stdio)?)
            .stdout(self.options.stdout.to_stdio().map_err(CommandError::Stdio)?)
            .stderr(self.options.stderr.to_stdio().map_err(CommandError::Stdio)?);

        let mut inherited = Vec::with_capacity(1 + self.options.extra_files.len());
        inherited.push(writer.as_raw_fd());
        inherited.extend(self.options.extra_files.iter().map(|fd| fd.as_raw_fd()));
        inherit_fds(&mut command, inherited);

        debug!("Spawning entrypoint '{}' with args {:?}", self.name, self.options.args);

        let child = command.spawn().map_err(|source| CommandError::Spawn {
            cmd: self.name.clone(),
            source,
        })?;
        // The parent keeps only the read end so EOF arrives when the child exits.
        drop(writer);

        debug!("Entrypoint '{}' started with PID {}", self.name, child.id());
        self.child = Some(child);
        self.result_pipe = Some(reader);

        (self.options.start_after)().map_err(|source| CommandError::Hook {
            stage: HookStage::StartAfter,
            source,
        })
    }

    /// Waits for the child and merges its exit status with its reported result.
    ///
    /// `final_hook` runs exactly once per handle and both pipe ends are closed
    /// before this returns.
    pub fn wait(&mut self) -> Result<(), CommandError> {
        let result = self.wait_inner();
        self.result_pipe = None;
        self.finish(result.as_ref().err());
        result
    }

    fn finish(&mut self, err: Option<&CommandError>) {
        if !self.finished {
            self.finished = true;
            (self.options.final_hook)(err);
        }
    }

    fn wait_inner(&mut self) -> Result<(), CommandError> {
        if self.child.is_none() {
            return Err(CommandError::NotStarted);
        }

        if let Err(source) = (self.options.wait_before)() {
            self.abandon();
            return Err(CommandError::Hook {
                stage: HookStage::WaitBefore,
                source,
            });
        }

        let payload = self.drain_result_pipe();
        let status = self.reap()?;
        let reported = payload.and_then(|bytes| {
            if bytes.is_empty() {
                Ok(None)
            } else {
                result::decode(&bytes).map(Some).map_err(|err| err.to_string())
            }
        });

        let reported = match reported {
            Err(err) => {
                return Err(CommandError::Exit {
                    status,
                    detail: ExitDetail::Decode(err),
                });
            }
            Ok(Some(outcome)) if !outcome.is_success() => {
                return Err(CommandError::Exit {
                    status,
                    detail: ExitDetail::Message(outcome.error),
                });
            }
            Ok(reported) => reported,
        };

        if !status.success() {
            let detail = match reported {
                Some(_) => ExitDetail::Unreported,
                None => ExitDetail::Decode("EOF".into()),
            };
            return Err(CommandError::Exit { status, detail });
        }

        if let (Some(outcome), Some(sink)) = (reported, &self.options.response) {
            sink.deliver(outcome.data).map_err(CommandError::Response)?;
        }

        (self.options.wait_after)().map_err(|source| CommandError::Hook {
            stage: HookStage::WaitAfter,
            source,
        })
    }

    fn drain_result_pipe(&mut self) -> Result<Vec<u8>, String> {
        let mut bytes = Vec::new();
        if let Some(pipe) = self.result_pipe.as_mut() {
            pipe.read_to_end(&mut bytes).map_err(|err| err.to_string())?;
        }
        Ok(bytes)
    }

    fn reap(&mut self) -> Result<ExitStatus, CommandError> {
        let Some(mut child) = self.child.take() else {
            return Err(CommandError::NotStarted);
        };
        // Block on exit without reaping so the PID stays reserved while no lock is held.
        if let Err(err) = wait_exited(child.id()) {
            debug!("Falling back to a plain wait for '{}': {err}", self.name);
        }
        let status = {
            let _held = self.reap_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let status = child.wait().map_err(CommandError::Wait);
            self.reaped.signal();
            status
        };
        let status = status?;
        debug!("Entrypoint '{}' (PID {}) exited with {status}", self.name, child.id());
        Ok(status)
    }

    /// Force-kills and reaps a child that will never be waited on normally.
    fn abandon(&mut self) {
        self.result_pipe = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                warn!("Failed to kill abandoned entrypoint '{}': {err}", self.name);
            }
            // Best-effort wait to reap the child and avoid zombies.
            let _held = self.reap_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = child.wait() {
                warn!("Failed to reap abandoned entrypoint '{}': {err}", self.name);
            }
            self.reaped.signal();
        }
    }

    /// Spawns and waits.
    pub fn run(&mut self) -> Result<(), CommandError> {
        self.start()?;
        self.wait()
    }

    pub fn signal(&self, sig: Signal) -> Result<(), CommandError> {
        self.signaller()
            .ok_or(CommandError::NotStarted)?
            .signal(sig)
    }

    /// Asks the child to stop with an interrupt; does not wait for it.
    pub fn stop(&self) -> Result<(), CommandError> {
        self.signal(Signal::SIGINT)
    }

    /// Terminates the child forcefully; does not wait for it.
    pub fn kill(&self) -> Result<(), CommandError> {
        self.signal(Signal::SIGKILL)
    }
}

impl Drop for Cmd {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!("Entrypoint '{}' dropped while running; killing it", self.name);
            self.abandon();
        }
    }
}

/// Blocks until `pid` has exited while leaving it waitable.
#[cfg(target_os = "linux")]
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data and fully written by a successful waitid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_exited(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// Maps `fds` onto descriptors `RESULT_FD`, `RESULT_FD + 1`, ... in the child.
fn inherit_fds(command: &mut Command, fds: Vec<RawFd>) {
    let floor = RESULT_FD + fds.len() as RawFd;
    let mut staged = vec![-1; fds.len()];

    // SAFETY: the closure only calls async-signal-safe libc functions and writes
    // into a buffer allocated before fork.
    unsafe {
        command.pre_exec(move || {
            // Stage every source above the target range first so no dup2 below
            // clobbers a source that has not been moved yet.
            for (slot, fd) in staged.iter_mut().zip(&fds) {
                let dup = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, floor);
                if dup < 0 {
                    return Err(io::Error::last_os_error());
                }
                *slot = dup;
            }
            for (target, fd) in (RESULT_FD..).zip(&staged) {
                if libc::dup2(*fd, target) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }
}
