//! Configuration bundle for a single child process.
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    fmt,
    fs::File,
    io,
    os::fd::OwnedFd,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
};

use crate::error::{CommandError, HookError};

/// Lifecycle hook run around spawning and waiting.
pub type Hook = Arc<dyn Fn() -> Result<(), HookError> + Send + Sync>;

/// Hook run exactly once when a spawn attempt is over, with its error if any.
pub type FinalHook = Arc<dyn Fn(Option<&CommandError>) + Send + Sync>;

/// Where a child's standard stream is connected.
#[derive(Debug, Clone, Default)]
pub enum StdioConfig {
    /// Share the supervisor's own stream.
    #[default]
    Inherit,
    /// Connect to `/dev/null`.
    Null,
    /// Connect to an open file; each attempt gets its own duplicate.
    File(Arc<File>),
}

impl StdioConfig {
    pub fn file(file: File) -> Self {
        StdioConfig::File(Arc::new(file))
    }

    pub(crate) fn to_stdio(&self) -> io::Result<Stdio> {
        match self {
            StdioConfig::Inherit => Ok(Stdio::inherit()),
            StdioConfig::Null => Ok(Stdio::null()),
            StdioConfig::File(file) => Ok(Stdio::from(file.try_clone()?)),
        }
    }
}

/// Typed slot the payload of a successful child is decoded into.
pub struct ResponseSlot<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for ResponseSlot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Default for ResponseSlot<T> {
    fn default() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> fmt::Debug for ResponseSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSlot").finish_non_exhaustive()
    }
}

impl<T> ResponseSlot<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the latest delivered payload.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns the latest delivered payload.
    pub fn take(&self) -> Option<T> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn sink(&self) -> ResponseSink {
        let value = Arc::clone(&self.value);
        ResponseSink(Arc::new(move |data| {
            let decoded = serde_json::from_value::<T>(data)?;
            *value.lock().unwrap_or_else(PoisonError::into_inner) = Some(decoded);
            Ok(())
        }))
    }
}

/// Type-erased decoder feeding a [`ResponseSlot`].
#[derive(Clone)]
pub struct ResponseSink(Arc<dyn Fn(Value) -> Result<(), serde_json::Error> + Send + Sync>);

impl ResponseSink {
    pub(crate) fn deliver(&self, data: Value) -> Result<(), serde_json::Error> {
        (self.0)(data)
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseSink")
    }
}

/// Everything needed to spawn one child: arguments, environment, stdio,
/// response slot, lifecycle hooks and extra descriptors.
///
/// Hooks run in order `start_before`, `start_after`, `wait_before`,
/// `wait_after`, then `final_hook`. All default to no-ops.
#[derive(Clone)]
pub struct CmdOptions {
    /// Arguments passed after `argv[0]`.
    pub args: Vec<String>,
    /// Replacement environment; `None` inherits the supervisor's environment.
    pub env: Option<Vec<(String, String)>>,
    pub stdin: StdioConfig,
    pub stdout: StdioConfig,
    pub stderr: StdioConfig,
    /// Destination for the payload of a successful child.
    pub response: Option<ResponseSink>,
    pub start_before: Hook,
    pub start_after: Hook,
    pub wait_before: Hook,
    pub wait_after: Hook,
    pub final_hook: FinalHook,
    /// Descriptors inherited after the result pipe, as 4, 5, ...
    pub extra_files: Vec<Arc<OwnedFd>>,
}

fn noop_hook() -> Hook {
    Arc::new(|| Ok(()))
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: None,
            stdin: StdioConfig::Inherit,
            stdout: StdioConfig::Inherit,
            stderr: StdioConfig::Inherit,
            response: None,
            start_before: noop_hook(),
            start_after: noop_hook(),
            wait_before: noop_hook(),
            wait_after: noop_hook(),
            final_hook: Arc::new(|_| {}),
            extra_files: Vec::new(),
        }
    }
}

impl fmt::Debug for CmdOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdOptions")
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("response", &self.response.is_some())
            .field("extra_files", &self.extra_files.len())
            .finish_non_exhaustive()
    }
}

impl CmdOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the child's environment with exactly these variables.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn with_stdin(mut self, stdin: StdioConfig) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_stdout(mut self, stdout: StdioConfig) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: StdioConfig) -> Self {
        self.stderr = stderr;
        self
    }

    /// Decodes the payload of every successful attempt into `slot`.
    pub fn with_response<T>(mut self, slot: &ResponseSlot<T>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.response = Some(slot.sink());
        self
    }

    pub fn with_start_before<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.start_before = Arc::new(hook);
        self
    }

    pub fn with_start_after<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.start_after = Arc::new(hook);
        self
    }

    pub fn with_wait_before<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.wait_before = Arc::new(hook);
        self
    }

    pub fn with_wait_after<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.wait_after = Arc::new(hook);
        self
    }

    pub fn with_final_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&CommandError>) + Send + Sync + 'static,
    {
        self.final_hook = Arc::new(hook);
        self
    }

    /// Appends a descriptor the child inherits after the result pipe.
    pub fn with_extra_file(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.extra_files.push(Arc::new(fd.into()));
        self
    }
}
