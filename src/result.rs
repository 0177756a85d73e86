//! Result protocol between a child entrypoint and its supervising parent.
//!
//! A child writes exactly one JSON object, `{"data": <any>, "error": "<string>"}`,
//! to the inherited descriptor [`RESULT_FD`] and exits. An empty `error` means
//! success.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    any::Any,
    fmt::Display,
    fs::File,
    io::{self, Write},
    mem::ManuallyDrop,
    os::fd::{FromRawFd, RawFd},
    panic::{self, AssertUnwindSafe},
};

/// Descriptor the child inherits for reporting its result.
///
/// Children inherit stdin, stdout and stderr first, so the side channel is the
/// first descriptor after them. Caller supplied extra descriptors follow it.
pub const RESULT_FD: RawFd = 3;

/// Exit code of a child that reported success.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code of a child that reported failure.
pub const EXIT_FAILURE: i32 = 1;

/// Structured outcome a child reports to its parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Payload decoded into the parent's response slot.
    #[serde(default)]
    pub data: Value,
    /// Failure message; empty on success.
    #[serde(default)]
    pub error: String,
}

impl CommandResult {
    pub fn success(data: Value) -> Self {
        Self {
            data,
            error: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            error: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// Decodes the first JSON value read from the result pipe.
pub fn decode(bytes: &[u8]) -> Result<CommandResult, serde_json::Error> {
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    CommandResult::deserialize(&mut deserializer)
}

/// Reports `data` as a successful result and exits with status 0.
pub fn succeed<T: Serialize>(data: T) -> ! {
    match serde_json::to_value(data) {
        Ok(value) => report(EXIT_SUCCESS, &CommandResult::success(value)),
        Err(err) => report(
            EXIT_FAILURE,
            &CommandResult::failure(format!("failed to encode result: {err}")),
        ),
    }
}

/// Reports `err` as a failure and exits with status 1.
pub fn fail<E: Display>(err: E) -> ! {
    report(EXIT_FAILURE, &CommandResult::failure(err.to_string()))
}

/// Reports a failure when `err` is present; otherwise does nothing.
///
/// Convenient as the last statement of an entrypoint that tracks an optional error.
pub fn report_failure<E: Display>(err: Option<E>) {
    if let Some(err) = err {
        fail(err);
    }
}

/// Writes `result` to the side channel and exits with `code`.
pub fn report(code: i32, result: &CommandResult) -> ! {
    let _ = io::stdout().flush();
    if let Err(err) = write_result(result) {
        eprintln!("subproc: failed to report result: {err}");
    }
    std::process::exit(code)
}

fn write_result(result: &CommandResult) -> io::Result<()> {
    if unsafe { libc::fcntl(RESULT_FD, libc::F_GETFD) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the descriptor is open (checked above) and was handed to this process
    // by the parent solely for reporting. The process exits right after writing.
    let mut pipe = ManuallyDrop::new(unsafe { File::from_raw_fd(RESULT_FD) });
    serde_json::to_writer(&mut *pipe, result)?;
    pipe.write_all(b"\n")?;
    pipe.flush()
}

/// Marks the inherited result descriptor close-on-exec.
///
/// The descriptor arrives without the flag so the child can report through it,
/// but processes the entrypoint launches must not hold the write end: the parent
/// reads it to end-of-file before reaping the child.
pub fn seal_result_fd() -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number; an unopened descriptor yields EBADF.
    let flags = unsafe { libc::fcntl(RESULT_FD, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(RESULT_FD, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Runs an entrypoint, converting a panic into a reported failure.
///
/// The result descriptor is sealed against inheritance before the entrypoint
/// starts.
pub fn guard<F: FnOnce()>(entrypoint: F) {
    if let Err(err) = seal_result_fd() {
        fail(format!("failed to seal result descriptor: {err}"));
    }
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entrypoint)) {
        fail(panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
