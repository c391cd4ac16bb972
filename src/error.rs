//! Error types for process operations.

use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::StreamType;

/// Errors that can occur when spawning a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The OS refused to launch the executable (not found, not executable, ...).
    #[error("Failed to spawn process '{process_name}': {source}")]
    SpawnFailed {
        /// The command being spawned.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The process was launched but the OS did not expose a process id for it.
    #[error("Spawned process '{process_name}' has no process id")]
    MissingPid {
        /// The command being spawned.
        process_name: Cow<'static, str>,
    },
}

/// Errors that can occur when writing to the stdin of a process.
#[derive(Debug, Error)]
pub enum SendError {
    /// The input stream was already closed or the process is no longer active.
    #[error("Input stream of process '{process_name}' is closed")]
    InputClosed {
        /// The name of the process.
        process_name: Cow<'static, str>,
    },

    /// Writing or flushing failed.
    #[error("Failed to write to process '{process_name}': {source}")]
    Io {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur when querying the exit code of a process.
#[derive(Debug, Error)]
pub enum ExitCodeError {
    /// The process has not exited yet, so there is no exit code.
    #[error("Process '{process_name}' is still running")]
    StillRunning {
        /// The name of the process.
        process_name: Cow<'static, str>,
    },

    /// The OS could not tell whether the process exited.
    #[error("Could not determine state of process '{process_name}': {source}")]
    Uncertain {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur when destroying a process.
///
/// A process that cannot be killed is a leaked resource. Callers should treat these as fatal.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// Killing the process tree failed.
    #[error("Failed to kill process '{process_name}' (pid {pid}): {source}")]
    KillFailed {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The process id the kill was addressed to.
        pid: u32,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The kill was delivered, but waiting for the process to exit failed.
    #[error("Failed to await termination of process '{process_name}': {source}")]
    WaitFailed {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur when waiting for a process to complete.
#[derive(Debug, Error)]
pub enum WaitError {
    /// A general IO error occurred.
    #[error("IO error occurred while waiting for process '{process_name}': {source}")]
    Io {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Wait operation timed out. The process is left running.
    #[error("Process '{process_name}' did not complete within {timeout:?}")]
    Timeout {
        /// The name of the process.
        process_name: Cow<'static, str>,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Could not destroy the process after the timeout.
    #[error("Could not destroy process: {0}")]
    Termination(#[from] TerminationError),
}

/// Errors that can occur when waiting for a line of output.
#[derive(Debug, Error)]
pub enum OutputError {
    /// No matching line appeared in time.
    #[error("Timed out after {timeout:?} waiting for a matching line on {stream}")]
    Timeout {
        /// The stream that was watched.
        stream: StreamType,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// The stream ended without producing a matching line.
    #[error("{stream} ended without producing a matching line")]
    StreamEnded {
        /// The stream that was watched.
        stream: StreamType,
    },
}
