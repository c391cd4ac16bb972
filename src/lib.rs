//! Run external processes in the background while their output is captured line by line.
//!
//! [Process] spawns, [ProcessHandle] controls the running process, [OutputCapture] buffers one
//! of its output streams and [RunResult] describes the process once it is gone.

mod async_drop;
mod capture;
mod destroy_on_drop;
mod error;
mod kill;
mod line_reader;
mod process;
mod process_handle;
mod run_result;

pub use capture::{CapturedLines, LineSink, OutputCapture, StreamType};
pub use destroy_on_drop::DestroyOnDrop;
pub use error::{ExitCodeError, OutputError, SendError, SpawnError, TerminationError, WaitError};
pub use process::{Process, Verbosity};
pub use process_handle::{Liveness, ProcessHandle};
pub use run_result::RunResult;
