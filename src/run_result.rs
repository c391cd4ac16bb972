use crate::capture::CapturedLines;

/// Outcome of a process that terminated.
///
/// Holds views onto the captures of the [crate::ProcessHandle] it was taken from, not copies of
/// their lines. Clearing the handle's output afterwards is visible through this result as well.
#[derive(Debug, Clone)]
pub struct RunResult {
    exit_code: i32,
    stdout: CapturedLines,
    stderr: CapturedLines,
}

impl RunResult {
    pub(crate) fn new(exit_code: i32, stdout: CapturedLines, stderr: CapturedLines) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
        }
    }

    /// Code the process exited with. `128 + signal` for a process killed by a signal on unix.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout(&self) -> &CapturedLines {
        &self.stdout
    }

    pub fn stderr(&self) -> &CapturedLines {
        &self.stderr
    }
}
