//! Builder API for spawning background processes.

use crate::capture::LineSink;
use crate::error::SpawnError;
use crate::process_handle::{EchoSettings, ProcessHandle};
use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

/// Decides whether captured output is echoed, based on how deeply the caller is nested in its
/// reporting structure (steps, sub-steps, ...) and how verbose output was requested to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity {
    /// Number of parents of the step the process runs in. `0` for a top-level step.
    pub nesting_depth: usize,

    /// Configured verbosity level.
    pub threshold: usize,
}

impl Verbosity {
    pub fn new(nesting_depth: usize, threshold: usize) -> Self {
        Self {
            nesting_depth,
            threshold,
        }
    }

    /// Output is echoed only while the threshold reaches deeper than the current step's
    /// children.
    pub fn allows_echo(&self) -> bool {
        self.threshold > self.nesting_depth + 1
    }
}

/// A builder for configuring and spawning a background process.
///
/// # Examples
///
/// ```no_run
/// use bg_process_capture::{Process, Verbosity};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = Process::shell("./run-server --port 8080")
///     .current_dir("target/debug")
///     .env("RUST_LOG", "info")
///     .echo_stdout(true)
///     .verbosity(Verbosity::new(0, 3))
///     .spawn()?;
///
/// server
///     .stdout()
///     .wait_for_line(|line| line.contains("listening"), Duration::from_secs(10))
///     .await?;
///
/// server.destroy().await?;
/// # Ok(())
/// # }
/// ```
pub struct Process {
    cmd: Command,
    name: Option<Cow<'static, str>>,
    echo_stdout: bool,
    echo_stderr: bool,
    verbosity: Option<Verbosity>,
    sink: LineSink,
}

impl Process {
    /// Creates a new process builder from a command.
    ///
    /// Stdin, stdout and stderr of `cmd` are always replaced with pipes.
    ///
    /// Nothing is echoed by default. Echoed lines go to the stdout of this process unless a
    /// different [Process::sink] is set.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            name: None,
            echo_stdout: false,
            echo_stderr: false,
            verbosity: None,
            sink: Arc::new(|line: &str| println!("{line}")),
        }
    }

    /// Creates a builder running `command_line` through the platform shell.
    ///
    /// - on `cfg(unix)`: `sh -c <command_line>`
    /// - on `cfg(windows)`: `cmd /C <command_line>`
    pub fn shell(command_line: impl Into<Cow<'static, str>>) -> Self {
        let command_line = command_line.into();

        #[cfg(windows)]
        let cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&*command_line);
            cmd
        };

        #[cfg(not(windows))]
        let cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&*command_line);
            cmd
        };

        Self::new(cmd).with_name(command_line)
    }

    /// Sets the command string reported by [ProcessHandle::command] and used in logs and errors.
    ///
    /// Defaults to the shell command line or the program followed by its quoted arguments.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Adds or overrides one environment variable of the process.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.cmd.env(key, value);
        self
    }

    /// Adds or overrides multiple environment variables of the process.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.cmd.envs(vars);
        self
    }

    pub fn echo_stdout(mut self, echo: bool) -> Self {
        self.echo_stdout = echo;
        self
    }

    pub fn echo_stderr(mut self, echo: bool) -> Self {
        self.echo_stderr = echo;
        self
    }

    /// Only echo if `verbosity` [allows it](Verbosity::allows_echo), on top of the per-stream
    /// echo flags.
    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = Some(verbosity);
        self
    }

    /// Sets where echoed lines are written to.
    pub fn sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    fn generate_name(&self) -> Cow<'static, str> {
        match &self.name {
            Some(name) => name.clone(),
            None => describe_command(&self.cmd).into(),
        }
    }

    /// Spawns the process and starts capturing its output. Does not wait for it to complete.
    pub fn spawn(self) -> Result<ProcessHandle, SpawnError> {
        let name = self.generate_name();
        let echo_allowed = self.verbosity.is_none_or(|v| v.allows_echo());
        let echo = EchoSettings {
            stdout: self.echo_stdout && echo_allowed,
            stderr: self.echo_stderr && echo_allowed,
            sink: self.sink,
        };
        ProcessHandle::spawn(name, self.cmd, echo)
    }
}

/// Formats `cmd` as its program followed by its quoted arguments.
///
/// Example: `Command::new("ls").arg("-la")` is described as `ls "-la"`.
fn describe_command(cmd: &Command) -> String {
    let mut name = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        name.push_str(" \"");
        name.push_str(arg.to_string_lossy().as_ref());
        name.push('"');
    }
    name
}
