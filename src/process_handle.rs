use crate::capture::{LineSink, OutputCapture, StreamType};
use crate::destroy_on_drop::DestroyOnDrop;
use crate::error::{ExitCodeError, SendError, SpawnError, TerminationError, WaitError};
use crate::kill;
use crate::run_result::RunResult;
use std::borrow::Cow;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};

/// How long reader tasks may keep draining already buffered output after the process exited,
/// before their streams get closed.
const DRAIN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Lock-free view onto the liveness flag of a [ProcessHandle].
///
/// Can be cloned and polled from any thread while the handle itself is busy.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Which streams get echoed, and where to.
pub(crate) struct EchoSettings {
    pub(crate) stdout: bool,
    pub(crate) stderr: bool,
    pub(crate) sink: LineSink,
}

/// A spawned background process.
///
/// Both output streams are captured from the moment of spawning. The process stays "active"
/// until it is [destroyed](ProcessHandle::destroy), awaited through
/// [ProcessHandle::wait_for_completion] or explicitly [marked inactive](ProcessHandle::mark_inactive).
#[derive(Debug)]
pub struct ProcessHandle {
    pub(crate) name: Cow<'static, str>,
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    std_out_capture: OutputCapture,
    std_err_capture: OutputCapture,
    active: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub(crate) fn spawn(
        name: impl Into<Cow<'static, str>>,
        mut cmd: Command,
        echo: EchoSettings,
    ) -> Result<Self, SpawnError> {
        let name = name.into();

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so that destroying the process reaches its descendants as well.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SpawnError::SpawnFailed {
            process_name: name.clone(),
            source,
        })?;

        let Some(pid) = child.id() else {
            return Err(SpawnError::MissingPid { process_name: name });
        };

        let stdin = child.stdin.take();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            // Unreachable, as both are configured as piped above.
            return Err(SpawnError::SpawnFailed {
                process_name: name,
                source: std::io::Error::other("output streams of child were not captured"),
            });
        };

        let std_out_capture =
            OutputCapture::start(stdout, StreamType::StdOut, echo.stdout, echo.sink.clone());
        let std_err_capture =
            OutputCapture::start(stderr, StreamType::StdErr, echo.stderr, echo.sink);

        tracing::debug!(process = %name, pid, "Spawned process");

        Ok(Self {
            name,
            child,
            pid,
            stdin,
            std_out_capture,
            std_err_capture,
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The command this process was spawned from.
    pub fn command(&self) -> &str {
        &self.name
    }

    /// The OS process id, resolved once at spawn time.
    ///
    /// Remains available after the process exited, but may then refer to an unrelated process.
    pub fn process_id(&self) -> u32 {
        self.pid
    }

    pub fn stdout(&self) -> &OutputCapture {
        &self.std_out_capture
    }

    pub fn stderr(&self) -> &OutputCapture {
        &self.std_err_capture
    }

    /// Stdout lines captured at or after `index`.
    pub fn output_from(&self, index: usize) -> Vec<String> {
        self.std_out_capture.lines_from(index)
    }

    /// Stderr lines captured at or after `index`.
    pub fn error_from(&self, index: usize) -> Vec<String> {
        self.std_err_capture.lines_from(index)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn liveness(&self) -> Liveness {
        Liveness(self.active.clone())
    }

    /// Marks a process that is known to have exited on its own as no longer active.
    ///
    /// Neither kills the process nor closes its streams. The reader tasks end on their own once
    /// they reach EOF.
    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Writes `line` to the stdin of the process and flushes it.
    ///
    /// A `\n` is appended, unless `line` already ends with one.
    pub async fn send(&mut self, line: &str) -> Result<(), SendError> {
        if !self.is_active() {
            return Err(SendError::InputClosed {
                process_name: self.name.clone(),
            });
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SendError::InputClosed {
                process_name: self.name.clone(),
            });
        };

        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await
        }
        .await;

        result.map_err(|source| SendError::Io {
            process_name: self.name.clone(),
            source,
        })
    }

    /// The exit code of the process.
    ///
    /// Fails with [ExitCodeError::StillRunning] as long as the process has not exited.
    /// A process killed by a signal reports `128 + signal` on unix.
    pub fn exit_code(&mut self) -> Result<i32, ExitCodeError> {
        match self.child.try_wait() {
            Ok(Some(exit_status)) => Ok(exit_code_of(exit_status)),
            Ok(None) => Err(ExitCodeError::StillRunning {
                process_name: self.name.clone(),
            }),
            Err(source) => Err(ExitCodeError::Uncertain {
                process_name: self.name.clone(),
                source,
            }),
        }
    }

    /// Snapshot of the exit code and both captures.
    ///
    /// Fails with [ExitCodeError::StillRunning] if the process has not exited yet.
    pub fn snapshot_result(&mut self) -> Result<RunResult, ExitCodeError> {
        let exit_code = self.exit_code()?;
        Ok(RunResult::new(
            exit_code,
            self.std_out_capture.view(),
            self.std_err_capture.view(),
        ))
    }

    /// Clears both captures, so that subsequent reads only see output produced from now on.
    pub fn clear_output(&self) {
        self.std_out_capture.clear();
        self.std_err_capture.clear();
    }

    /// Kills the process and all of its descendants, then releases the captures.
    ///
    /// The steps are strictly ordered: kill the process tree, wait for the exit, close both
    /// streams and await both reader tasks, and only then mark the handle inactive. An observer
    /// polling [ProcessHandle::is_active] therefore never sees an inactive handle whose readers
    /// are still running.
    ///
    /// On unix, the process group is killed even if the process itself already exited, so
    /// descendants that outlived it are torn down as well. Destroying an already destroyed
    /// process succeeds. On windows, no signal is sent once the process exited, as its pid may
    /// already belong to an unrelated process.
    ///
    /// An error means the process could not be killed and is likely still running. Do not
    /// ignore it.
    pub async fn destroy(&mut self) -> Result<i32, TerminationError> {
        let already_exited = matches!(self.child.try_wait(), Ok(Some(_)));

        // A process group id is not reused while any member is alive, and killing an empty
        // group is a no-op. A bare pid gives no such guarantee.
        if cfg!(unix) || !already_exited {
            tracing::debug!(
                process = %self.name,
                pid = self.pid,
                already_exited,
                "Destroying process"
            );
            kill::kill_process_tree(self.pid).await.map_err(|source| {
                TerminationError::KillFailed {
                    process_name: self.name.clone(),
                    pid: self.pid,
                    source,
                }
            })?;
        }

        let exit_status = self
            .child
            .wait()
            .await
            .map_err(|source| TerminationError::WaitFailed {
                process_name: self.name.clone(),
                source,
            })?;

        self.stdin = None;
        self.release_captures().await;
        self.active.store(false, Ordering::Release);

        tracing::debug!(process = %self.name, ?exit_status, "Process destroyed");
        Ok(exit_code_of(exit_status))
    }

    /// Waits for the process to exit on its own, then for its output to be fully captured.
    ///
    /// The handle is marked inactive afterwards. On timeout, the process is left running and
    /// still active.
    pub async fn wait_for_completion(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<i32, WaitError> {
        let wait = self.child.wait();
        let exit_status = match timeout {
            None => wait.await,
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    return Err(WaitError::Timeout {
                        process_name: self.name.clone(),
                        timeout,
                    });
                }
            },
        }
        .map_err(|source| WaitError::Io {
            process_name: self.name.clone(),
            source,
        })?;

        self.release_captures().await;
        self.mark_inactive();

        Ok(exit_code_of(exit_status))
    }

    /// Waits for the process to exit on its own, [destroying](ProcessHandle::destroy) it if it
    /// does not do so within `timeout`.
    pub async fn wait_for_completion_or_destroy(
        &mut self,
        timeout: Duration,
    ) -> Result<i32, WaitError> {
        match self.wait_for_completion(Some(timeout)).await {
            Err(WaitError::Timeout { .. }) => {
                tracing::warn!(
                    process = %self.name,
                    ?timeout,
                    "Process did not complete in time, destroying it"
                );
                Ok(self.destroy().await?)
            }
            other => other,
        }
    }

    /// Wraps this handle, so that it gets destroyed when dropped while still active.
    pub fn destroy_on_drop(self) -> DestroyOnDrop {
        DestroyOnDrop {
            process_handle: self,
        }
    }

    /// Lets the readers drain what the exited process left in its pipes, then closes both
    /// streams and waits for the reader tasks to end.
    ///
    /// Descendants that inherited the pipes could keep them open forever. The grace period
    /// bounds how long we wait for a natural EOF.
    async fn release_captures(&mut self) {
        for capture in [&mut self.std_out_capture, &mut self.std_err_capture] {
            if !capture.wait_timeout(DRAIN_GRACE_PERIOD).await {
                tracing::debug!(
                    process = %self.name,
                    stream = %capture.ty(),
                    "Stream still open after exit, closing it"
                );
            }
            capture.close();
            capture.wait().await;
        }
    }
}

fn exit_code_of(exit_status: ExitStatus) -> i32 {
    if let Some(code) = exit_status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = exit_status.signal() {
            return 128 + signal;
        }
    }

    -1
}

#[cfg(test)]
mod tests {
    use crate::Process;
    use crate::error::{ExitCodeError, SendError, SpawnError, WaitError};
    use assertr::prelude::*;
    use std::process::Command;
    use std::time::Duration;
    use tracing_test::traced_test;

    const LINE_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn exit_code_fails_while_running_and_succeeds_after_exit() {
        let mut process = Process::shell("sleep 1").spawn().expect("Failed to spawn");

        let err = process.exit_code().unwrap_err();
        assert_that(matches!(err, ExitCodeError::StillRunning { .. })).is_true();
        assert_that(matches!(
            process.snapshot_result(),
            Err(ExitCodeError::StillRunning { .. })
        ))
        .is_true();

        let exit_code = process.wait_for_completion(None).await.unwrap();

        assert_that(exit_code).is_equal_to(0);
        assert_that(process.exit_code().unwrap()).is_equal_to(0);
        assert_that(process.is_active()).is_false();
    }

    #[tokio::test]
    #[traced_test]
    async fn destroy_kills_process_and_ends_readers() {
        let mut process = Process::shell("sleep 1000").spawn().expect("Failed to spawn");
        assert_that(process.is_active()).is_true();

        let exit_code = process.destroy().await.unwrap();

        // 128 + SIGKILL
        assert_that(exit_code).is_equal_to(137);
        assert_that(process.is_active()).is_false();
        assert_that(process.stdout().is_finished()).is_true();
        assert_that(process.stderr().is_finished()).is_true();
        assert_that(process.exit_code().unwrap()).is_equal_to(137);
        assert!(logs_contain("Destroying process"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let mut process = Process::shell("sleep 1000").spawn().expect("Failed to spawn");

        let first = process.destroy().await.unwrap();
        let second = process.destroy().await.unwrap();

        assert_that(second).is_equal_to(first);
        assert_that(process.is_active()).is_false();
    }

    #[tokio::test]
    async fn destroy_after_natural_exit_keeps_output() {
        let mut process = Process::shell("echo done; exit 4")
            .spawn()
            .expect("Failed to spawn");
        while process.exit_code().is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let exit_code = process.destroy().await.unwrap();

        assert_that(exit_code).is_equal_to(4);
        assert_that(process.output_from(0)).is_equal_to(&["done"]);
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: i32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), None) {
            Err(Errno::ESRCH) => true,
            // Killed, but not yet reaped by its new parent.
            _ => std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| stat.contains(") Z "))
                .unwrap_or(true),
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..200 {
            if is_gone(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn destroy_kills_descendants() {
        let mut process = Process::shell("sleep 1000 & echo $!; wait")
            .spawn()
            .expect("Failed to spawn");
        let grandchild: i32 = process
            .stdout()
            .wait_for_line(|line| !line.is_empty(), LINE_TIMEOUT)
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert_that(is_gone(grandchild)).is_false();

        process.destroy().await.unwrap();

        assert_that(wait_until_gone(grandchild).await).is_true();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn destroy_kills_descendants_of_exited_process() {
        let mut process = Process::shell("sleep 1000 & echo $!; exit 0")
            .spawn()
            .expect("Failed to spawn");
        let grandchild: i32 = process
            .stdout()
            .wait_for_line(|line| !line.is_empty(), LINE_TIMEOUT)
            .await
            .unwrap()
            .parse()
            .unwrap();

        let mut exit_code = process.exit_code();
        for _ in 0..500 {
            if exit_code.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            exit_code = process.exit_code();
        }
        assert_that(exit_code.unwrap()).is_equal_to(0);
        assert_that(is_gone(grandchild)).is_false();

        let exit_code = process.destroy().await.unwrap();

        assert_that(exit_code).is_equal_to(0);
        assert_that(wait_until_gone(grandchild).await).is_true();
        assert_that(process.is_active()).is_false();
    }

    #[tokio::test]
    async fn send_reaches_the_process() {
        let mut process = Process::shell(
            "while read line; do if [ \"$line\" = ping ]; then echo pong; fi; done",
        )
        .spawn()
        .expect("Failed to spawn");

        process.send("ping\n").await.unwrap();
        process.send("ping").await.unwrap();

        let line = process
            .stdout()
            .wait_for_line(|line| line == "pong", LINE_TIMEOUT)
            .await
            .unwrap();
        assert_that(line).is_equal_to("pong".to_string());

        for _ in 0..500 {
            if process.stdout().line_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_that(process.output_from(0)).is_equal_to(&["pong", "pong"]);

        process.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_destroy_fails() {
        let mut process = Process::shell("cat").spawn().expect("Failed to spawn");
        process.destroy().await.unwrap();

        let err = process.send("too late").await.unwrap_err();

        assert_that(matches!(err, SendError::InputClosed { .. })).is_true();
    }

    #[tokio::test]
    async fn send_to_exited_process_fails_with_io_error() {
        let mut process = Process::shell("exit 0").spawn().expect("Failed to spawn");
        for _ in 0..500 {
            if process.exit_code().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_that(process.is_active()).is_true();

        // The read end of the pipe is gone, so the write fails with a broken pipe.
        let err = process.send("nobody listens").await.unwrap_err();

        assert_that(matches!(err, SendError::Io { .. })).is_true();
        assert_that(process.is_active()).is_true();
    }

    #[tokio::test]
    async fn mark_inactive_does_not_kill() {
        let mut process = Process::shell("sleep 1000").spawn().expect("Failed to spawn");
        let liveness = process.liveness();

        process.mark_inactive();

        assert_that(liveness.is_active()).is_false();
        assert_that(process.is_active()).is_false();
        assert_that(matches!(
            process.exit_code(),
            Err(ExitCodeError::StillRunning { .. })
        ))
        .is_true();

        process.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn clear_output_scopes_reads_to_new_output() {
        let mut process = Process::shell("echo first; echo oops 1>&2; read x; echo second")
            .spawn()
            .expect("Failed to spawn");
        process
            .stdout()
            .wait_for_line(|line| line == "first", LINE_TIMEOUT)
            .await
            .unwrap();
        process
            .stderr()
            .wait_for_line(|line| line == "oops", LINE_TIMEOUT)
            .await
            .unwrap();

        process.clear_output();
        process.send("go").await.unwrap();
        process.wait_for_completion(Some(LINE_TIMEOUT)).await.unwrap();

        assert_that(process.output_from(0)).is_equal_to(&["second"]);
        assert_that(process.error_from(0)).is_empty();
    }

    #[tokio::test]
    async fn spawn_fails_for_unknown_executable() {
        let result = Process::new(Command::new("this-executable-does-not-exist-42")).spawn();

        assert_that(matches!(result, Err(SpawnError::SpawnFailed { .. }))).is_true();
    }

    #[tokio::test]
    async fn wait_for_completion_timeout_leaves_process_running() {
        let mut process = Process::shell("sleep 1000").spawn().expect("Failed to spawn");

        let result = process
            .wait_for_completion(Some(Duration::from_millis(50)))
            .await;

        assert_that(matches!(result, Err(WaitError::Timeout { .. }))).is_true();
        assert_that(process.is_active()).is_true();

        let exit_code = process
            .wait_for_completion_or_destroy(Duration::from_millis(50))
            .await
            .unwrap();
        assert_that(exit_code).is_equal_to(137);
        assert_that(process.is_active()).is_false();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroy_on_drop_destroys_active_process() {
        let process = Process::shell("sleep 1000")
            .spawn()
            .expect("Failed to spawn")
            .destroy_on_drop();
        let liveness = process.liveness();
        assert_that(liveness.is_active()).is_true();

        drop(process);

        assert_that(liveness.is_active()).is_false();
    }
}
