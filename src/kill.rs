use std::io;

/// Kills the process `pid` together with all of its descendants.
///
/// - on `cfg(unix)`: Sends a `SIGKILL` to the process group `pid`. The process must have been
///   spawned as leader of its own group, see [crate::Process].
/// - on `cfg(windows)`: Runs `taskkill /T /F /PID <pid>`.
///
/// A process (group) that no longer exists is not an error.
pub(crate) async fn kill_process_tree(pid: u32) -> io::Result<()> {
    if pid == 0 {
        // Signalling group 0 would hit our own process group.
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid must be non-zero"));
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let raw_pid = i32::try_from(pid)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        match killpg(Pid::from_raw(raw_pid), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                tracing::debug!(pid, "Process group already gone");
                Ok(())
            }
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(windows)]
    {
        // taskkill exits with 128 when the process does not exist (anymore).
        const NOT_FOUND: i32 = 128;

        let output = tokio::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdin(std::process::Stdio::null())
            .output()
            .await?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(NOT_FOUND) => {
                tracing::debug!(pid, "Process already gone");
                Ok(())
            }
            code => Err(io::Error::other(format!(
                "taskkill failed for pid {pid} (exit {code:?}): {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    #[cfg(all(not(windows), not(unix)))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Cannot kill process tree. Platform is unsupported.",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::kill_process_tree;
    use assertr::prelude::*;
    use std::io;
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    #[tokio::test]
    async fn rejects_pid_zero() {
        let err = kill_process_tree(0).await.unwrap_err();
        assert_that(err.kind()).is_equal_to(io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn kills_group_and_tolerates_repeated_kill() {
        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("1000").stdout(Stdio::null()).process_group(0);
        let mut child = tokio::process::Command::from(cmd).spawn().unwrap();
        let pid = child.id().unwrap();

        kill_process_tree(pid).await.unwrap();
        let status = child.wait().await.unwrap();
        assert_that(status.success()).is_false();

        // The group is gone now.
        kill_process_tree(pid).await.unwrap();
    }
}
