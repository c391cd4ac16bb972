use crate::async_drop;
use crate::process_handle::ProcessHandle;
use std::ops::{Deref, DerefMut};

/// A wrapper that automatically destroys a still active process when dropped.
///
/// # Safety Requirements
///
/// **WARNING**: This type requires a multithreaded tokio runtime to function correctly!
///
/// # Usage Guidelines
///
/// Prefer calling [`ProcessHandle::destroy`] or [`ProcessHandle::wait_for_completion`]
/// explicitly. Use this wrapper where a test may bail out early (failed assertion, `?`) and the
/// process must not outlive it.
///
/// # Implementation Details
///
/// The drop implementation destroys the process if the handle is still active. A process that
/// cannot be killed is leaked, so a failing destroy raises a panic.
#[derive(Debug)]
pub struct DestroyOnDrop {
    pub(crate) process_handle: ProcessHandle,
}

impl Deref for DestroyOnDrop {
    type Target = ProcessHandle;

    fn deref(&self) -> &Self::Target {
        &self.process_handle
    }
}

impl DerefMut for DestroyOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.process_handle
    }
}

impl Drop for DestroyOnDrop {
    fn drop(&mut self) {
        if !self.process_handle.is_active() {
            tracing::debug!(
                process = %self.process_handle.name,
                "Process no longer active"
            );
            return;
        }

        async_drop::run_future(async {
            match self.process_handle.destroy().await {
                Ok(exit_code) => {
                    tracing::debug!(
                        process = %self.process_handle.name,
                        exit_code,
                        "Destroyed process on drop"
                    )
                }
                Err(err) => {
                    panic!(
                        "Failed to destroy process '{}': {}",
                        self.process_handle.name, err
                    );
                }
            };
        });
    }
}
