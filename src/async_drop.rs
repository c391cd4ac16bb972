use std::future::Future;

/// Enables executing async operations within synchronous Drop implementations.
///
/// # Safety requirements
///
/// **WARNING**: This function requires a multithreaded tokio runtime to function correctly!
///
/// # How it works
///
/// `Drop` is synchronous, but destroying a process means awaiting its exit and its reader tasks.
/// `block_in_place` tells tokio that the current worker thread is about to block, moving its
/// other tasks to different workers. The reader tasks we wait for can then still make progress
/// while `block_on` drives the given future to completion on this thread.
///
/// `block_in_place` panics on a current-thread runtime. Use
/// `#[tokio::test(flavor = "multi_thread")]` in tests relying on this.
pub(crate) fn run_future(future: impl Future<Output = ()>) {
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(future);
    });
}
