use crate::error::OutputError;
use crate::line_reader::{LineReader, decode_line};
use bytes::BytesMut;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Size of the buffer the reader task reads into.
const READ_BUFFER_SIZE: usize = 16 * 1024; // 16 kb

/// How often [OutputCapture::wait_for_line] looks at the buffer again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Receives every captured line that should be echoed live.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Represents the type of the captured stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    StdOut,
    StdErr,
}

impl Display for StreamType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::StdOut => f.write_str("stdout"),
            StreamType::StdErr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    lines: Mutex<Lines>,
    failure: Mutex<Option<Arc<io::Error>>>,
}

#[derive(Debug, Default)]
struct Lines {
    entries: Vec<String>,

    /// Incremented on every clear. Lets pollers notice a clear even if the buffer has since
    /// grown back past the index they were reading from.
    clears: u64,
}

// Both mutexes only ever guard plain data. A panic while holding one cannot leave it
// half-updated, so poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only view onto the lines captured from one stream.
///
/// Cloning is cheap and every clone observes the same, still growing, buffer. This is what a
/// [crate::RunResult] hands out, so no line is ever copied just to build a result.
///
/// The buffer is unbounded. Captures are meant for processes scoped to a test run, not as a
/// general purpose log store.
#[derive(Debug, Clone)]
pub struct CapturedLines {
    ty: StreamType,
    state: Arc<CaptureState>,
}

impl CapturedLines {
    fn new(ty: StreamType) -> Self {
        Self {
            ty,
            state: Arc::new(CaptureState::default()),
        }
    }

    pub fn ty(&self) -> StreamType {
        self.ty
    }

    /// Copies all lines captured at or after `index`.
    ///
    /// An `index` beyond the current line count yields an empty vec.
    pub fn lines_from(&self, index: usize) -> Vec<String> {
        let lines = lock(&self.state.lines);
        lines.entries.get(index..).map(<[String]>::to_vec).unwrap_or_default()
    }

    pub fn line_count(&self) -> usize {
        lock(&self.state.lines).entries.len()
    }

    /// Lines captured at or after `index`, joined with `\n`.
    pub fn join_from(&self, index: usize) -> String {
        self.lines_from(index).join("\n")
    }

    /// Whether any line captured so far matches `predicate`.
    pub fn contains_line(&self, predicate: impl Fn(&str) -> bool) -> bool {
        lock(&self.state.lines)
            .entries
            .iter()
            .any(|line| predicate(line))
    }

    /// The read failure that stopped the reader task, if any.
    pub fn failure(&self) -> Option<Arc<io::Error>> {
        lock(&self.state.failure).clone()
    }

    /// Copies the lines captured at or after `index`, unless the buffer was cleared since
    /// `clears` was observed. Then all lines are returned. Also returns the current clear count.
    fn lines_since(&self, clears: u64, index: usize) -> (u64, Vec<String>) {
        let lines = lock(&self.state.lines);
        let index = if lines.clears == clears { index } else { 0 };
        let new_lines = lines.entries.get(index..).map(<[String]>::to_vec).unwrap_or_default();
        (lines.clears, new_lines)
    }

    fn push(&self, line: String) {
        lock(&self.state.lines).entries.push(line);
    }

    fn set_failure(&self, err: io::Error) {
        *lock(&self.state.failure) = Some(Arc::new(err));
    }

    fn clear(&self) {
        let mut lines = lock(&self.state.lines);
        lines.entries.clear();
        lines.clears += 1;
    }
}

/// Captures one output stream of a process. Either stdout or stderr.
///
/// A dedicated tokio task drains the stream, decodes it into lines and appends them to a buffer
/// which can be read at any time, from any number of callers.
///
/// The reader task ends when the stream reaches EOF, fails or is [closed](OutputCapture::close).
/// Dropping the capture aborts the task.
pub struct OutputCapture {
    lines: CapturedLines,
    echo: bool,
    reader: Option<JoinHandle<()>>,
    close_sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl Debug for OutputCapture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCapture")
            .field("ty", &self.lines.ty)
            .field("echo", &self.echo)
            .field("line_count", &self.lines.line_count())
            .field("reader", &"non-debug < JoinHandle<()> >")
            .finish()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl OutputCapture {
    /// Starts capturing `stream` on a new tokio task.
    ///
    /// When `echo` is set, every line is handed to `sink` before it is buffered.
    pub fn start<S>(stream: S, ty: StreamType, echo: bool, sink: LineSink) -> Self
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let lines = CapturedLines::new(ty);
        let (close_sender, close_receiver) = oneshot::channel::<()>();
        let reader = read_lines(stream, lines.clone(), echo, sink, close_receiver);

        Self {
            lines,
            echo,
            reader: Some(reader),
            close_sender: Mutex::new(Some(close_sender)),
        }
    }

    pub fn ty(&self) -> StreamType {
        self.lines.ty
    }

    pub fn is_echoing(&self) -> bool {
        self.echo
    }

    /// A read-only view onto this capture's buffer.
    pub fn view(&self) -> CapturedLines {
        self.lines.clone()
    }

    pub fn lines_from(&self, index: usize) -> Vec<String> {
        self.lines.lines_from(index)
    }

    pub fn line_count(&self) -> usize {
        self.lines.line_count()
    }

    pub fn join_from(&self, index: usize) -> String {
        self.lines.join_from(index)
    }

    pub fn contains_line(&self, predicate: impl Fn(&str) -> bool) -> bool {
        self.lines.contains_line(predicate)
    }

    pub fn failure(&self) -> Option<Arc<io::Error>> {
        self.lines.failure()
    }

    /// Empties the buffer. Line indices start at zero again afterwards.
    ///
    /// Meant to be used between phases of a long-lived process, not while the caller still
    /// holds indices into the old buffer.
    pub fn clear(&self) {
        self.lines.clear();
    }

    /// Lets the reader task drop its stream and stop. Does nothing if already closed.
    pub fn close(&self) {
        if let Some(close_sender) = lock(&self.close_sender).take() {
            // Sending fails if the reader task already ended and dropped its receiver.
            let _res = close_sender.send(());
        }
    }

    /// Checks if the reader task has ended.
    pub fn is_finished(&self) -> bool {
        self.reader.as_ref().map(|r| r.is_finished()).unwrap_or(true)
    }

    /// Waits for the reader task to end.
    ///
    /// This only returns once the stream reached EOF, failed or was closed!
    pub async fn wait(&mut self) {
        if let Some(reader) = self.reader.take() {
            if let Err(err) = reader.await {
                tracing::warn!(stream = %self.lines.ty, error = %err, "Reader task did not complete");
            }
        }
    }

    /// Waits up to `timeout` for the reader task to end. Returns whether it did.
    pub(crate) async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, reader).await {
            Ok(result) => {
                if let Err(err) = result {
                    tracing::warn!(stream = %self.lines.ty, error = %err, "Reader task did not complete");
                }
                self.reader = None;
                true
            }
            Err(_elapsed) => false,
        }
    }

    /// Polls the buffer until a line matching `predicate` shows up and returns the first match.
    ///
    /// Lines captured before this call are considered as well. [OutputCapture::clear] the capture
    /// first to only match new output.
    pub async fn wait_for_line(
        &self,
        predicate: impl Fn(&str) -> bool,
        timeout: Duration,
    ) -> Result<String, OutputError> {
        let stream = self.lines.ty;
        let poll = async {
            let mut clears = 0;
            let mut next_index = 0;
            loop {
                // Read the state before the lines, so a reader that ends in between still has
                // its final lines inspected.
                let finished = self.is_finished();
                let (current_clears, new_lines) = self.lines.lines_since(clears, next_index);
                if current_clears != clears {
                    clears = current_clears;
                    next_index = 0;
                }
                next_index += new_lines.len();
                if let Some(line) = new_lines.into_iter().find(|line| predicate(line)) {
                    return Ok(line);
                }
                if finished {
                    return Err(OutputError::StreamEnded { stream });
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or(Err(OutputError::Timeout { stream, timeout }))
    }
}

fn read_lines<S>(
    mut stream: S,
    lines: CapturedLines,
    echo: bool,
    sink: LineSink,
    mut close_receiver: oneshot::Receiver<()>,
) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    let target = lines.clone();
    let append = move |line: String| {
        if echo {
            sink(&line);
        }
        target.push(line);
    };

    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut line_buffer = BytesMut::new();
        loop {
            tokio::select! {
                biased;

                // Also completes when the capture was dropped, as that drops the sender.
                _closed = &mut close_receiver => {
                    tracing::debug!(stream = %lines.ty, "Capture closed, dropping stream");
                    break;
                }
                read = stream.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        if !line_buffer.is_empty() {
                            append(decode_line(&line_buffer));
                        }
                        break;
                    }
                    Ok(_bytes_read) => {
                        for line in LineReader::new(&buf, &mut line_buffer) {
                            append(line);
                        }
                        buf.clear();
                    }
                    Err(err) => {
                        tracing::warn!(stream = %lines.ty, error = %err, "Could not read from stream");
                        lines.set_failure(err);
                        break;
                    }
                }
            }
        }
    })
}
