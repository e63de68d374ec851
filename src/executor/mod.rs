//! Task executors
//!
//! Two interchangeable implementations of [`TaskExecutor`] cover the
//! execution modes: [`InProcessExecutor`] runs the script sequence on
//! the calling thread, [`ForkedExecutor`] runs it in a freshly spawned
//! child process and supervises that process to completion. The caller
//! selects one by configuration and never needs to distinguish their
//! results.

mod bridge;
mod forked;
mod in_process;
mod launcher;
mod process;
mod registry;

pub use bridge::{
    ResultReadError, delete_with_retry, read_context, read_result, write_context, write_result,
};
pub use forked::ForkedExecutor;
pub use in_process::InProcessExecutor;
pub use launcher::LaunchPlan;
pub use process::ProcessHandle;
pub use registry::NodeSessionRegistry;

use crate::task::{TaskContext, TaskResult};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Single entry point exposed to the scheduler layer
///
/// Both variants produce a uniform [`TaskResult`]: a success value or a
/// classified failure, plus propagated variables and metadata. Errors
/// never escape as panics or `Err` values; they land in the result's
/// error slot.
pub trait TaskExecutor: Send + Sync {
    /// Executes one task, streaming its output to the given sinks
    fn execute(&self, context: &TaskContext, out: &LogSink, err: &LogSink) -> TaskResult;
}

/// Shared, cloneable writer for task output
///
/// The child's stdout/stderr (or in-process script output) is streamed
/// here live, concurrently with execution, so operators always see a
/// failure inline with the output that produced it.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    /// Wraps an arbitrary writer
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink forwarding to the process stdout
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Sink forwarding to the process stderr
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    /// In-memory sink plus a handle to read back what was written
    #[must_use]
    pub fn capture() -> (Self, CaptureHandle) {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Self {
            inner: Arc::new(Mutex::new(Box::new(SharedBuffer {
                buffer: Arc::clone(&buffer),
            }))),
        };
        (sink, CaptureHandle { buffer })
    }

    /// Appends one line, flushing immediately
    pub fn write_line(&self, line: &str) {
        let mut writer = self.inner.lock();
        // A broken sink must never take the task down with it.
        if writeln!(writer, "{line}").is_err() {
            tracing::warn!("Failed to write task output line to sink");
        }
        let _ = writer.flush();
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogSink")
    }
}

/// Read-back handle for a capturing [`LogSink`]
#[derive(Clone)]
pub struct CaptureHandle {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CaptureHandle {
    /// Everything written to the sink so far
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).to_string()
    }
}

struct SharedBuffer {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink_reads_back_lines() {
        let (sink, capture) = LogSink::capture();
        sink.write_line("hello");
        sink.write_line("world");
        assert_eq!(capture.contents(), "hello\nworld\n");
    }

    #[test]
    fn test_capture_sink_is_shared_across_clones() {
        let (sink, capture) = LogSink::capture();
        let clone = sink.clone();
        clone.write_line("from clone");
        assert_eq!(capture.contents(), "from clone\n");
    }
}
