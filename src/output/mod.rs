// Output attribution for concurrently running items
//
// Every item writes through its own PrefixedWriter, and all writers of a run
// share one OutputSink. A sink write is atomic per call, and the prefixer only
// ever writes whole lines, so lines from different items never interleave.

use crate::utils::lock_mutex_recover;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Cloneable, thread-safe output destination
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::from_writer(io::stderr())
    }

    /// In-memory sink plus a handle for reading back what was written
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (Self::from_writer(captured.clone()), captured)
    }

    /// Write one line, logging instead of failing on sink errors
    pub fn write_line(&self, line: &str) {
        let mut inner = lock_mutex_recover(&self.inner);
        if let Err(e) = writeln!(inner, "{}", line).and_then(|_| inner.flush()) {
            log::warn!("[OutputSink] Failed to write output line: {}", e);
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_mutex_recover(&self.inner).write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        lock_mutex_recover(&self.inner).write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock_mutex_recover(&self.inner).flush()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Shared in-memory buffer behind `OutputSink::capture()`
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock_mutex_recover(&self.buffer)).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_mutex_recover(&self.buffer).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Line-buffering writer that tags every line with a prefix.
///
/// Complete lines are written as `"{prefix} {line}\n"`; a trailing fragment
/// without a newline is held until more text arrives or the writer is
/// flushed. Sink errors are logged and swallowed, so producing output can
/// never fail the item that produced it.
pub struct PrefixedWriter<W: Write> {
    prefix: String,
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(prefix: impl Into<String>, inner: W) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
            buffer: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Buffer `text` and emit every line it completes
    pub fn write_text(&mut self, text: &str) {
        self.buffer.extend_from_slice(text.as_bytes());
        self.emit_complete_lines();
    }

    /// Emit the pending fragment as its own line and flush the sink
    pub fn flush_pending(&mut self) {
        if !self.buffer.is_empty() {
            let fragment = std::mem::take(&mut self.buffer);
            self.emit_line(&fragment);
        }
        if let Err(e) = self.inner.flush() {
            log::warn!("[PrefixedWriter] Failed to flush output for {}: {}", self.prefix, e);
        }
    }

    fn emit_complete_lines(&mut self) {
        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return;
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        for line in complete[..last_newline].split(|b| *b == b'\n') {
            self.emit_line(line);
        }
    }

    fn emit_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let mut out = Vec::with_capacity(self.prefix.len() + line.len() + 2);
        out.extend_from_slice(self.prefix.as_bytes());
        out.push(b' ');
        out.extend_from_slice(line);
        out.push(b'\n');

        if let Err(e) = self.inner.write_all(&out) {
            log::warn!("[PrefixedWriter] Failed to write output for {}: {}", self.prefix, e);
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.emit_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending();
        Ok(())
    }
}

impl<W: Write> Drop for PrefixedWriter<W> {
    fn drop(&mut self) {
        self.flush_pending();
    }
}
