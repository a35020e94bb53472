//! Output sinks for received trace output.
//!
//! The control process hands every printable command (events, messages,
//! probe errors) to an [`OutputSink`] in arrival order, which by transport
//! FIFO is per-producer emission order.

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Destination for trace output lines. Implementations must tolerate calls
/// from concurrent tasks.
pub trait OutputSink: Send + Sync {
    /// Writes one line of trace output.
    ///
    /// # Errors
    ///
    /// Propagates the underlying write failure; the caller treats the sink
    /// as broken and stops delivering.
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Sink over any [`Write`], serialized by a mutex.
pub struct WriterSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WriterSink {
    /// Wraps an arbitrary writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Sink writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl OutputSink for WriterSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        lock(&self.lines).push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_sink_appends_newlines() {
        let buffer: Vec<u8> = Vec::new();
        let shared = std::sync::Arc::new(Mutex::new(buffer));

        struct Probe(std::sync::Arc<Mutex<Vec<u8>>>);
        impl Write for Probe {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                lock(&self.0).extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = WriterSink::new(Box::new(Probe(shared.clone())));
        sink.write_line("probe hit: malloc").unwrap();
        sink.write_line("probe hit: free").unwrap();
        assert_eq!(
            String::from_utf8(lock(&shared).clone()).unwrap(),
            "probe hit: malloc\nprobe hit: free\n"
        );
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.write_line("a").unwrap();
        sink.write_line("b").unwrap();
        assert_eq!(sink.lines(), vec!["a", "b"]);
    }
}
