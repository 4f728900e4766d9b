//! Where operator-facing diagnostics go: QMP noise, register dumps, system logs.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Shared, cloneable writer for diagnostic text. Stderr unless a test swaps it.
#[derive(Clone)]
pub struct DiagnosticSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl DiagnosticSink {
    pub fn stderr() -> Self {
        Self::from_writer(io::stderr())
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// In-memory sink plus a handle to read back what was written.
    pub fn buffer() -> (Self, SharedBuffer) {
        let buf = SharedBuffer::default();
        (Self::from_writer(buf.clone()), buf)
    }

    pub fn write_str(&self, text: &str) {
        let _ = self.write_bytes(text.as_bytes());
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        w.write_all(bytes)?;
        w.flush()
    }
}

impl Write for DiagnosticSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_bytes(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::stderr()
    }
}

/// A `Vec<u8>` writer that can be read while another owner writes to it.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
