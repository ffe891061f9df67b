//! Destination for build and run output.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use console::Term;

const DEFAULT_WIDTH: usize = 80;

/// Shared, append-only output destination.
///
/// Interactivity only changes how progress is rendered, never what is decoded.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    interactive: bool,
    width: usize,
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("interactive", &self.interactive)
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}

impl OutputSink {
    pub fn new(writer: Box<dyn Write + Send>, interactive: bool, width: usize) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            interactive,
            width: width.max(1),
        }
    }

    /// Standard output, interactive when attached to a terminal.
    pub fn stdout() -> Self {
        let term = Term::stdout();
        let interactive = term.is_term();
        let width = if interactive {
            usize::from(term.size().1)
        } else {
            DEFAULT_WIDTH
        };
        Self::new(Box::new(io::stdout()), interactive, width)
    }

    /// In-memory sink; the returned buffer sees everything written.
    pub fn memory(interactive: bool, width: usize) -> (Self, MemoryBuffer) {
        let buffer = MemoryBuffer::default();
        (
            Self::new(Box::new(buffer.clone()), interactive, width),
            buffer,
        )
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()
    }
}

/// Shared byte buffer behind [`OutputSink::memory`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer(Arc<Mutex<Vec<u8>>>);

impl MemoryBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
