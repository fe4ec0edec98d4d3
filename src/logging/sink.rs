//! Byte-oriented log outputs.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Shared, append-only log output over a [`MakeWriter`].
///
/// Each rendered line goes out in a single `write_all` on a fresh writer,
/// so concurrent emitters never split a line as long as the writer locks
/// per call (stderr and [`SharedBuffer`] do). Ordering between concurrent
/// emitters is not guaranteed.
#[derive(Clone)]
pub struct Sink {
    make_writer: Arc<BoxMakeWriter>,
}

impl Sink {
    pub fn new<M>(make_writer: M) -> Self
    where
        M: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        Self {
            make_writer: Arc::new(BoxMakeWriter::new(make_writer)),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr)
    }

    pub fn discard() -> Self {
        Self::new(io::sink)
    }

    pub fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut writer = self.make_writer.make_writer();
        writer.write_all(line)?;
        writer.flush()
    }
}

impl From<SharedBuffer> for Sink {
    fn from(buffer: SharedBuffer) -> Self {
        Sink::new(buffer)
    }
}

/// In-memory sink for tests and diagnostics.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything written so far, lossily decoded as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedBuffer {
    type Writer = SharedBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Remove ANSI SGR escape sequences (`ESC [ ... m`).
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
