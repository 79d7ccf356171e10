//! Log capture for TUI mode
//!
//! `ActivityLog` implements `MakeWriter` so tracing output lands in a ring
//! buffer shown in the activity pane, and optionally in a log file, instead
//! of corrupting the alternate screen.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Lines kept for the activity pane.
const RING_BUFFER_CAPACITY: usize = 200;

/// Shared sink for formatted log lines.
#[derive(Clone, Default)]
pub struct ActivityLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    file: Option<Arc<Mutex<File>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also append every line to `path`.
    pub fn with_file(mut self, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(Arc::new(Mutex::new(file)));
        Ok(self)
    }

    /// Record a line, dropping the oldest one at capacity.
    pub fn push(&self, line: String) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            // Logging must not fail the caller
            let _ = writeln!(file, "{}", line);
        }

        let mut guard = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= RING_BUFFER_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(line);
    }

    /// Take all lines recorded since the last call, oldest first.
    pub fn drain(&self) -> Vec<String> {
        let mut guard = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        guard.drain(..).collect()
    }
}

/// Splits written bytes into lines for an [`ActivityLog`].
pub struct LineWriter {
    log: ActivityLog,
    pending: Vec<u8>,
}

impl LineWriter {
    fn new(log: ActivityLog) -> Self {
        Self {
            log,
            pending: Vec::new(),
        }
    }

    fn flush_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let s = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.log.push(s);
        }
    }
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.flush_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let s = String::from_utf8_lossy(&self.pending).into_owned();
            self.log.push(s);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for ActivityLog {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter::new(self.clone())
    }
}
