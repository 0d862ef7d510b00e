//! Reopenable file log sinks
//!
//! The access and error logs are plain line-oriented files, separate
//! from the structured tracing output: they are meant to be tailed,
//! grepped and rotated by the operator. Each sink holds an optional
//! path; with no path configured, writes are discarded.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;

use crate::error::Result;

/// A mutex-guarded, reopenable append-only log file.
pub struct FileSink {
    inner: Mutex<SinkState>,
}

struct SinkState {
    path: String,
    file: Option<File>,
}

impl FileSink {
    /// Create a sink that discards everything until `set_file` points
    /// it at a path.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SinkState {
                path: String::new(),
                file: None,
            }),
        }
    }

    /// Point the sink at `path` and swap the open handle atomically.
    /// An empty path closes the current file and discards from then
    /// on. The parent directory is created if missing.
    pub fn set_file(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        state.path = path.to_string();
        state.open_current()
    }

    /// Reopen the current path. Used for log rotation: rename the
    /// file, then ask the sink to reopen.
    pub fn reopen(&self) -> Result<()> {
        self.lock().open_current()
    }

    /// Append one timestamped line. Write failures are swallowed; a
    /// log sink must never take a worker down.
    pub fn log(&self, args: fmt::Arguments<'_>) {
        let mut state = self.lock();
        if let Some(file) = state.file.as_mut() {
            let _ = writeln!(file, "{} {}", Local::now().format("%Y/%m/%d %H:%M:%S"), args);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for FileSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkState {
    fn open_current(&mut self) -> Result<()> {
        if self.path.is_empty() {
            self.file = None;
            return Ok(());
        }

        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // Dropping the previous handle closes it.
        self.file = Some(file);
        Ok(())
    }
}
