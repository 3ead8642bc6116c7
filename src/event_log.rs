use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::{io::Write, path::PathBuf};

use crate::error::NanonisError;
use crate::script::ScriptEvent;

/// One timestamped script event as stored in the log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Local>,
    pub kind: String,
    pub message: String,
}

impl EventRecord {
    pub fn now(event: &ScriptEvent) -> Self {
        Self {
            timestamp: Local::now(),
            kind: event.kind().to_string(),
            message: event.message().to_string(),
        }
    }

    /// `timestamp<TAB>kind<TAB>message`, as shown in a console log pane
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.kind,
            self.message
        )
    }
}

/// Buffered JSONL log of script events.
///
/// Records are appended to the file every `buffer_size` events and on drop.
/// Transient write failures are logged and retried on the next flush; only
/// `max_flush_failures` consecutive failures surface as an error.
#[derive(Debug)]
pub struct EventLog {
    buffer: Vec<EventRecord>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl EventLog {
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(std::ffi::OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.file_path
    }

    pub fn record(&mut self, event: &ScriptEvent) -> Result<(), NanonisError> {
        self.add(EventRecord::now(event))
    }

    pub fn add(&mut self, record: EventRecord) -> Result<(), NanonisError> {
        self.buffer.push(record);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NanonisError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                info!("Event log flushed to {:?}", self.file_path);
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures, self.max_flush_failures, e
                );

                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures, self.max_flush_failures
                    );
                }

                if self.flush_failures >= self.max_flush_failures {
                    return Err(NanonisError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            self.max_flush_failures, self.file_path
                        ),
                    });
                }

                // Kept in the buffer for the next attempt
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), NanonisError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| NanonisError::Io {
                source,
                context: format!("Failed to open event log {:?}", self.file_path),
            })?;

        let mut writer = std::io::BufWriter::new(file);
        for record in &self.buffer {
            writeln!(writer, "{}", serde_json::to_string(record)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read back every record of a JSONL event log
    pub fn read_all<P: Into<PathBuf>>(path: P) -> Result<Vec<EventRecord>, NanonisError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| NanonisError::Io {
            source,
            context: format!("Could not read event log at {path:?}"),
        })?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(NanonisError::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
