use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::analytics::types::TraceEvent;
use crate::error::{Error, Result};

/// Receives every recorded trace event. Implementations must not block for
/// long; failures are logged by the recorder and never reach the run.
pub trait TraceSink: Send + Sync {
    fn write(&self, event: &TraceEvent) -> std::io::Result<()>;
}

/// Appends one JSON document per line.
#[derive(Debug)]
pub struct FileTraceSink {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl FileTraceSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::Config(format!(
                    "failed to create trace directory '{}': {err}",
                    parent.display()
                ))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                Error::Config(format!(
                    "failed to open trace file '{}': {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for FileTraceSink {
    fn write(&self, event: &TraceEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("trace file writer lock poisoned"))?;
        writeln!(writer, "{line}")
    }
}
