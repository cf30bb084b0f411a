//! Append-only outputs for audit records
//!
//! Each record is one JSON object per line. Writes are fire-and-forget:
//! a failing sink logs a warning and never fails the transaction.

use crate::config::SinkConfig;
use chrono::{Local, NaiveDate};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Which audit stream a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Detail,
    Summary,
}

impl LogKind {
    /// File name suffix used by the rotating sink
    pub fn file_suffix(&self) -> &'static str {
        match self {
            LogKind::Detail => "detail.log",
            LogKind::Summary => "sum.log",
        }
    }
}

/// Destination for serialized audit records
pub trait LogSink: Send + Sync {
    /// Append one serialized record
    fn write(&self, kind: LogKind, line: &str);
}

/// Writes each record to stdout
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn write(&self, _kind: LogKind, line: &str) {
        let mut out = io::stdout().lock();
        if let Err(e) = writeln!(out, "{}", line) {
            tracing::warn!(error = %e, "Failed to write audit record to stdout");
        }
    }
}

/// Keeps records in memory; used by tests and embedding applications
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogKind, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw lines written for `kind`, oldest first
    pub fn lines(&self, kind: LogKind) -> Vec<String> {
        self.lines
            .lock()
            .map(|l| {
                l.iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, line)| line.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records written for `kind`, parsed back to JSON
    pub fn records(&self, kind: LogKind) -> Vec<serde_json::Value> {
        self.lines(kind)
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Total number of records of any kind
    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemorySink {
    fn write(&self, kind: LogKind, line: &str) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push((kind, line.to_string())),
            Err(e) => tracing::warn!(error = %e, "Memory sink lock poisoned"),
        }
    }
}

struct ActiveFile {
    path: PathBuf,
    file: File,
    written: u64,
    day: NaiveDate,
}

/// Size- and day-rotated log file with gzip-compressed archives.
///
/// Files are named `<host>_<project>_<yyyyMMddHHmmss>[.<n>].<pid>.<suffix>`.
///
/// Each write takes a blocking lock and appends synchronously, which suits
/// the one-line-per-transaction volume of audit logs. Inside a Tokio
/// runtime the rotated file is compressed on the blocking pool; outside
/// one it is compressed inline before the next write.
pub struct RotatingFileSink {
    dir: PathBuf,
    host: String,
    project: String,
    max_file_bytes: u64,
    rotate_daily: bool,
    state: Mutex<RotationState>,
}

#[derive(Default)]
struct RotationState {
    active: Option<ActiveFile>,
    rotations: u32,
}

impl RotatingFileSink {
    /// Create the sink, ensuring the directory exists
    pub fn new(
        config: &SinkConfig,
        host: impl Into<String>,
        project: impl Into<String>,
    ) -> io::Result<Self> {
        fs::create_dir_all(&config.path)?;
        Ok(Self {
            dir: config.path.clone(),
            host: host.into(),
            project: project.into(),
            max_file_bytes: config.max_file_bytes,
            rotate_daily: config.rotate_daily,
            state: Mutex::new(RotationState::default()),
        })
    }

    /// Path of the file currently being written, if any
    pub fn active_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.active.as_ref().map(|a| a.path.clone()))
    }

    fn file_name(&self, kind: LogKind, index: u32) -> String {
        let ts = Local::now().format("%Y%m%d%H%M%S");
        let index = if index > 0 {
            format!(".{}", index)
        } else {
            String::new()
        };
        format!(
            "{}_{}_{}{}.{}.{}",
            self.host,
            self.project,
            ts,
            index,
            std::process::id(),
            kind.file_suffix()
        )
    }

    fn open(&self, kind: LogKind, index: u32) -> io::Result<ActiveFile> {
        let path = self.dir.join(self.file_name(kind, index));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(ActiveFile {
            path,
            file,
            written,
            day: Local::now().date_naive(),
        })
    }

    fn needs_rotation(&self, active: &ActiveFile) -> bool {
        (self.max_file_bytes > 0 && active.written >= self.max_file_bytes)
            || (self.rotate_daily && active.day != Local::now().date_naive())
    }

    fn append(&self, kind: LogKind, line: &str) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let rotate = state
            .active
            .as_ref()
            .map(|a| self.needs_rotation(a))
            .unwrap_or(false);
        if rotate {
            if let Some(old) = state.active.take() {
                drop(old.file);
                tracing::debug!(path = %old.path.display(), "Audit log rotated");
                archive(old.path)?;
            }
            state.rotations += 1;
        }

        if state.active.is_none() {
            let index = state.rotations;
            state.active = Some(self.open(kind, index)?);
        }

        if let Some(active) = state.active.as_mut() {
            active.file.write_all(line.as_bytes())?;
            active.file.write_all(b"\n")?;
            active.written += line.len() as u64 + 1;
        }
        Ok(())
    }
}

impl LogSink for RotatingFileSink {
    fn write(&self, kind: LogKind, line: &str) {
        if let Err(e) = self.append(kind, line) {
            tracing::warn!(
                dir = %self.dir.display(),
                error = %e,
                "Failed to append audit record"
            );
        }
    }
}

/// Compress a rotated file without holding up the caller when a runtime
/// is available
fn archive(path: PathBuf) -> io::Result<()> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || {
                if let Err(e) = compress(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to compress rotated audit log"
                    );
                }
            });
            Ok(())
        }
        Err(_) => compress(&path),
    }
}

/// Gzip `path` to `<path>.gz` and remove the plain file
fn compress(path: &Path) -> io::Result<()> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");

    let mut input = File::open(path)?;
    let output = File::create(PathBuf::from(gz_name))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)
}
