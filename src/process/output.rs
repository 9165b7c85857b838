use crate::error::{Result, WardenError};
use crate::process::deafness::SentinelDetector;
use crate::process::supervisor::LeaderEvent;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Longest line written as one log entry; longer output is split
const MAX_LINE: usize = 64 * 1024;

/// Append-only log file receiving one child stream
pub struct LogSink {
    path: PathBuf,
    file: File,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("path", &self.path).finish()
    }
}

impl LogSink {
    /// Open (creating if absent) a log file in append mode
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                WardenError::LogFileError(format!("Failed to open {}: {}", path.display(), e))
            })?;

        Ok(Self { path, file })
    }

    /// Get the path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, prefixed with the current time and the child's pid
    pub async fn write_line(&mut self, pid: u32, line: &[u8]) -> Result<()> {
        let entry = format_line(&Local::now(), pid, line);

        self.file
            .write_all(&entry)
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to write to log: {}", e)))?;

        self.file
            .flush()
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to flush log: {}", e)))
    }
}

/// Format: `[2024-05-01T10:20:30.123+02:00] [4242] <line>`
pub fn format_line(timestamp: &DateTime<Local>, pid: u32, line: &[u8]) -> Vec<u8> {
    let prefix = format!("[{}] [{}] ", timestamp.format("%Y-%m-%dT%H:%M:%S%.3f%:z"), pid);

    let mut entry = Vec::with_capacity(prefix.len() + line.len() + 1);
    entry.extend_from_slice(prefix.as_bytes());
    entry.extend_from_slice(line);

    // Ensure newline at end if not present
    if !line.ends_with(b"\n") {
        entry.push(b'\n');
    }

    entry
}

/// Copy a child stream line by line into its log file
///
/// When a detector is given, every line is also scanned for the sentinel and
/// the leader is told once the child went deaf. The stream is drained until
/// EOF even if the log file stops accepting writes, so the child never
/// blocks on a full pipe.
pub async fn pump_output<R>(
    app: String,
    pid: u32,
    stream: R,
    mut sink: LogSink,
    mut detector: Option<SentinelDetector>,
    events: UnboundedSender<LeaderEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut write_failed = false;

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE as u64);
        match limited.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Err(e) = sink.write_line(pid, &line).await {
                    if !write_failed {
                        warn!(app = %app, pid, log = %sink.path().display(), "{}", e);
                        write_failed = true;
                    }
                }

                if detector.as_mut().is_some_and(|d| d.scan(&line)) {
                    let _ = events.send(LeaderEvent::ChildDeaf {
                        app: app.clone(),
                        pid,
                    });
                }
            }
            Err(e) => {
                debug!(app = %app, pid, "Output stream closed with error: {}", e);
                break;
            }
        }
    }

    if detector.as_mut().is_some_and(|d| d.finish()) {
        let _ = events.send(LeaderEvent::ChildDeaf { app, pid });
    }
}
