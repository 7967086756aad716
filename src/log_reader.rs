use crate::error::DecodeError;
use crate::log_decoder::decode_entry;
use crate::log_entry::{LogEntry, LogPriority};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::io::{Cursor, Read};
use tokio::process::Command;
use tokio::sync::watch;

/// Entries below this priority are dropped unless the caller asks otherwise.
pub const DEFAULT_MIN_PRIORITY: LogPriority = LogPriority::Info;

/// Lazily decodes a stream of concatenated records.
///
/// Iteration stops at a clean end of input. Any other decode failure yields
/// one synthetic FATAL entry describing it and then ends the sequence.
pub struct LogEntries<R> {
    reader: R,
    min_priority: LogPriority,
    finished: bool,
    hit_error: bool,
}

impl<R: Read> LogEntries<R> {
    pub fn new(reader: R, min_priority: LogPriority) -> Self {
        Self {
            reader,
            min_priority,
            finished: false,
            hit_error: false,
        }
    }

    /// True once a decode error has been turned into an error entry.
    pub fn hit_error(&self) -> bool {
        self.hit_error
    }
}

impl<R: Read> Iterator for LogEntries<R> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        while !self.finished {
            match decode_entry(&mut self.reader) {
                Ok(entry) if entry.priority >= self.min_priority => return Some(entry),
                Ok(_) => continue,
                Err(DecodeError::EndOfStream) => self.finished = true,
                Err(e) => {
                    warn!("Stopping log read: {}", e);
                    self.finished = true;
                    self.hit_error = true;
                    return Some(LogEntry::from_error(&e));
                }
            }
        }
        None
    }
}

/// Fully decodes `reader`, returning the entries and whether decoding failed.
pub fn read_entries<R: Read>(reader: R, min_priority: LogPriority) -> (Vec<LogEntry>, bool) {
    let mut entries = LogEntries::new(reader, min_priority);
    let lines: Vec<LogEntry> = entries.by_ref().collect();
    (lines, entries.hit_error())
}

/// Result of one dump of the system log.
#[derive(Debug, Default)]
pub struct LogLoad {
    pub entries: Vec<LogEntry>,
    pub failed: bool,
}

/// The external `logcat` tool, in dump mode.
#[derive(Debug, Clone)]
pub struct LogcatSource {
    pub program: String,
    pub crash_buffer: bool,
}

impl LogcatSource {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            crash_buffer: false,
        }
    }

    fn command(&self, extra: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.crash_buffer {
            cmd.args(["-b", "crash"]);
        }
        cmd.args(extra);
        cmd
    }

    /// Dumps the binary log (`-B -d`) and decodes it off the async threads.
    pub async fn load(&self, min_priority: LogPriority) -> LogLoad {
        let output = match self.command(&["-B", "-d"]).output().await {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to run {}: {}", self.program, e);
                return LogLoad {
                    entries: vec![LogEntry::from_error(&e)],
                    failed: true,
                };
            }
        };

        if !output.status.success() {
            warn!("{} exited with {}", self.program, output.status);
        }
        debug!("Read {} bytes of binary log", output.stdout.len());

        let decoded = tokio::task::spawn_blocking(move || {
            read_entries(Cursor::new(output.stdout), min_priority)
        })
        .await;

        match decoded {
            Ok((entries, failed)) => LogLoad { entries, failed },
            Err(e) => LogLoad {
                entries: vec![LogEntry::from_error(&e)],
                failed: true,
            },
        }
    }

    /// Clears the selected log buffer (`-c`).
    pub async fn clear(&self) -> Result<()> {
        let status = self
            .command(&["-c"])
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !status.success() {
            anyhow::bail!("{} -c exited with {}", self.program, status);
        }
        Ok(())
    }

    /// Dumps the log in the tool's own text format.
    pub async fn dump_text(&self) -> String {
        match self.command(&["-d"]).output().await {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => format!("Failed to run {}: {}", self.program, e),
        }
    }
}

/// Loaded view over the system log with a crash-buffer toggle.
pub struct LogView {
    source: LogcatSource,
    min_priority: LogPriority,
    entries: Vec<LogEntry>,
    failed_to_load: bool,
    is_loading: watch::Sender<bool>,
}

impl LogView {
    pub fn new(source: LogcatSource, min_priority: LogPriority) -> Self {
        let (is_loading, _) = watch::channel(false);
        Self {
            source,
            min_priority,
            entries: Vec::new(),
            failed_to_load: false,
            is_loading,
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn failed_to_load(&self) -> bool {
        self.failed_to_load
    }

    pub fn crash_buffer(&self) -> bool {
        self.source.crash_buffer
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.is_loading.subscribe()
    }

    pub async fn load(&mut self) {
        self.is_loading.send_replace(true);

        let load = self.source.load(self.min_priority).await;
        info!("Loaded {} log entries", load.entries.len());
        self.entries = load.entries;
        self.failed_to_load = load.failed;

        self.is_loading.send_replace(false);
    }

    pub async fn toggle_crash_buffer(&mut self) {
        self.source.crash_buffer = !self.source.crash_buffer;
        self.entries.clear();
        self.load().await;
    }

    pub async fn clear_logs(&mut self) -> Result<()> {
        self.entries.clear();
        self.source.clear().await
    }

    /// Text suitable for exporting; falls back to the text dump when the
    /// binary load did not succeed.
    pub async fn log_data(&self) -> String {
        if self.failed_to_load {
            self.source.dump_text().await
        } else {
            self.entries
                .iter()
                .map(LogEntry::as_simple_string)
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}
