use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a log record, in the order the log facility defines them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPriority {
    Unknown,
    Default,
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LogPriority {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x1 => LogPriority::Default,
            0x2 => LogPriority::Verbose,
            0x3 => LogPriority::Debug,
            0x4 => LogPriority::Info,
            0x5 => LogPriority::Warn,
            0x6 => LogPriority::Error,
            0x7 => LogPriority::Fatal,
            0x8 => LogPriority::Silent,
            _ => LogPriority::Unknown,
        }
    }

    #[cfg(test)]
    pub fn as_byte(self) -> u8 {
        match self {
            LogPriority::Unknown => 0x0,
            LogPriority::Default => 0x1,
            LogPriority::Verbose => 0x2,
            LogPriority::Debug => 0x3,
            LogPriority::Info => 0x4,
            LogPriority::Warn => 0x5,
            LogPriority::Error => 0x6,
            LogPriority::Fatal => 0x7,
            LogPriority::Silent => 0x8,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            LogPriority::Verbose => 'V',
            LogPriority::Debug => 'D',
            LogPriority::Info => 'I',
            LogPriority::Warn => 'W',
            LogPriority::Error => 'E',
            LogPriority::Fatal => 'F',
            LogPriority::Silent => 'S',
            LogPriority::Unknown | LogPriority::Default => '?',
        }
    }
}

impl fmt::Display for LogPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogPriority::Unknown => "unknown",
            LogPriority::Default => "default",
            LogPriority::Verbose => "verbose",
            LogPriority::Debug => "debug",
            LogPriority::Info => "info",
            LogPriority::Warn => "warn",
            LogPriority::Error => "error",
            LogPriority::Fatal => "fatal",
            LogPriority::Silent => "silent",
        };
        f.write_str(name)
    }
}

impl FromStr for LogPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(LogPriority::Unknown),
            "default" => Ok(LogPriority::Default),
            "verbose" | "v" => Ok(LogPriority::Verbose),
            "debug" | "d" => Ok(LogPriority::Debug),
            "info" | "i" => Ok(LogPriority::Info),
            "warn" | "w" => Ok(LogPriority::Warn),
            "error" | "e" => Ok(LogPriority::Error),
            "fatal" | "f" => Ok(LogPriority::Fatal),
            "silent" | "s" => Ok(LogPriority::Silent),
            _ => Err(format!("unknown log priority: {}", s)),
        }
    }
}

/// Identity of the process that emitted a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub tid: i32,
    pub uid: u32,
}

/// Seconds and nanoseconds since the Unix epoch, as carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LogTimestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl LogTimestamp {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: now.timestamp(),
            nanoseconds: now.timestamp_subsec_nanos(),
        }
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanoseconds)
    }
}

/// A single decoded entry from the system log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub process: ProcessInfo,
    pub timestamp: LogTimestamp,
    pub log_id: u32,
    pub priority: LogPriority,
    pub tag: String,
    pub message: String,
}

impl LogEntry {
    pub const LAUNCHER_TAG: &'static str = "GeodeLauncher";

    /// Builds the entry shown in place of records that could not be decoded.
    pub fn from_error(error: &dyn fmt::Display) -> Self {
        Self {
            process: ProcessInfo::default(),
            timestamp: LogTimestamp::now(),
            log_id: 0,
            priority: LogPriority::Fatal,
            tag: Self::LAUNCHER_TAG.to_string(),
            message: format!("Failed to parse log entry with {}", error),
        }
    }

    pub fn message_trimmed(&self) -> &str {
        self.message
            .trim_matches(|c: char| c.is_whitespace() || c.is_control())
    }

    pub fn formatted_time<Tz>(&self, tz: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        match self.timestamp.to_datetime() {
            Some(time) => time
                .with_timezone(tz)
                .format("%Y-%m-%dT%H:%M:%S%.3f")
                .to_string(),
            None => format!("{}.{:09}", self.timestamp.seconds, self.timestamp.nanoseconds),
        }
    }

    pub fn as_simple_string(&self) -> String {
        self.simple_string_in(&chrono::Local)
    }

    pub fn simple_string_in<Tz>(&self, tz: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        format!(
            "{} [{}/{}]: {}",
            self.formatted_time(tz),
            self.priority.as_char(),
            self.tag,
            self.message_trimmed()
        )
    }
}
