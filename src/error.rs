use thiserror::Error;

/// Failure to decode one binary log record.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The stream ended cleanly on a record boundary.
    #[error("end of log stream")]
    EndOfStream,

    #[error("log stream ended in the middle of a record")]
    Truncated,

    #[error("unknown log record format (header size = {0:#x})")]
    UnknownHeaderSize(u16),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        // Any short read past the first byte of a record is a truncation.
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::Truncated
        } else {
            DecodeError::Io(e)
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("unexpected response {0}")]
    UnexpectedStatus(u16),

    #[error("api ratelimit reached, try again in {minutes}m")]
    RateLimited { minutes: i64 },

    #[error("release has no download for platform {0}")]
    MissingAsset(String),

    #[error("release archive does not contain {0}")]
    MissingArchiveEntry(String),

    #[error("installed mod core was modified externally")]
    ExternalFileInUse,
}
