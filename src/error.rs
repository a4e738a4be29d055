//! Error taxonomy shared by every component of the pipeline.
//!
//! Every fallible operation in the crate returns a [`LogtapError`] so callers
//! can map to an HTTP status, an exit code, or a retry policy without string
//! matching. Display messages are hand-written (no derive macro) to keep
//! control over wording, matching the style the rest of this codebase uses
//! for user-facing error text.

use std::fmt;

/// The taxonomy kinds from the spec's error handling design: used by
/// callers to pick an HTTP status code or a CLI exit code without matching
/// on enum variants directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Format,
    NotFound,
    Io,
    Backpressure,
    Protocol,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config_error",
            ErrorKind::Format => "format_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io_error",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::Protocol => "protocol_error",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// Process exit code per spec.md §6.4: 0 success, 2 config error, 3 I/O
    /// error, 130 interrupted. Everything else that reaches `main` as a
    /// startup failure is treated as a config error.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Config | ErrorKind::Format | ErrorKind::NotFound | ErrorKind::Protocol => 2,
            ErrorKind::Io => 3,
            ErrorKind::Backpressure | ErrorKind::Timeout => 3,
        }
    }

    /// HTTP status for the ingest server's error responses.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Config => 500,
            ErrorKind::Format | ErrorKind::Protocol => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Io => 500,
            ErrorKind::Backpressure => 429,
            ErrorKind::Timeout => 504,
        }
    }
}

/// Error type returned by every fallible operation in the core pipeline.
#[derive(Debug)]
pub enum LogtapError {
    /// Flag values, duration/size parsing, unknown redact pattern, malformed
    /// custom-pattern file. Always fatal at startup.
    Config(String),
    /// Capture metadata/index/shard schema violations.
    Format(String),
    /// Missing capture directory, metadata, or a shard referenced by the index.
    NotFound(String),
    /// Disk full, permission denied, broken pipe.
    Io(String),
    /// Transient: writer queue full, forwarder buffer full after retries.
    Backpressure,
    /// Malformed push body, unsupported encoding, oversized body.
    Protocol(String),
    /// An external call exceeded its deadline or was cancelled by shutdown.
    Timeout(String),
}

impl LogtapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LogtapError::Config(_) => ErrorKind::Config,
            LogtapError::Format(_) => ErrorKind::Format,
            LogtapError::NotFound(_) => ErrorKind::NotFound,
            LogtapError::Io(_) => ErrorKind::Io,
            LogtapError::Backpressure => ErrorKind::Backpressure,
            LogtapError::Protocol(_) => ErrorKind::Protocol,
            LogtapError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LogtapError::Config(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        LogtapError::Format(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        LogtapError::NotFound(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LogtapError::Protocol(msg.into())
    }

    /// Render the compact JSON body the spec requires for ingest error
    /// responses and `--json` CLI output: `{"error":"<kind>","detail":"<msg>"}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind().as_str(),
            "detail": self.to_string(),
        })
    }
}

impl fmt::Display for LogtapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogtapError::Config(m) => write!(f, "configuration error: {}", m),
            LogtapError::Format(m) => write!(f, "capture format error: {}", m),
            LogtapError::NotFound(m) => write!(f, "not found: {}", m),
            LogtapError::Io(m) => write!(f, "I/O error: {}", m),
            LogtapError::Backpressure => write!(f, "backpressure: queue is full"),
            LogtapError::Protocol(m) => write!(f, "protocol error: {}", m),
            LogtapError::Timeout(m) => write!(f, "timed out: {}", m),
        }
    }
}

impl std::error::Error for LogtapError {}

impl From<std::io::Error> for LogtapError {
    fn from(e: std::io::Error) -> Self {
        LogtapError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for LogtapError {
    fn from(e: serde_json::Error) -> Self {
        LogtapError::Format(e.to_string())
    }
}

impl From<regex::Error> for LogtapError {
    fn from(e: regex::Error) -> Self {
        LogtapError::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for LogtapError {
    fn from(e: serde_yaml::Error) -> Self {
        LogtapError::Config(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LogtapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(ErrorKind::Config.exit_code(), 2);
        assert_eq!(ErrorKind::Io.exit_code(), 3);
    }

    #[test]
    fn json_body_shape() {
        let err = LogtapError::Protocol("bad body".into());
        let v = err.to_json();
        assert_eq!(v["error"], "protocol_error");
        assert_eq!(v["detail"], "protocol error: bad body");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::Backpressure.http_status(), 429);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
    }
}
