//! Error categorization for the session controller.
//!
//! Errors fall into four kinds with distinct propagation rules:
//! - Fatal: transport death, authentication abort. Closes the session and
//!   survives the controller boundary.
//! - SkipFile: produced by the retry loop when the user chose Skip/Skip-All.
//!   Bulk operations catch it, mark the file failed, and continue.
//! - Command: recoverable remote-side failure wrapping a backend error.
//!   Subject to the retry loop.
//! - Abort: silent unwind from user cancel or the callback guard. Never shown.

use std::fmt;
use std::io;

/// Enriched error info handed to host callbacks.
#[derive(Debug, Clone, Default)]
pub struct ExtendedInfo {
    pub message: String,
    pub help_keyword: Option<String>,
    pub causes: Vec<String>,
}

#[derive(Debug)]
pub enum SessionError {
    /// Unrecoverable failure; the session transitions to closed.
    Fatal(ExtendedInfo),
    /// The current file was skipped; bulk loops continue with the next one.
    SkipFile { message: String },
    /// Recoverable remote-side failure, candidate for the retry loop.
    Command {
        message: String,
        source: Option<eyre::Report>,
    },
    /// Silent unwind; carries no user-visible payload.
    Abort,
}

impl SessionError {
    pub fn fatal(message: impl Into<String>) -> Self {
        SessionError::Fatal(ExtendedInfo {
            message: message.into(),
            help_keyword: None,
            causes: Vec::new(),
        })
    }

    pub fn fatal_with(message: impl Into<String>, cause: &SessionError) -> Self {
        SessionError::Fatal(ExtendedInfo {
            message: message.into(),
            help_keyword: None,
            causes: vec![cause.to_string()],
        })
    }

    pub fn command(message: impl Into<String>) -> Self {
        SessionError::Command {
            message: message.into(),
            source: None,
        }
    }

    pub fn command_with(message: impl Into<String>, source: impl Into<eyre::Report>) -> Self {
        SessionError::Command {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        SessionError::SkipFile {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Fatal(_))
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, SessionError::SkipFile { .. })
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, SessionError::Abort)
    }

    /// Extended info bundle for the show-extended-exception callback.
    pub fn extended(&self) -> ExtendedInfo {
        match self {
            SessionError::Fatal(info) => info.clone(),
            SessionError::SkipFile { message } | SessionError::Command { message, source: None } => {
                ExtendedInfo {
                    message: message.clone(),
                    help_keyword: None,
                    causes: Vec::new(),
                }
            }
            SessionError::Command {
                message,
                source: Some(report),
            } => ExtendedInfo {
                message: message.clone(),
                help_keyword: None,
                causes: report.chain().map(|c| c.to_string()).collect(),
            },
            SessionError::Abort => ExtendedInfo::default(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Fatal(info) => write!(f, "{}", info.message),
            SessionError::SkipFile { message } => write!(f, "{}", message),
            SessionError::Command { message, source } => {
                if let Some(source) = source {
                    write!(f, "{}: {}", message, source)
                } else {
                    write!(f, "{}", message)
                }
            }
            SessionError::Abort => write!(f, "operation aborted"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Result type for all session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Category of a local IO failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCategory {
    /// Transient condition; retry may succeed.
    Retryable,
    /// Permanent condition; retrying is pointless.
    Permanent,
}

/// Categorize a local IO error for the retry loop's default answer.
pub fn categorize_io_error(err: &io::Error) -> IoCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => IoCategory::Retryable,
        _ => IoCategory::Permanent,
    }
}
