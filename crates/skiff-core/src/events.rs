//! Host callback surface.
//!
//! All callbacks are optional; unset local-file hooks fall back to native
//! filesystem calls. The main surface is single-threaded and owned by the
//! session's thread. `TransportPrompts` is the thread-safe subset transports
//! and the tunnel UI may invoke after the owning-thread check.

use std::path::Path;
use std::sync::Arc;

use crate::error::ExtendedInfo;
use crate::progress::{OperationKind, OperationProgress, OperationSide};
use crate::remote_file::RemoteFile;

/// Canonical user answers across query, retry, and overwrite prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAnswer {
    Yes,
    No,
    Retry,
    Abort,
    Skip,
    /// Skip this and every later failure in the operation.
    SkipAll,
    /// Overwrite this and every later collision.
    All,
    /// Skip this and every later collision.
    NoToAll,
    /// Overwrite only when the source is strictly newer.
    Older,
    NeverAskAgain,
    Resume,
    AlternateResume,
    Append,
    /// Protocol-specific named retry alternative.
    SpecialRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Error,
    Confirmation,
    Information,
}

/// One user question, with the answers the caller will accept.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub kind: QueryKind,
    pub message: String,
    /// Secondary detail, e.g. the failing error text or size/time rows of an
    /// overwrite prompt.
    pub detail: Option<String>,
    pub answers: Vec<QueryAnswer>,
}

impl QueryRequest {
    pub fn new(kind: QueryKind, message: impl Into<String>, answers: Vec<QueryAnswer>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            answers,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    UserName,
    Password,
    Passphrase,
    TunnelPassword,
    KeyboardInteractive,
}

/// Thread-safe prompt surface shared with transports and the tunnel UI
/// shim; the only part of the callback bundle that may cross threads.
#[derive(Clone, Default)]
pub struct TransportPrompts {
    pub information: Option<Arc<dyn Fn(&str, bool) + Send + Sync>>,
    pub query: Option<Arc<dyn Fn(&QueryRequest) -> QueryAnswer + Send + Sync>>,
    pub prompt: Option<Arc<dyn Fn(PromptKind, &str) -> Option<String> + Send + Sync>>,
    pub banner: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

type InformationFn = Box<dyn Fn(&str, bool)>;
type QueryUserFn = Box<dyn Fn(&QueryRequest) -> QueryAnswer>;
type ProgressFn = Box<dyn Fn(&OperationProgress)>;
type FinishedFn = Box<dyn Fn(OperationKind, OperationSide, &str)>;
type ChangeDirectoryFn = Box<dyn Fn(&str)>;
type ReadDirectoryFn = Box<dyn Fn(bool)>;
type ReadDirectoryProgressFn = Box<dyn Fn(usize)>;
type CloseFn = Box<dyn Fn()>;
type CaptureOutputFn = Box<dyn Fn(&str)>;
type ChecksumFn = Box<dyn Fn(&str, &str)>;
type FindingFileFn = Box<dyn Fn(&RemoteFile) -> bool>;
type ExtendedExceptionFn = Box<dyn Fn(&ExtendedInfo)>;
type LocalMoveFn = Box<dyn Fn(&Path, &Path) -> std::io::Result<()>>;
type LocalRemoveFn = Box<dyn Fn(&Path) -> std::io::Result<()>>;
type LocalCreateDirFn = Box<dyn Fn(&Path) -> std::io::Result<()>>;

/// The embedder-facing callback bundle.
#[derive(Default)]
pub struct TerminalEvents {
    pub on_information: Option<InformationFn>,
    pub on_query_user: Option<QueryUserFn>,
    pub on_progress: Option<ProgressFn>,
    pub on_finished: Option<FinishedFn>,
    pub on_change_directory: Option<ChangeDirectoryFn>,
    /// Fired before (`true`) and after (`false`) a fresh directory read.
    pub on_read_directory: Option<ReadDirectoryFn>,
    pub on_read_directory_progress: Option<ReadDirectoryProgressFn>,
    pub on_close: Option<CloseFn>,
    pub on_capture_output: Option<CaptureOutputFn>,
    pub on_calculated_checksum: Option<ChecksumFn>,
    /// Return false to stop a running find.
    pub on_finding_file: Option<FindingFileFn>,
    pub on_show_extended_exception: Option<ExtendedExceptionFn>,

    // Local-file operation hooks; native filesystem calls when unset.
    pub on_move_local_file: Option<LocalMoveFn>,
    pub on_remove_local_file: Option<LocalRemoveFn>,
    pub on_remove_local_directory: Option<LocalRemoveFn>,
    pub on_create_local_directory: Option<LocalCreateDirFn>,

    /// Thread-safe prompt surface handed to transports and backends.
    pub transport: TransportPrompts,
}

impl TerminalEvents {
    pub fn move_local_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        match &self.on_move_local_file {
            Some(hook) => hook(from, to),
            None => std::fs::rename(from, to),
        }
    }

    pub fn remove_local_file(&self, path: &Path) -> std::io::Result<()> {
        match &self.on_remove_local_file {
            Some(hook) => hook(path),
            None => std::fs::remove_file(path),
        }
    }

    pub fn remove_local_directory(&self, path: &Path) -> std::io::Result<()> {
        match &self.on_remove_local_directory {
            Some(hook) => hook(path),
            None => std::fs::remove_dir_all(path),
        }
    }

    pub fn create_local_directory(&self, path: &Path) -> std::io::Result<()> {
        match &self.on_create_local_directory {
            Some(hook) => hook(path),
            None => std::fs::create_dir_all(path),
        }
    }
}
