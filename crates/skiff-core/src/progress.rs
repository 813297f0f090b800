//! Per-operation mutable progress state, passed by reference through the
//! controller, retry loop, and backends.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
    CalculateSize,
    SetProperties,
    CalculateChecksum,
    CustomCommand,
}

/// Which side of the connection the operation touches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationSide {
    Local,
    Remote,
}

/// Cancellation severity, ordered from none to hardest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelStatus {
    Continue,
    Cancel,
    CancelTransfer,
    RemoteAbort,
}

/// Sticky batch answer for overwrite confirmations inside one bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum BatchOverwrite {
    /// Ask for every file.
    #[default]
    No,
    /// Overwrite everything without asking.
    All,
    /// Skip everything without asking.
    None,
    /// Overwrite only when the source is strictly newer.
    Older,
    AlternateResume,
    Resume,
    Append,
}

/// Mutable state of one running operation.
///
/// Invariants: `done_bytes <= total_bytes`, `file_index <= file_count`; once
/// `cancel != Continue` no further side effects are performed by the owner.
#[derive(Debug)]
pub struct OperationProgress {
    pub operation: OperationKind,
    pub side: OperationSide,
    pub file_count: usize,
    pub file_index: usize,
    pub file_name: String,
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub cancel: CancelStatus,
    pub skip_to_all: bool,
    pub batch_overwrite: BatchOverwrite,
    /// Bandwidth cap in bytes per second; 0 means unlimited.
    pub cps_limit: u64,
    started: Instant,
    suspended_at: Option<Instant>,
    suspended_total: Duration,
}

impl OperationProgress {
    pub fn new(operation: OperationKind, side: OperationSide) -> Self {
        Self {
            operation,
            side,
            file_count: 0,
            file_index: 0,
            file_name: String::new(),
            total_bytes: 0,
            done_bytes: 0,
            cancel: CancelStatus::Continue,
            skip_to_all: false,
            batch_overwrite: BatchOverwrite::No,
            cps_limit: 0,
            started: Instant::now(),
            suspended_at: None,
            suspended_total: Duration::ZERO,
        }
    }

    pub fn start(&mut self, file_count: usize, total_bytes: u64) {
        self.file_count = file_count;
        self.total_bytes = total_bytes;
        self.started = Instant::now();
    }

    pub fn set_file(&mut self, name: impl Into<String>) {
        self.file_name = name.into();
        self.file_index = (self.file_index + 1).min(self.file_count);
    }

    pub fn add_transferred(&mut self, bytes: u64) {
        self.done_bytes = (self.done_bytes + bytes).min(self.total_bytes);
    }

    pub fn request_cancel(&mut self, status: CancelStatus) {
        if status > self.cancel {
            self.cancel = status;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel != CancelStatus::Continue
    }

    /// Stop the elapsed-time clock while a user prompt is showing.
    pub fn suspend(&mut self) {
        if self.suspended_at.is_none() {
            self.suspended_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(at) = self.suspended_at.take() {
            self.suspended_total += at.elapsed();
        }
    }

    /// Elapsed operation time excluding time spent waiting on prompts.
    pub fn time_elapsed(&self) -> Duration {
        let gross = self.started.elapsed();
        let waited = match self.suspended_at {
            Some(at) => self.suspended_total + at.elapsed(),
            None => self.suspended_total,
        };
        gross.saturating_sub(waited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_only_escalates() {
        let mut progress = OperationProgress::new(OperationKind::Delete, OperationSide::Remote);
        progress.request_cancel(CancelStatus::CancelTransfer);
        progress.request_cancel(CancelStatus::Cancel);
        assert_eq!(progress.cancel, CancelStatus::CancelTransfer);
        assert!(progress.is_cancelled());
    }

    #[test]
    fn transferred_bytes_never_exceed_total() {
        let mut progress = OperationProgress::new(OperationKind::Copy, OperationSide::Local);
        progress.start(1, 100);
        progress.add_transferred(250);
        assert_eq!(progress.done_bytes, 100);
    }

    #[test]
    fn prompt_time_is_excluded_from_elapsed() {
        let mut progress = OperationProgress::new(OperationKind::Copy, OperationSide::Local);
        progress.start(1, 1);
        progress.suspend();
        std::thread::sleep(Duration::from_millis(20));
        progress.resume();
        assert!(progress.time_elapsed() < Duration::from_millis(15));
    }
}
