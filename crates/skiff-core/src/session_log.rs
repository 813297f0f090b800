//! Append-only session log and the structured action log.
//!
//! A tunnel session owns a child log whose appends forward into the parent;
//! the child may be fed from the tunnel driver thread, so appends go through
//! a mutex. Only appending is cross-thread, never reconfiguration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::SessionError;
use crate::session::SessionData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Event,
    Error,
    Separator,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub kind: LogKind,
    /// Name of the log the entry originated in ("Tunnel" for tunnel logs).
    pub source: String,
    pub message: String,
}

pub struct SessionLog {
    name: String,
    parent: Option<Arc<SessionLog>>,
    entries: Mutex<Vec<LogEntry>>,
}

impl SessionLog {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: None,
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn child(name: impl Into<String>, parent: Arc<SessionLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Some(parent),
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event(&self, message: impl Into<String>) {
        self.append(LogKind::Event, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogKind::Error, message.into());
    }

    pub fn separator(&self) {
        self.append(LogKind::Separator, String::new());
    }

    /// Descriptor summary recorded on first open; secrets are elided.
    pub fn add_startup_info(&self, data: &SessionData) {
        self.event(format!(
            "Session '{}': {}://{}@{}:{}{}",
            data.session_name(),
            data.protocol.scheme(),
            data.user,
            data.host,
            data.port,
            if data.tunnel.is_some() { " (tunneled)" } else { "" },
        ));
    }

    fn append(&self, kind: LogKind, message: String) {
        match kind {
            LogKind::Error => log::warn!(target: "skiff::session", "[{}] {}", self.name, message),
            LogKind::Event => log::debug!(target: "skiff::session", "[{}] {}", self.name, message),
            LogKind::Separator => {}
        }
        let entry = LogEntry {
            time: Utc::now(),
            kind,
            source: self.name.clone(),
            message,
        };
        if let Some(parent) = &self.parent {
            parent.append_entry(entry.clone());
        }
        self.entries.lock().push(entry);
    }

    fn append_entry(&self, entry: LogEntry) {
        if let Some(parent) = &self.parent {
            parent.append_entry(entry.clone());
        }
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}

/// What a file-session action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Upload,
    Download,
    Delete,
    Rename,
    Copy,
    MakeDirectory,
    MakeLink,
    ChangeProperties,
    Touch,
    CustomCommand,
    Checksum,
    Stat,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Committed,
    RolledBack(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub path: String,
    pub destination: Option<String>,
    pub state: ActionState,
}

/// Append-only record of user-meaningful file-session actions. Every action
/// reaches exactly one terminal state; a handle dropped while still pending
/// is cancelled.
#[derive(Default)]
pub struct ActionLog {
    records: Mutex<Vec<ActionRecord>>,
}

impl ActionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(self: &Arc<Self>, kind: ActionKind, path: impl Into<String>) -> ActionHandle {
        let mut records = self.records.lock();
        records.push(ActionRecord {
            kind,
            path: path.into(),
            destination: None,
            state: ActionState::Pending,
        });
        ActionHandle {
            log: Arc::clone(self),
            index: records.len() - 1,
            open: true,
        }
    }

    pub fn records(&self) -> Vec<ActionRecord> {
        self.records.lock().clone()
    }

    fn transition(&self, index: usize, state: ActionState) {
        let mut records = self.records.lock();
        let record = &mut records[index];
        debug_assert_eq!(record.state, ActionState::Pending, "action terminated twice");
        if record.state == ActionState::Pending {
            record.state = state;
        }
    }

    fn set_destination(&self, index: usize, destination: String) {
        self.records.lock()[index].destination = Some(destination);
    }
}

pub struct ActionHandle {
    log: Arc<ActionLog>,
    index: usize,
    open: bool,
}

impl ActionHandle {
    pub fn destination(&self, destination: impl Into<String>) {
        self.log.set_destination(self.index, destination.into());
    }

    pub fn commit(mut self) {
        self.log.transition(self.index, ActionState::Committed);
        self.open = false;
    }

    pub fn cancel(mut self) {
        self.log.transition(self.index, ActionState::Cancelled);
        self.open = false;
    }

    pub fn rollback(mut self, error: &SessionError) {
        self.log
            .transition(self.index, ActionState::RolledBack(error.to_string()));
        self.open = false;
    }
}

impl Drop for ActionHandle {
    fn drop(&mut self) {
        if self.open {
            self.log.transition(self.index, ActionState::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_log_forwards_into_parent() {
        let parent = SessionLog::new("main");
        let child = SessionLog::child("Tunnel", Arc::clone(&parent));
        child.event("forwarding ready");
        let forwarded = parent.entries();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].source, "Tunnel");
        assert_eq!(child.entries().len(), 1);
    }

    #[test]
    fn action_states_are_terminal() {
        let log = ActionLog::new();
        let upload = log.begin(ActionKind::Upload, "/srv/a.txt");
        upload.commit();
        let delete = log.begin(ActionKind::Delete, "/srv/b.txt");
        delete.cancel();
        let rename = log.begin(ActionKind::Rename, "/srv/c.txt");
        rename.rollback(&SessionError::fatal("connection lost"));

        let records = log.records();
        assert_eq!(records[0].state, ActionState::Committed);
        assert_eq!(records[1].state, ActionState::Cancelled);
        assert!(matches!(records[2].state, ActionState::RolledBack(_)));
    }

    #[test]
    fn dropped_pending_action_is_cancelled() {
        let log = ActionLog::new();
        {
            let _action = log.begin(ActionKind::Stat, "/srv/d.txt");
        }
        assert_eq!(log.records()[0].state, ActionState::Cancelled);
    }
}
