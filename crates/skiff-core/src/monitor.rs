//! Keep-up-to-date controller: watch a local tree and drive incremental
//! synchronization toward the remote side.
//!
//! The watcher thread only queues raw filesystem events; the embedder pumps
//! them on the session's thread, where coalescing, filtering, and the actual
//! synchronize calls happen.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::copy_param::{CopyParam, MaskParams, TransferSide};
use crate::error::{SessionError, SessionResult};
use crate::sync::{SyncAction, SyncMode, SyncParams};
use crate::terminal::Terminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
}

pub struct MonitorOptions {
    pub params: SyncParams,
    pub copy_param: CopyParam,
    /// Watch and synchronize subdirectories too.
    pub recurse: bool,
    /// Run one full synchronize before watching.
    pub synchronize_on_start: bool,
    /// Whitelist of first-level directory names; `None` admits all.
    pub filter: Option<Vec<String>>,
    /// Watched-directory ceiling; 0 means unlimited.
    pub max_directories: usize,
    /// Coalescing window; `None` takes the configuration default.
    pub change_delay: Option<Duration>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            params: SyncParams::default(),
            copy_param: CopyParam::default(),
            recurse: false,
            synchronize_on_start: false,
            filter: None,
            max_directories: 0,
            change_delay: None,
        }
    }
}

type InvalidHandler = Box<dyn FnMut(&Path, &str)>;
/// Receives the current ceiling; may raise it and return true to continue.
type TooManyHandler = Box<dyn FnMut(&mut usize) -> bool>;
type AbortHandler = Box<dyn FnMut(bool)>;
type LogHandler = Box<dyn FnMut(&str)>;

pub struct MonitorController {
    state: MonitorState,
    local_root: PathBuf,
    remote_root: String,
    options: MonitorOptions,
    change_delay: Duration,
    watcher: Option<RecommendedWatcher>,
    events: Option<Receiver<notify::Result<notify::Event>>>,
    pending: HashMap<PathBuf, Instant>,
    directories: usize,
    max_directories: usize,

    pub on_invalid: Option<InvalidHandler>,
    pub on_too_many_directories: Option<TooManyHandler>,
    pub on_abort: Option<AbortHandler>,
    pub on_log: Option<LogHandler>,
}

impl MonitorController {
    pub fn new(
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        options: MonitorOptions,
    ) -> Self {
        Self {
            state: MonitorState::Idle,
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            max_directories: options.max_directories,
            change_delay: options.change_delay.unwrap_or(Duration::ZERO),
            options,
            watcher: None,
            events: None,
            pending: HashMap::new(),
            directories: 0,
            on_invalid: None,
            on_too_many_directories: None,
            on_abort: None,
            on_log: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn watched_directories(&self) -> usize {
        self.directories
    }

    pub fn start(&mut self, terminal: &mut Terminal) -> SessionResult<()> {
        debug_assert_eq!(self.state, MonitorState::Idle);
        if !self.local_root.is_dir() {
            return Err(SessionError::command(format!(
                "'{}' is not a directory",
                self.local_root.display()
            )));
        }
        if self.options.params.not_by_time && !self.options.params.by_size {
            return Err(SessionError::command(
                "no synchronization criteria are active",
            ));
        }
        if self.change_delay.is_zero() {
            self.change_delay = terminal.configuration.keep_up_to_date_change_delay;
        }

        let result = (|| -> SessionResult<()> {
            if self.options.synchronize_on_start {
                self.emit_log(&format!("Scanning '{}'...", self.local_root.display()));
                let local_root = self.local_root.clone();
                let remote_root = self.remote_root.clone();
                self.synchronize_directory(terminal, &local_root, &remote_root, true)?;
            }

            self.directories = self.census();
            if !self.negotiate_directory_budget() {
                return Err(SessionError::command(format!(
                    "watching {} directories exceeds the configured limit",
                    self.directories
                )));
            }

            let (sender, receiver) = channel();
            let mut watcher = notify::recommended_watcher(move |event| {
                // Full queue or a dropped receiver only means the monitor is
                // shutting down.
                let _ = sender.send(event);
            })
            .map_err(|err| SessionError::command_with("error creating directory watcher", err))?;
            let mode = if self.options.recurse {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher
                .watch(&self.local_root, mode)
                .map_err(|err| SessionError::command_with("error watching directory", err))?;
            self.watcher = Some(watcher);
            self.events = Some(receiver);
            self.state = MonitorState::Running;
            self.emit_log(&format!(
                "Watching for changes, {} director{}.",
                self.directories,
                if self.directories == 1 { "y" } else { "ies" }
            ));
            Ok(())
        })();
        if result.is_err() {
            self.stop();
        }
        result
    }

    pub fn stop(&mut self) {
        self.state = MonitorState::Stopping;
        self.watcher = None;
        self.events = None;
        self.pending.clear();
        self.state = MonitorState::Idle;
    }

    /// Drain watcher events, coalesce them per directory, and run the
    /// synchronize engine for every directory whose quiet period elapsed.
    /// Call from the session's thread.
    pub fn pump(&mut self, terminal: &mut Terminal) -> SessionResult<()> {
        if self.state != MonitorState::Running {
            return Ok(());
        }

        let mut queued: Vec<PathBuf> = Vec::new();
        let mut invalid: Option<String> = None;
        if let Some(events) = &self.events {
            while let Ok(event) = events.try_recv() {
                match event {
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in event.paths {
                            let directory = if path.is_dir() {
                                path
                            } else {
                                match path.parent() {
                                    Some(parent) => parent.to_path_buf(),
                                    None => continue,
                                }
                            };
                            queued.push(directory);
                        }
                    }
                    Err(err) => {
                        invalid = Some(err.to_string());
                        break;
                    }
                }
            }
        }
        for directory in queued {
            if self.admit_directory(&directory) {
                self.pending.insert(directory, Instant::now());
            }
        }
        if let Some(reason) = invalid {
            let root = self.local_root.clone();
            if let Some(handler) = self.on_invalid.as_mut() {
                handler(&root, &reason);
            }
            self.abort(false);
            return Ok(());
        }

        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= self.change_delay)
            .map(|(path, _)| path.clone())
            .collect();
        for directory in due {
            self.pending.remove(&directory);
            self.emit_log(&format!("Change in '{}' detected.", directory.display()));
            let remote = match self.map_to_remote(&directory) {
                Some(remote) => remote,
                None => {
                    debug_assert!(false, "watched path outside the local root");
                    continue;
                }
            };
            match self.synchronize_directory(terminal, &directory, &remote, false) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    self.abort(true);
                    return Err(err);
                }
                Err(err) => {
                    self.emit_log(&format!("Synchronization failed: {err}"));
                    self.abort(false);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Map a watched local directory to its remote counterpart. The watched
    /// path always shares the local-root prefix.
    fn map_to_remote(&self, directory: &Path) -> Option<String> {
        let relative = directory.strip_prefix(&self.local_root).ok()?;
        let mut remote = crate::remote_file::unix_exclude_trailing_slash(&self.remote_root);
        for component in relative.components() {
            remote = crate::remote_file::unix_combine(
                &remote,
                &component.as_os_str().to_string_lossy(),
            );
        }
        Some(remote)
    }

    fn synchronize_directory(
        &mut self,
        terminal: &mut Terminal,
        local: &Path,
        remote: &str,
        initial: bool,
    ) -> SessionResult<()> {
        let mut params = self.options.params;
        // Each change event is synchronized as one bounded directory; the
        // initial pass is the only recursive one.
        params.no_recurse = if initial { !self.options.recurse } else { true };
        // The root whitelist only constrains the first level.
        let filter = if local == self.local_root {
            self.options.filter.as_deref()
        } else {
            None
        };
        let checklist = terminal.synchronize_collect(
            local,
            remote,
            SyncMode::Remote,
            &self.options.copy_param,
            params,
            filter,
            None,
        )?;

        let mut subdirs_changed = false;
        if self.options.recurse {
            // A delete-remote directory item fires this too, even when the
            // local side did not change.
            subdirs_changed = checklist.items().iter().any(|item| {
                item.is_directory
                    && matches!(item.action, SyncAction::UploadNew | SyncAction::DeleteRemote)
            });
        }

        if !checklist.is_empty() {
            terminal.synchronize_apply(&checklist, &self.options.copy_param, params, None)?;
            for item in checklist.items().iter().filter(|item| item.checked) {
                match item.action {
                    SyncAction::UploadNew | SyncAction::UploadUpdate => {
                        self.emit_log(&format!("Uploaded '{}'.", item.local.file_name));
                    }
                    SyncAction::DeleteRemote => {
                        self.emit_log(&format!("Deleted '{}'.", item.remote.file_name));
                    }
                    _ => {}
                }
            }
        }

        if subdirs_changed && !initial {
            self.rewatch();
        }
        Ok(())
    }

    /// Re-census after the set of subdirectories changed; the recursive
    /// watch itself follows new directories automatically.
    fn rewatch(&mut self) {
        self.directories = self.census();
        if !self.negotiate_directory_budget() {
            self.abort(false);
            return;
        }
        self.emit_log(&format!(
            "Watching for changes, {} director{}.",
            self.directories,
            if self.directories == 1 { "y" } else { "ies" }
        ));
    }

    fn census(&self) -> usize {
        if !self.options.recurse {
            return 1;
        }
        WalkDir::new(&self.local_root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .count()
    }

    /// Keep asking the host to raise the ceiling until the census fits.
    fn negotiate_directory_budget(&mut self) -> bool {
        if self.max_directories == 0 {
            return true;
        }
        while self.directories > self.max_directories {
            let mut ceiling = self.max_directories;
            let proceed = self
                .on_too_many_directories
                .as_mut()
                .map(|handler| handler(&mut ceiling))
                .unwrap_or(false);
            if !proceed || ceiling <= self.max_directories {
                return false;
            }
            self.max_directories = ceiling;
        }
        true
    }

    /// Admit a changed directory: the root itself always; a first-level
    /// child when it passes the whitelist and the transfer mask; anything
    /// deeper only in recursive mode.
    fn admit_directory(&self, directory: &Path) -> bool {
        if directory == self.local_root {
            return true;
        }
        if !directory.starts_with(&self.local_root) {
            return false;
        }
        let is_first_level = directory.parent() == Some(self.local_root.as_path());
        if !is_first_level {
            return self.options.recurse;
        }
        let name = match directory.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return false,
        };
        if let Some(filter) = &self.options.filter {
            if !filter.iter().any(|entry| entry.eq_ignore_ascii_case(&name)) {
                return false;
            }
        }
        self.options
            .copy_param
            .allow_transfer(&name, TransferSide::Local, true, MaskParams::default())
    }

    fn abort(&mut self, close: bool) {
        self.stop();
        if let Some(handler) = self.on_abort.as_mut() {
            handler(close);
        }
    }

    fn emit_log(&mut self, message: &str) {
        log::debug!(target: "skiff::monitor", "{message}");
        if let Some(handler) = self.on_log.as_mut() {
            handler(message);
        }
    }
}

impl Drop for MonitorController {
    fn drop(&mut self) {
        self.stop();
    }
}
