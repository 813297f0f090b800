//! The session controller: owns the backend, caches, transaction state,
//! logs, and callbacks, and exposes the user-facing file-session API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use chrono::Utc;

use crate::backend::{
    BackendFactory, DeleteParams, FileProperties, FileSystemBackend, FileSystemInfo, ReactedOp,
    SecureFlavor, SessionInfo, SpaceAvailable, TransferParams, TransportUi,
};
use crate::cache::{DirectoryCache, DirectoryChangeCache};
use crate::capability::Capability;
use crate::config::Configuration;
use crate::copy_param::{mask_file_name, CopyParam, MaskParams, TransferMask, TransferMode};
use crate::error::{SessionError, SessionResult};
use crate::events::{QueryAnswer, QueryKind, QueryRequest, TerminalEvents};
use crate::progress::{
    BatchOverwrite, CancelStatus, OperationKind, OperationProgress, OperationSide,
};
use crate::remote_file::{
    compare_modification, unix_combine, unix_extract_directory, unix_extract_file_name,
    unix_is_child_path, ModificationPrecision, RemoteFile, RemoteFileList,
};
use crate::session::{Protocol, SessionData};
use crate::session_log::{ActionHandle, ActionKind, ActionLog, SessionLog};
use crate::tunnel::{
    make_tunnel_data, select_local_port, PasswordReplay, SessionUi, Tunnel, TunnelDriver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Closed,
    Opening,
    Opened,
    Closing,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReopenOptions {
    /// Keep auto-read-directory off for the duration of the reopen, e.g.
    /// while an operation holds references into the current listing.
    pub no_read_directory: bool,
}

/// Outcome of one retry-looped operation.
pub enum FileOpOutcome<T> {
    Done(T),
    /// The user chose the protocol-specific named retry alternative.
    SpecialRetry,
}

/// Outcome of a bulk per-file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkResult {
    /// Every file succeeded.
    pub success: bool,
    /// The user cancelled mid-way.
    pub cancelled: bool,
}

/// Source/destination facts shown by the overwrite prompt and used by the
/// `Older` batch decision.
#[derive(Debug, Clone, Copy)]
pub struct OverwriteSideInfo {
    pub size: u64,
    pub modification: Option<chrono::DateTime<Utc>>,
    pub precision: ModificationPrecision,
}

pub struct Terminal {
    pub(crate) data: SessionData,
    pub(crate) configuration: Rc<Configuration>,
    pub(crate) factory: Rc<dyn BackendFactory>,
    pub(crate) events: Rc<TerminalEvents>,
    log: Arc<SessionLog>,
    actions: Arc<ActionLog>,

    backend: Option<Box<dyn FileSystemBackend>>,
    fs_flavor: Option<SecureFlavor>,
    status: TerminalStatus,

    files: RemoteFileList,
    current_directory: String,
    directory_cache: DirectoryCache,
    change_cache: Option<DirectoryChangeCache>,
    last_directory_change: Option<(String, String)>,

    in_transaction: u32,
    suspend_transaction: bool,
    read_current_directory_pending: bool,
    read_directory_pending: bool,
    pub(crate) auto_read_directory: bool,
    auto_read_directory_after_op: bool,
    exception_on_fail: u32,

    tunnel: Option<Tunnel>,
    tunnel_error: Option<String>,
    tunnel_opening: Arc<AtomicBool>,
    tunnel_local_port: u16,

    owner_thread: ThreadId,
    guard_active: Cell<bool>,
    deferred_fatal: RefCell<Option<SessionError>>,

    pub(crate) command_session: Option<Box<Terminal>>,
    pub(crate) password_replay: Option<Arc<parking_lot::Mutex<PasswordReplay>>>,
    /// Set on a secondary shell session; it shares the parent's callbacks
    /// except banner display.
    pub(crate) secondary: bool,

    first_open_failure: Option<Instant>,
}

impl Terminal {
    pub fn new(
        data: SessionData,
        configuration: Rc<Configuration>,
        factory: Rc<dyn BackendFactory>,
        events: TerminalEvents,
    ) -> Self {
        Self::with_shared_events(data, configuration, factory, Rc::new(events))
    }

    pub(crate) fn with_shared_events(
        data: SessionData,
        configuration: Rc<Configuration>,
        factory: Rc<dyn BackendFactory>,
        events: Rc<TerminalEvents>,
    ) -> Self {
        let log = SessionLog::new(data.session_name());
        let directory_cache = DirectoryCache::new(configuration.directory_cache_max_size);
        Self {
            data,
            configuration,
            factory,
            events,
            log,
            actions: ActionLog::new(),
            backend: None,
            fs_flavor: None,
            status: TerminalStatus::Closed,
            files: RemoteFileList::new(""),
            current_directory: String::new(),
            directory_cache,
            change_cache: None,
            last_directory_change: None,
            in_transaction: 0,
            suspend_transaction: false,
            read_current_directory_pending: false,
            read_directory_pending: false,
            auto_read_directory: true,
            auto_read_directory_after_op: true,
            exception_on_fail: 0,
            tunnel: None,
            tunnel_error: None,
            tunnel_opening: Arc::new(AtomicBool::new(false)),
            tunnel_local_port: 0,
            owner_thread: thread::current().id(),
            guard_active: Cell::new(false),
            deferred_fatal: RefCell::new(None),
            command_session: None,
            password_replay: None,
            secondary: false,
            first_open_failure: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn status(&self) -> TerminalStatus {
        self.status
    }

    /// A session is active while its backend holds a live connection; the
    /// status field lags behind during the startup conversation.
    pub fn is_active(&self) -> bool {
        self.backend
            .as_ref()
            .map(|backend| backend.is_open())
            .unwrap_or(false)
    }

    pub fn session_data(&self) -> &SessionData {
        &self.data
    }

    pub fn session_data_mut(&mut self) -> &mut SessionData {
        &mut self.data
    }

    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    pub fn actions(&self) -> &Arc<ActionLog> {
        &self.actions
    }

    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    /// The current directory without contacting the server.
    pub fn peek_current_directory(&self) -> &str {
        &self.current_directory
    }

    pub fn files(&self) -> &RemoteFileList {
        &self.files
    }

    pub fn is_capable(&self, capability: Capability) -> bool {
        self.backend
            .as_ref()
            .map(|backend| backend.is_capable(capability))
            .unwrap_or(false)
    }

    pub fn last_tunnel_error(&self) -> Option<&str> {
        self.tunnel_error.as_deref()
    }

    pub fn tunnel_local_port(&self) -> u16 {
        self.tunnel_local_port
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.backend.as_ref().map(|backend| backend.session_info())
    }

    pub fn file_system_info(&mut self, retrieve: bool) -> SessionResult<FileSystemInfo> {
        self.backend_op("error retrieving file system info", |backend| {
            backend.file_system_info(retrieve)
        })
    }

    pub fn file_url(&self, path: &str) -> Option<String> {
        self.backend.as_ref().map(|backend| backend.file_url(path))
    }

    pub fn set_auto_read_directory(&mut self, value: bool) {
        self.auto_read_directory = value;
    }

    pub fn recrypt_passwords(&mut self, recode: &dyn Fn(&str) -> String) {
        self.data.recrypt_passwords(recode);
        if let Some(session) = &mut self.command_session {
            session.recrypt_passwords(recode);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the session. Idempotent when already open. A fatal failure asks
    /// the reopen policy (auto-retry budget, then the user) before giving up.
    pub fn open(&mut self) -> SessionResult<()> {
        if self.is_active() {
            return Ok(());
        }
        loop {
            self.do_information("", true);
            let result = self.try_open();
            self.do_information("", false);
            match result {
                Ok(()) => {
                    self.data.number_of_retries = 0;
                    self.first_open_failure = None;
                    return Ok(());
                }
                Err(err) => {
                    let fatal = if err.is_fatal() {
                        err
                    } else {
                        // Any failure while opening is fatal.
                        self.log.error(format!("Got error: \"{err}\""));
                        SessionError::fatal_with("failed to open session", &err)
                    };
                    self.cleanup_failed_open();
                    if self.query_reopen(&fatal) {
                        continue;
                    }
                    if let Some(hook) = &self.events.on_show_extended_exception {
                        hook(&fatal.extended());
                    }
                    return Err(fatal);
                }
            }
        }
    }

    fn try_open(&mut self) -> SessionResult<()> {
        self.reset_connection();
        self.status = TerminalStatus::Opening;

        let open_result = (|| -> SessionResult<()> {
            if self.backend.is_none() {
                self.log.add_startup_info(&self.data);
            }

            debug_assert!(self.tunnel.is_none());
            if self.data.tunnel.is_some() {
                self.do_information("Opening tunnel...", true);
                self.log.event("Opening tunnel.");
                self.open_tunnel()?;
                self.log.separator();
                self.data.configure_tunnel(self.tunnel_local_port);
                self.do_information("Using tunnel.", false);
                self.log.event(format!(
                    "Connecting via tunnel interface {}:{}.",
                    self.data.host, self.data.port
                ));
            }

            if self.backend.is_none() {
                let backend = self.make_backend()?;
                self.backend = Some(backend);
            } else if let Some(backend) = &mut self.backend {
                backend.open()?;
            }
            Ok(())
        })();

        // The descriptor reverts to the real endpoint whether or not the
        // connection through the forward succeeded.
        if self.data.tunnel.is_some() {
            self.data.rollback_tunnel();
        }
        open_result?;

        if self.data.cache_directory_changes {
            let mut cache =
                DirectoryChangeCache::new(self.configuration.cache_directory_changes_max_size);
            if self.data.preserve_directory_changes {
                if let Some(blob) = self
                    .configuration
                    .load_directory_changes_cache(&self.data.session_key())
                {
                    cache.deserialize(&blob);
                }
            }
            self.change_cache = Some(cache);
        }

        self.do_startup()?;
        self.do_information("Ready", true);
        self.status = TerminalStatus::Opened;
        Ok(())
    }

    fn make_backend(&mut self) -> SessionResult<Box<dyn FileSystemBackend>> {
        let protocol = self.data.protocol;
        match protocol {
            Protocol::Ftp
            | Protocol::Ftps
            | Protocol::WebDav
            | Protocol::WebDavs
            | Protocol::S3
            | Protocol::Shell => {
                let ui = self.make_session_ui(&self.log);
                let mut backend = self.factory.make_backend(protocol, &self.data, ui, &self.log)?;
                backend.open()?;
                self.log.separator();
                self.log
                    .event(format!("Using {} protocol.", protocol.scheme().to_uppercase()));
                Ok(backend)
            }
            Protocol::Sftp | Protocol::Scp => {
                let ui = self.make_session_ui(&self.log);
                let mut transport = self.factory.make_transport(&self.data, ui, &self.log)?;
                if let Err(err) = transport.open() {
                    if !transport.active() && self.tunnel.is_some() {
                        self.close_tunnel();
                        if let Some(tunnel_error) = self.tunnel_error.clone() {
                            return Err(SessionError::fatal(format!(
                                "tunnel failed: {tunnel_error}"
                            )));
                        }
                    }
                    return Err(err);
                }
                self.log.separator();
                let flavor = if protocol == Protocol::Scp || transport.sftp_fallback_requested() {
                    SecureFlavor::Scp
                } else {
                    SecureFlavor::Sftp
                };
                self.log.event(match flavor {
                    SecureFlavor::Scp => "Using SCP protocol.",
                    SecureFlavor::Sftp => "Using SFTP protocol.",
                });
                self.fs_flavor = Some(flavor);
                let mut backend =
                    self.factory
                        .make_secure_backend(flavor, transport, &self.data, &self.log)?;
                backend.open()?;
                Ok(backend)
            }
        }
    }

    fn make_session_ui(&self, log: &Arc<SessionLog>) -> Arc<dyn TransportUi> {
        let mut prompts = self.events.transport.clone();
        if self.secondary {
            // The secondary shell session must not re-fire the host banner.
            prompts.banner = None;
        }
        Arc::new(SessionUi::new(
            self.owner_thread,
            prompts,
            Arc::clone(log),
            Arc::clone(&self.tunnel_opening),
            self.password_replay.clone(),
        ))
    }

    fn do_startup(&mut self) -> SessionResult<()> {
        self.log.event("Doing startup conversation with host.");
        self.begin_transaction();
        let result = (|| -> SessionResult<()> {
            if self.is_capable(Capability::UserGroupListing) {
                if let Err(err) =
                    self.backend_op("error looking up users and groups", |backend| {
                        backend.lookup_users_groups()
                    })
                {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    self.log.error(format!("Error looking up users and groups: {err}"));
                }
            }
            if let Some(directory) = self.data.remote_directory.clone() {
                self.change_directory(&directory)?;
            } else {
                self.read_current_directory()?;
            }
            Ok(())
        })();
        let flushed = self.end_transaction();
        result?;
        flushed
    }

    fn reset_connection(&mut self) {
        self.tunnel_error = None;
        self.change_cache = None;
        self.last_directory_change = None;
        self.files = RemoteFileList::new("");
        self.current_directory.clear();
    }

    fn cleanup_failed_open(&mut self) {
        if let Some(backend) = &mut self.backend {
            backend.close();
        }
        self.backend = None;
        self.fs_flavor = None;
        if self.tunnel.is_some() {
            self.close_tunnel();
        }
        self.change_cache = None;
        self.status = TerminalStatus::Closed;
    }

    /// Ask whether to retry the open: auto-answer while the retry budget
    /// lasts, then consult the user.
    fn query_reopen(&mut self, err: &SessionError) -> bool {
        self.data.number_of_retries += 1;
        let first = *self.first_open_failure.get_or_insert_with(Instant::now);

        let auto = self.configuration.session_reopen_auto;
        if !auto.is_zero()
            && self.data.number_of_retries <= self.configuration.session_reopen_auto_max_retries
            && first.elapsed() < auto
        {
            self.log.event(format!(
                "Connection attempt {} failed, retrying automatically.",
                self.data.number_of_retries
            ));
            return true;
        }

        let request = QueryRequest::new(
            QueryKind::Error,
            "The session was terminated. Reconnect?",
            vec![QueryAnswer::Retry, QueryAnswer::Abort],
        )
        .with_detail(err.to_string());
        matches!(self.query_user(&request), Ok(QueryAnswer::Retry | QueryAnswer::Yes))
    }

    /// Close and open again, preserving volatile controller state around the
    /// cycle.
    pub fn reopen(&mut self, options: ReopenOptions) -> SessionResult<()> {
        let orig_protocol = self.data.protocol;
        let prev_remote_directory = self.data.remote_directory.clone();
        let prev_cwd_pending = self.read_current_directory_pending;
        let prev_dir_pending = self.read_directory_pending;
        let prev_auto_read = self.auto_read_directory;
        let prev_exception_on_fail = self.exception_on_fail;
        debug_assert!(!self.suspend_transaction);

        self.read_current_directory_pending = false;
        self.read_directory_pending = false;
        self.suspend_transaction = true;
        self.exception_on_fail = 0;
        if options.no_read_directory {
            self.auto_read_directory = false;
        }

        // Only peek; we may not be connected at all, so never trigger a
        // round trip for the current directory here.
        let peeked = self.peek_current_directory().to_string();
        if !peeked.is_empty() {
            self.data.remote_directory = Some(peeked);
        }
        if self.data.protocol == Protocol::Sftp && self.fs_flavor == Some(SecureFlavor::Scp) {
            self.data.protocol = Protocol::Scp;
        }

        let result = (|| -> SessionResult<()> {
            if self.is_active() {
                self.close();
            }
            self.open()
        })();

        self.data.remote_directory = prev_remote_directory;
        self.data.protocol = orig_protocol;
        self.auto_read_directory = prev_auto_read;
        self.read_current_directory_pending = prev_cwd_pending;
        self.read_directory_pending = prev_dir_pending;
        self.suspend_transaction = false;
        self.exception_on_fail = prev_exception_on_fail;
        result
    }

    pub fn close(&mut self) {
        if self.status == TerminalStatus::Closed {
            return;
        }
        self.status = TerminalStatus::Closing;
        if let Some(backend) = &mut self.backend {
            backend.close();
        }
        if let Some(session) = &mut self.command_session {
            if session.is_active() {
                session.close();
            }
        }
        self.flush_directory_changes_cache();
        self.closed();
    }

    fn closed(&mut self) {
        if self.tunnel.is_some() {
            self.close_tunnel();
        }
        if let Some(hook) = &self.events.on_close {
            hook();
        }
        self.status = TerminalStatus::Closed;
    }

    fn flush_directory_changes_cache(&mut self) {
        if self.data.preserve_directory_changes {
            if let Some(cache) = &self.change_cache {
                self.configuration
                    .save_directory_changes_cache(&self.data.session_key(), &cache.serialize());
            }
        }
    }

    /// Pump keepalive IO on the backend.
    pub fn idle(&mut self) -> SessionResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.backend_op("error in keepalive", |backend| backend.idle())
    }

    // ------------------------------------------------------------------
    // Tunnel
    // ------------------------------------------------------------------

    fn open_tunnel(&mut self) -> SessionResult<()> {
        let options = self
            .data
            .tunnel
            .clone()
            .ok_or_else(|| SessionError::fatal("descriptor does not request a tunnel"))?;
        let local_port = select_local_port(&options, &self.configuration, &self.log)?;
        self.tunnel_local_port = local_port;

        let result = (|| -> SessionResult<()> {
            let tunnel_data = make_tunnel_data(&self.data, local_port)?;
            let tunnel_log = SessionLog::child("Tunnel", Arc::clone(&self.log));
            let ui = self.make_session_ui(&tunnel_log);
            let mut transport = self.factory.make_transport(&tunnel_data, ui, &tunnel_log)?;

            self.tunnel_opening.store(true, Ordering::SeqCst);
            let opened = transport.open();
            self.tunnel_opening.store(false, Ordering::SeqCst);
            opened?;

            let driver = TunnelDriver::spawn(transport);
            self.tunnel = Some(Tunnel::new(tunnel_data, tunnel_log, local_port, driver));
            Ok(())
        })();

        if result.is_err() {
            self.close_tunnel();
        }
        result
    }

    fn close_tunnel(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            self.tunnel_error = tunnel.close();
        }
        self.tunnel_local_port = 0;
    }

    // ------------------------------------------------------------------
    // Callbacks & guard
    // ------------------------------------------------------------------

    fn do_information(&self, message: &str, status: bool) {
        if let Some(hook) = &self.events.on_information {
            hook(message, status);
        }
    }

    /// Run a host callback under the re-entrancy guard: a fatal raised by
    /// re-entered core code is deferred and re-raised here, while the
    /// callback itself unwinds with a silent abort.
    fn with_guard<R>(&self, f: impl FnOnce() -> R) -> SessionResult<R> {
        if self.guard_active.get() {
            return Ok(f());
        }
        self.guard_active.set(true);
        let value = f();
        self.guard_active.set(false);
        match self.deferred_fatal.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    /// Route a fatal through the guard protocol: while a callback is on the
    /// stack the error is parked and a silent abort unwinds instead.
    pub(crate) fn fatal(&self, err: SessionError) -> SessionError {
        debug_assert!(err.is_fatal());
        if self.guard_active.get() {
            *self.deferred_fatal.borrow_mut() = Some(err);
            SessionError::Abort
        } else {
            err
        }
    }

    pub(crate) fn query_user(&self, request: &QueryRequest) -> SessionResult<QueryAnswer> {
        match &self.events.on_query_user {
            Some(hook) => self.with_guard(|| hook(request)),
            None => Ok(QueryAnswer::Abort),
        }
    }

    fn notify_progress(&self, progress: &OperationProgress) {
        if let Some(hook) = &self.events.on_progress {
            hook(progress);
        }
    }

    fn notify_finished(&self, kind: OperationKind, side: OperationSide, path: &str) {
        if let Some(hook) = &self.events.on_finished {
            hook(kind, side, path);
        }
    }

    fn announce_read_directory(&self, begin: bool) {
        if let Some(hook) = &self.events.on_read_directory {
            hook(begin);
        }
    }

    fn announce_directory_changed(&self) {
        if let Some(hook) = &self.events.on_change_directory {
            hook(&self.current_directory);
        }
    }

    // ------------------------------------------------------------------
    // Backend dispatch & error wrapping
    // ------------------------------------------------------------------

    fn backend_op<T>(
        &mut self,
        message: &str,
        f: impl FnOnce(&mut dyn FileSystemBackend) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let result = {
            let backend = self
                .backend
                .as_deref_mut()
                .ok_or_else(|| SessionError::fatal("session is not connected"))?;
            f(backend)
        };
        result.map_err(|err| self.wrap_command(message, err))
    }

    fn wrap_command(&self, message: &str, err: SessionError) -> SessionError {
        match err {
            SessionError::Fatal(_) => self.fatal(err),
            SessionError::Abort | SessionError::SkipFile { .. } => err,
            other => SessionError::command_with(message, eyre::Report::new(other)),
        }
    }

    /// Run a block with command errors surfacing to the caller unchanged
    /// instead of entering the retry loop.
    pub fn with_exception_on_fail<T>(
        &mut self,
        f: impl FnOnce(&mut Terminal) -> SessionResult<T>,
    ) -> SessionResult<T> {
        self.exception_on_fail += 1;
        let result = f(self);
        self.exception_on_fail -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Retry loop
    // ------------------------------------------------------------------

    pub(crate) fn file_operation_loop_ex<T>(
        &mut self,
        progress: &mut OperationProgress,
        message: &str,
        allow_skip: bool,
        special_retry: Option<&str>,
        mut op: impl FnMut(&mut Terminal) -> SessionResult<T>,
    ) -> SessionResult<FileOpOutcome<T>> {
        loop {
            match op(self) {
                Ok(value) => return Ok(FileOpOutcome::Done(value)),
                Err(err) if err.is_fatal() || err.is_abort() || err.is_skip() => return Err(err),
                Err(err) => {
                    if self.exception_on_fail > 0 {
                        return Err(self.wrap_command(message, err));
                    }
                    match self.file_operation_loop_query(
                        err,
                        progress,
                        message,
                        allow_skip,
                        special_retry,
                    )? {
                        QueryAnswer::Retry => continue,
                        QueryAnswer::SpecialRetry => return Ok(FileOpOutcome::SpecialRetry),
                        _ => unreachable!("loop query returns only retry answers"),
                    }
                }
            }
        }
    }

    pub(crate) fn file_operation_loop<T>(
        &mut self,
        progress: &mut OperationProgress,
        message: &str,
        allow_skip: bool,
        op: impl FnMut(&mut Terminal) -> SessionResult<T>,
    ) -> SessionResult<T> {
        match self.file_operation_loop_ex(progress, message, allow_skip, None, op)? {
            FileOpOutcome::Done(value) => Ok(value),
            FileOpOutcome::SpecialRetry => {
                unreachable!("special retry offered without a named alternative")
            }
        }
    }

    fn file_operation_loop_query(
        &mut self,
        err: SessionError,
        progress: &mut OperationProgress,
        message: &str,
        allow_skip: bool,
        special_retry: Option<&str>,
    ) -> SessionResult<QueryAnswer> {
        self.log.error(format!("{message} ({err})"));

        let mut answer = if allow_skip && progress.skip_to_all {
            QueryAnswer::Skip
        } else {
            let mut answers = vec![QueryAnswer::Retry, QueryAnswer::Abort];
            if allow_skip {
                answers.push(QueryAnswer::Skip);
                answers.push(QueryAnswer::SkipAll);
            }
            if special_retry.is_some() {
                answers.push(QueryAnswer::SpecialRetry);
            }
            let request = QueryRequest::new(QueryKind::Error, message, answers)
                .with_detail(err.to_string());
            progress.suspend();
            let asked = self.query_user(&request);
            progress.resume();
            asked?
        };

        if answer == QueryAnswer::SkipAll {
            progress.skip_to_all = true;
            answer = QueryAnswer::Skip;
        }

        match answer {
            QueryAnswer::Retry => Ok(QueryAnswer::Retry),
            QueryAnswer::SpecialRetry => Ok(QueryAnswer::SpecialRetry),
            other => {
                if other == QueryAnswer::Abort {
                    progress.request_cancel(CancelStatus::Cancel);
                }
                if allow_skip {
                    Err(SessionError::skip(message))
                } else {
                    Err(SessionError::command_with(
                        message.to_string(),
                        eyre::Report::new(err),
                    ))
                }
            }
        }
    }

    fn finish_action<T>(&self, action: ActionHandle, result: &SessionResult<T>) {
        match result {
            Ok(_) => action.commit(),
            Err(err) if err.is_skip() => action.cancel(),
            Err(err) => action.rollback(err),
        }
    }

    // ------------------------------------------------------------------
    // Transactions & cache reactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self) {
        if self.in_transaction == 0 && !self.suspend_transaction {
            self.read_current_directory_pending = false;
            self.read_directory_pending = false;
        }
        self.in_transaction += 1;
        if let Some(session) = &mut self.command_session {
            if session.is_active() {
                session.begin_transaction();
            }
        }
    }

    pub fn end_transaction(&mut self) -> SessionResult<()> {
        debug_assert!(self.in_transaction > 0, "unbalanced transaction end");
        self.in_transaction = self.in_transaction.saturating_sub(1);
        if let Some(session) = &mut self.command_session {
            if session.is_active() {
                let _ = session.end_transaction();
            }
        }
        if self.in_transaction > 0 {
            return Ok(());
        }
        // Take the flags first so they are relinquished even when a reload
        // fails or the session died mid-transaction.
        let cwd_pending = std::mem::take(&mut self.read_current_directory_pending);
        let dir_pending = std::mem::take(&mut self.read_directory_pending);
        if !self.is_active() || self.suspend_transaction {
            return Ok(());
        }
        if cwd_pending {
            self.read_current_directory()?;
        }
        if dir_pending {
            self.read_directory(true, false)?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction > 0
    }

    pub(crate) fn react_on_command(&mut self, op: ReactedOp) {
        let (reread_cwd, reread_dir) = match op {
            ReactedOp::ChangeDirectory | ReactedOp::HomeDirectory => {
                (true, self.auto_read_directory)
            }
            ReactedOp::CachedChangeDirectory => (false, self.auto_read_directory),
            ReactedOp::AnyCommand => (true, self.auto_read_directory),
            ReactedOp::Delete
            | ReactedOp::Rename
            | ReactedOp::Move
            | ReactedOp::Copy
            | ReactedOp::MakeDirectory
            | ReactedOp::MakeLink
            | ReactedOp::ChangeProperties => {
                (false, self.auto_read_directory && self.auto_read_directory_after_op)
            }
        };
        if self.in_transaction > 0 {
            self.read_current_directory_pending |= reread_cwd;
            self.read_directory_pending |= reread_dir;
        } else {
            if reread_cwd {
                if let Err(err) = self.read_current_directory() {
                    self.log.error(format!("Error rereading current directory: {err}"));
                }
            }
            if reread_dir {
                if let Err(err) = self.read_directory(true, false) {
                    self.log.error(format!("Error rereading directory: {err}"));
                }
            }
        }
    }

    /// Invalidate cached state around a mutated path: the direct parent
    /// always; the path's own subtree when it is a directory.
    pub(crate) fn file_modified(&mut self, file_name: &str, is_directory: bool) {
        let parent = unix_extract_directory(file_name);
        if !parent.is_empty() {
            self.directory_cache.clear_file_list(&parent, false);
        }
        if is_directory {
            self.directory_cache.clear_file_list(file_name, true);
            if let Some(cache) = &mut self.change_cache {
                cache.directory_modified(file_name);
            }
        }
    }

    pub fn directory_modified(&mut self, path: &str, sub_dirs: bool) {
        self.directory_cache.clear_file_list(path, sub_dirs);
        if let Some(cache) = &mut self.change_cache {
            cache.directory_modified(path);
        }
    }

    pub fn clear_caches(&mut self) {
        self.directory_cache.clear();
        if let Some(cache) = &mut self.change_cache {
            cache.clear();
        }
    }

    // ------------------------------------------------------------------
    // Directory reading & navigation
    // ------------------------------------------------------------------

    pub fn read_current_directory(&mut self) -> SessionResult<()> {
        let old = self.current_directory.clone();
        let new = self.backend_op("error getting name of current remote directory", |backend| {
            backend.current_directory()
        })?;
        self.current_directory = new.clone();
        if let Some((from, requested)) = self.last_directory_change.take() {
            if let Some(cache) = &mut self.change_cache {
                if !requested.is_empty() && new != from {
                    cache.add_directory_change(&from, &requested, &new);
                }
            }
        }
        if old != new {
            self.announce_directory_changed();
        }
        Ok(())
    }

    /// Read the current directory listing. With `reload_only` the cache is
    /// bypassed (a fresh copy is wanted); `force_cache` accepts a cached
    /// listing unconditionally.
    pub fn read_directory(&mut self, reload_only: bool, force_cache: bool) -> SessionResult<()> {
        if self.data.cache_directories && (force_cache || !reload_only) {
            if let Some(list) = self
                .directory_cache
                .get_file_list(&self.current_directory, None)
            {
                self.log.event(format!(
                    "Directory content loaded from cache for '{}'.",
                    self.current_directory
                ));
                self.files = list;
                self.announce_read_directory(false);
                return Ok(());
            }
        }
        self.do_read_directory()
    }

    fn do_read_directory(&mut self) -> SessionResult<()> {
        self.announce_read_directory(true);
        let mut list = RemoteFileList::new(self.current_directory.clone());
        let result = self.backend_op("error listing directory", |backend| {
            backend.read_directory(&mut list)
        });
        match result {
            Ok(()) => {
                if let Some(hook) = &self.events.on_read_directory_progress {
                    hook(list.len());
                }
                if self.data.cache_directories {
                    self.directory_cache.add_file_list(list.clone());
                }
                self.files = list;
                self.announce_read_directory(false);
                Ok(())
            }
            Err(err) => {
                self.announce_read_directory(false);
                Err(err)
            }
        }
    }

    /// Read a listing for an arbitrary directory, optionally serving it from
    /// the cache; the current listing is left untouched.
    pub fn custom_read_directory(
        &mut self,
        directory: &str,
        use_cache: bool,
    ) -> SessionResult<RemoteFileList> {
        if use_cache && self.data.cache_directories {
            if let Some(list) = self.directory_cache.get_file_list(directory, None) {
                return Ok(list);
            }
        }
        let mut list = RemoteFileList::new(directory);
        self.backend_op("error listing directory", |backend| {
            backend.read_directory(&mut list)
        })?;
        if self.data.cache_directories {
            self.directory_cache.add_file_list(list.clone());
        }
        Ok(list)
    }

    /// Retrieve a listing without a round trip when possible: the in-memory
    /// current listing, then the cache, then (when `can_load`) the wire.
    pub fn directory_file_list(
        &mut self,
        path: &str,
        can_load: bool,
    ) -> SessionResult<Option<RemoteFileList>> {
        if self.current_directory == crate::remote_file::unix_exclude_trailing_slash(path) {
            return Ok(Some(self.files.clone()));
        }
        if let Some(list) = self.directory_cache.get_file_list(path, None) {
            return Ok(Some(list));
        }
        if can_load {
            return self.custom_read_directory(path, false).map(Some);
        }
        Ok(None)
    }

    pub fn change_directory(&mut self, directory: &str) -> SessionResult<()> {
        let cached = self
            .change_cache
            .as_mut()
            .and_then(|cache| cache.get_directory_change(&self.current_directory, directory));
        let from = self.current_directory.clone();
        match cached {
            Some(resolved) => {
                self.log.event(format!(
                    "Cached directory change via '{directory}' to '{resolved}'."
                ));
                self.backend_op("error changing directory", |backend| {
                    backend.cached_change_directory(&resolved)
                })?;
                self.current_directory = resolved;
                self.last_directory_change = None;
                self.react_on_command(ReactedOp::CachedChangeDirectory);
                self.announce_directory_changed();
            }
            None => {
                self.log.event(format!("Changing directory to '{directory}'."));
                self.backend_op("error changing directory", |backend| {
                    backend.change_directory(directory)
                })?;
                self.last_directory_change = Some((from, directory.to_string()));
                self.react_on_command(ReactedOp::ChangeDirectory);
            }
        }
        Ok(())
    }

    pub fn home_directory(&mut self) -> SessionResult<()> {
        self.backend_op("error changing to home directory", |backend| {
            backend.home_directory()
        })?;
        self.last_directory_change = None;
        self.react_on_command(ReactedOp::HomeDirectory);
        Ok(())
    }

    pub fn absolute_path(&mut self, path: &str) -> SessionResult<String> {
        self.backend_op("error resolving path", |backend| {
            backend.absolute_path(path, false)
        })
    }

    // ------------------------------------------------------------------
    // Single-file queries
    // ------------------------------------------------------------------

    pub fn read_file(&mut self, path: &str) -> SessionResult<RemoteFile> {
        let message = format!("error retrieving file info for '{path}'");
        self.backend_op(&message, |backend| backend.read_file(path))
    }

    pub fn read_symlink(&mut self, link: &RemoteFile) -> SessionResult<RemoteFile> {
        if !self.is_capable(Capability::ResolveSymlink) {
            return Err(SessionError::command(
                "resolving symbolic links is not supported by this session",
            ));
        }
        let message = format!("error resolving symlink '{}'", link.name);
        self.backend_op(&message, |backend| backend.read_symlink(link))
    }

    /// Probe existence without raising a command error.
    pub fn file_exists(&mut self, path: &str) -> SessionResult<bool> {
        let result = self.with_exception_on_fail(|terminal| terminal.read_file(path));
        match result {
            Ok(_) => Ok(true),
            Err(err) if err.is_fatal() || err.is_abort() => Err(err),
            Err(_) => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Bulk machinery
    // ------------------------------------------------------------------

    /// Drive `op` over `files` under one progress object and transaction.
    /// Skip-file errors mark the batch unsuccessful and continue; anything
    /// else aborts.
    pub fn process_files(
        &mut self,
        files: &[RemoteFile],
        operation: OperationKind,
        side: OperationSide,
        mut op: impl FnMut(&mut Terminal, &RemoteFile, &mut OperationProgress) -> SessionResult<()>,
    ) -> SessionResult<BulkResult> {
        let mut progress = OperationProgress::new(operation, side);
        progress.start(files.len(), files.iter().map(|f| f.size).sum());
        self.notify_progress(&progress);

        let mut success = true;
        self.begin_transaction();
        let result = (|| -> SessionResult<()> {
            for file in files {
                if progress.is_cancelled() {
                    success = false;
                    break;
                }
                progress.set_file(file.full_name());
                self.notify_progress(&progress);
                match op(self, file, &mut progress) {
                    Ok(()) => self.notify_finished(operation, side, &file.full_name()),
                    Err(err) if err.is_skip() => {
                        success = false;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })();
        let flushed = self.end_transaction();
        result?;
        flushed?;
        Ok(BulkResult {
            success: success && !progress.is_cancelled(),
            cancelled: progress.is_cancelled(),
        })
    }

    pub(crate) fn temporary_transfer_file(&self, name: &str) -> bool {
        self.backend
            .as_ref()
            .map(|backend| backend.temporary_transfer_file(name))
            .unwrap_or(false)
    }

    /// Apply `f` to every entry of `directory` (dot entries excluded).
    pub fn process_directory(
        &mut self,
        directory: &str,
        use_cache: bool,
        f: &mut dyn FnMut(&mut Terminal, &RemoteFile) -> SessionResult<()>,
    ) -> SessionResult<()> {
        let list = self.custom_read_directory(directory, use_cache)?;
        for file in list.files() {
            if file.is_this_directory() || file.is_parent_directory() {
                continue;
            }
            f(self, file)?;
        }
        Ok(())
    }

    /// Masked recursive find with host-driven cancellation.
    pub fn files_find(
        &mut self,
        directory: &str,
        mask: &mut TransferMask,
        on_file: &mut dyn FnMut(&RemoteFile) -> bool,
    ) -> SessionResult<()> {
        let mut cancelled = false;
        self.do_files_find(directory, mask, on_file, &mut cancelled)
    }

    fn do_files_find(
        &mut self,
        directory: &str,
        mask: &mut TransferMask,
        on_file: &mut dyn FnMut(&RemoteFile) -> bool,
        cancelled: &mut bool,
    ) -> SessionResult<()> {
        let list = self.custom_read_directory(directory, false)?;
        for file in list.files() {
            if *cancelled {
                return Ok(());
            }
            if file.is_this_directory() || file.is_parent_directory() {
                continue;
            }
            if let Some(hook) = &self.events.on_finding_file {
                if !hook(file) {
                    *cancelled = true;
                    return Ok(());
                }
            }
            if mask.allows(&file.name, file.is_directory(), MaskParams { size: file.size }) {
                if !on_file(file) {
                    *cancelled = true;
                    return Ok(());
                }
            }
            if file.is_directory() && !file.is_symlink() {
                self.do_files_find(&file.full_name(), mask, on_file, cancelled)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutating operations
    // ------------------------------------------------------------------

    pub fn delete_files(
        &mut self,
        files: &[RemoteFile],
        params: DeleteParams,
    ) -> SessionResult<BulkResult> {
        self.process_files(
            files,
            OperationKind::Delete,
            OperationSide::Remote,
            move |terminal, file, progress| {
                terminal.delete_file(&file.full_name(), Some(file), params, progress)
            },
        )
    }

    pub fn delete_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        params: DeleteParams,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        let file_name = self.absolute_path(file_name)?;
        let recycle_path = self.data.recycle_bin_path.clone().unwrap_or_default();
        let use_recycle = self.data.delete_to_recycle
            && !params.force
            && !recycle_path.is_empty()
            && !unix_is_child_path(&recycle_path, &file_name);
        if use_recycle {
            return self.recycle_file(&file_name, file, progress);
        }

        let is_directory = file.map(|f| f.is_directory()).unwrap_or(false);
        let action = self.actions.begin(ActionKind::Delete, &file_name);
        self.file_modified(&file_name, is_directory);
        let message = format!("error deleting file '{file_name}'");
        let result = self.file_operation_loop(progress, &message, true, |terminal| {
            terminal.backend_op(&message, |backend| {
                backend.delete_file(&file_name, file, params)
            })
        });
        self.finish_action(action, &result);
        result?;
        self.react_on_command(ReactedOp::Delete);
        Ok(())
    }

    /// Delete by renaming into the recycle path with a timestamped suffix.
    fn recycle_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        let recycle_path = self.data.recycle_bin_path.clone().unwrap_or_default();
        self.log.event(format!(
            "Moving file \"{file_name}\" to remote recycle bin '{recycle_path}'."
        ));
        let mask = format!("*-{}.*", Utc::now().format("%Y%m%d-%H%M%S"));
        self.move_file(file_name, file, &recycle_path, &mask, progress)
    }

    pub fn rename_file(
        &mut self,
        file: &RemoteFile,
        new_name: &str,
        check_existence: bool,
    ) -> SessionResult<()> {
        if new_name == file.name {
            return Ok(());
        }
        if check_existence && self.files.find(new_name).is_some() {
            let request = QueryRequest::new(
                QueryKind::Confirmation,
                format!("File '{new_name}' already exists. Overwrite?"),
                vec![QueryAnswer::Yes, QueryAnswer::No],
            );
            if self.query_user(&request)? != QueryAnswer::Yes {
                return Ok(());
            }
        }
        let source = file.full_name();
        let target = unix_combine(&file.directory, new_name);
        let mut progress = OperationProgress::new(OperationKind::Move, OperationSide::Remote);
        progress.start(1, 0);
        self.do_rename_file(&source, file.is_directory(), &target, &mut progress)
    }

    fn do_rename_file(
        &mut self,
        source: &str,
        source_is_directory: bool,
        target: &str,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        let action = self.actions.begin(ActionKind::Rename, source);
        action.destination(target);
        self.file_modified(source, source_is_directory);
        self.file_modified(target, false);
        let message = format!("error renaming file '{source}' to '{target}'");
        let result = self.file_operation_loop(progress, &message, true, |terminal| {
            terminal.backend_op(&message, |backend| backend.rename_file(source, target))
        });
        self.finish_action(action, &result);
        result?;
        self.react_on_command(ReactedOp::Rename);
        Ok(())
    }

    /// Move one file into `target` directory, rewriting its name through
    /// `mask`.
    pub fn move_file(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        target: &str,
        mask: &str,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        let name = unix_extract_file_name(file_name);
        let new_name = unix_combine(target, &mask_file_name(name, mask));
        let is_directory = file.map(|f| f.is_directory()).unwrap_or(false);
        self.do_rename_file(file_name, is_directory, &new_name, progress)
    }

    pub fn move_files(
        &mut self,
        files: &[RemoteFile],
        target: &str,
        mask: &str,
    ) -> SessionResult<BulkResult> {
        let target = target.to_string();
        let mask = mask.to_string();
        self.process_files(
            files,
            OperationKind::Move,
            OperationSide::Remote,
            move |terminal, file, progress| {
                terminal.move_file(&file.full_name(), Some(file), &target, &mask, progress)
            },
        )
    }

    /// Remote-side copy, falling back to the secondary shell session when
    /// the backend cannot copy by itself.
    pub fn copy_file(
        &mut self,
        file_name: &str,
        _file: Option<&RemoteFile>,
        target: &str,
        mask: &str,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        let name = unix_extract_file_name(file_name);
        let new_name = unix_combine(target, &mask_file_name(name, mask));
        let action = self.actions.begin(ActionKind::Copy, file_name);
        action.destination(&new_name);
        self.file_modified(&new_name, false);
        let message = format!("error copying file '{file_name}' to '{new_name}'");

        let result = if self.is_capable(Capability::RemoteCopy) {
            self.file_operation_loop(progress, &message, true, |terminal| {
                terminal.backend_op(&message, |backend| {
                    backend.copy_file(file_name, &new_name)
                })
            })
        } else if self.is_capable(Capability::SecondaryShell) {
            let command = format!("cp -p -R \"{file_name}\" \"{new_name}\"");
            self.command_session()
                .and_then(|session| session.any_command(&command, &mut |_| {}))
                .map_err(|err| match err {
                    SessionError::Fatal(_) => err,
                    other => SessionError::command_with(message.clone(), eyre::Report::new(other)),
                })
        } else {
            Err(SessionError::command(
                "copying files on the server is not supported by this session",
            ))
        };
        self.finish_action(action, &result);
        result?;
        self.react_on_command(ReactedOp::Copy);
        Ok(())
    }

    pub fn copy_files(
        &mut self,
        files: &[RemoteFile],
        target: &str,
        mask: &str,
    ) -> SessionResult<BulkResult> {
        let target = target.to_string();
        let mask = mask.to_string();
        self.process_files(
            files,
            OperationKind::Copy,
            OperationSide::Remote,
            move |terminal, file, progress| {
                terminal.copy_file(&file.full_name(), Some(file), &target, &mask, progress)
            },
        )
    }

    pub fn create_directory(&mut self, path: &str) -> SessionResult<()> {
        let path = self.absolute_path(path)?;
        let action = self.actions.begin(ActionKind::MakeDirectory, &path);
        self.file_modified(&path, true);
        let mut progress = OperationProgress::new(OperationKind::Copy, OperationSide::Remote);
        let message = format!("error creating directory '{path}'");
        let result = self.file_operation_loop(&mut progress, &message, true, |terminal| {
            terminal.backend_op(&message, |backend| backend.create_directory(&path))
        });
        self.finish_action(action, &result);
        result?;
        self.react_on_command(ReactedOp::MakeDirectory);
        Ok(())
    }

    pub fn create_link(&mut self, path: &str, target: &str, symbolic: bool) -> SessionResult<()> {
        let required = if symbolic {
            Capability::SymbolicLink
        } else {
            Capability::HardLink
        };
        if !self.is_capable(required) {
            return Err(SessionError::command(
                "creating links is not supported by this session",
            ));
        }
        let path = self.absolute_path(path)?;
        let action = self.actions.begin(ActionKind::MakeLink, &path);
        action.destination(target);
        self.file_modified(&path, false);
        let mut progress = OperationProgress::new(OperationKind::Copy, OperationSide::Remote);
        let message = format!("error creating link '{path}'");
        let result = self.file_operation_loop(&mut progress, &message, true, |terminal| {
            terminal.backend_op(&message, |backend| {
                backend.create_link(&path, target, symbolic)
            })
        });
        self.finish_action(action, &result);
        result?;
        self.react_on_command(ReactedOp::MakeLink);
        Ok(())
    }

    pub fn change_file_properties(
        &mut self,
        file_name: &str,
        file: Option<&RemoteFile>,
        properties: &FileProperties,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        let file_name = self.absolute_path(file_name)?;
        let is_directory = file.map(|f| f.is_directory()).unwrap_or(false);
        let action = self.actions.begin(ActionKind::ChangeProperties, &file_name);
        self.file_modified(&file_name, is_directory);
        let message = format!("error changing properties of '{file_name}'");
        let result = self.file_operation_loop(progress, &message, true, |terminal| {
            terminal.backend_op(&message, |backend| {
                backend.change_file_properties(&file_name, file, properties)
            })
        });
        self.finish_action(action, &result);
        result?;
        self.react_on_command(ReactedOp::ChangeProperties);
        Ok(())
    }

    pub fn change_files_properties(
        &mut self,
        files: &[RemoteFile],
        properties: &FileProperties,
    ) -> SessionResult<BulkResult> {
        let properties = properties.clone();
        self.process_files(
            files,
            OperationKind::SetProperties,
            OperationSide::Remote,
            move |terminal, file, progress| {
                terminal.change_file_properties(&file.full_name(), Some(file), &properties, progress)
            },
        )
    }

    pub fn calculate_files_size(&mut self, files: &[RemoteFile]) -> SessionResult<(u64, bool)> {
        let total = Rc::new(Cell::new(0u64));
        let sum = Rc::clone(&total);
        let result = self.process_files(
            files,
            OperationKind::CalculateSize,
            OperationSide::Remote,
            move |terminal, file, progress| {
                let size = terminal.do_calculate_file_size(file, progress)?;
                sum.set(sum.get() + size);
                Ok(())
            },
        )?;
        Ok((total.get(), result.success))
    }

    fn do_calculate_file_size(
        &mut self,
        file: &RemoteFile,
        progress: &mut OperationProgress,
    ) -> SessionResult<u64> {
        if file.is_directory() && !file.is_symlink() {
            self.do_calculate_directory_size(&file.full_name(), progress)
        } else {
            Ok(file.size)
        }
    }

    fn do_calculate_directory_size(
        &mut self,
        directory: &str,
        progress: &mut OperationProgress,
    ) -> SessionResult<u64> {
        let list = self.custom_read_directory(directory, false)?;
        let mut total = 0u64;
        for file in list.files() {
            if progress.is_cancelled() {
                break;
            }
            if file.is_this_directory() || file.is_parent_directory() {
                continue;
            }
            if file.is_directory() && !file.is_symlink() {
                total += self.do_calculate_directory_size(&file.full_name(), progress)?;
            } else {
                total += file.size;
            }
        }
        Ok(total)
    }

    pub fn calculate_files_checksum(
        &mut self,
        algorithm: &str,
        files: &[RemoteFile],
    ) -> SessionResult<Vec<String>> {
        if !self.is_capable(Capability::CalculatingChecksum) {
            return Err(SessionError::command(
                "calculating checksums is not supported by this session",
            ));
        }
        let message = format!("error calculating {algorithm} checksum");
        let checksums =
            self.backend_op(&message, |backend| backend.calculate_files_checksum(algorithm, files))?;
        if let Some(hook) = &self.events.on_calculated_checksum {
            for (file, checksum) in files.iter().zip(checksums.iter()) {
                hook(&file.name, checksum);
            }
        }
        Ok(checksums)
    }

    pub fn space_available(&mut self, path: &str) -> SessionResult<SpaceAvailable> {
        if !self.is_capable(Capability::CheckingSpaceAvailable) {
            return Err(SessionError::command(
                "querying available space is not supported by this session",
            ));
        }
        let message = format!("error querying space available for '{path}'");
        self.backend_op(&message, |backend| backend.space_available(path))
    }

    /// Run an arbitrary command, dispatching to the secondary shell session
    /// when the backend cannot execute commands itself.
    pub fn any_command(
        &mut self,
        command: &str,
        output: &mut dyn FnMut(&str),
    ) -> SessionResult<()> {
        if self.is_capable(Capability::AnyCommand) {
            let action = self.actions.begin(ActionKind::CustomCommand, command);
            let message = "error executing command".to_string();
            let result = self.backend_op(&message, |backend| backend.any_command(command, output));
            self.finish_action(action, &result);
            result?;
            self.react_on_command(ReactedOp::AnyCommand);
            Ok(())
        } else if self.is_capable(Capability::SecondaryShell) {
            let cwd = self.current_directory.clone();
            let session = self.command_session()?;
            if !cwd.is_empty() {
                session.change_directory(&cwd)?;
            }
            session.any_command(command, output)?;
            self.react_on_command(ReactedOp::AnyCommand);
            Ok(())
        } else {
            Err(SessionError::command(
                "executing arbitrary commands is not supported by this session",
            ))
        }
    }

    pub fn custom_command_on_files(
        &mut self,
        command: &str,
        files: &[RemoteFile],
    ) -> SessionResult<BulkResult> {
        let command = command.to_string();
        let events = Rc::clone(&self.events);
        self.process_files(
            files,
            OperationKind::CustomCommand,
            OperationSide::Remote,
            move |terminal, file, progress| {
                let message = format!("error executing command on '{}'", file.name);
                let full_name = file.full_name();
                terminal.file_operation_loop(progress, &message, true, |t| {
                    let mut capture = |line: &str| {
                        if let Some(hook) = &events.on_capture_output {
                            hook(line);
                        }
                    };
                    t.backend_op(&message, |backend| {
                        backend.custom_command_on_file(&full_name, Some(file), &command, &mut capture)
                    })
                })
            },
        )
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    pub fn copy_to_remote(
        &mut self,
        files: &[String],
        target: &str,
        copy_param: &CopyParam,
        params: TransferParams,
    ) -> SessionResult<bool> {
        let mut progress = OperationProgress::new(
            if params.delete_source {
                OperationKind::Move
            } else {
                OperationKind::Copy
            },
            OperationSide::Local,
        );
        progress.batch_overwrite = copy_param.batch_overwrite;
        progress.cps_limit = copy_param.cps_limit;
        let total = files
            .iter()
            .filter_map(|file| std::fs::metadata(file).ok())
            .map(|meta| meta.len())
            .sum();
        progress.start(files.len(), total);
        self.notify_progress(&progress);

        let action = self.actions.begin(ActionKind::Upload, target);
        self.begin_transaction();
        let message = format!("error copying files to remote directory '{target}'");
        let result = self.backend_op(&message, |backend| {
            backend.copy_to_remote(files, target, copy_param, params, &mut progress)
        });
        if result.is_ok() {
            self.directory_modified(target, true);
            self.react_on_command(if params.delete_source {
                ReactedOp::Move
            } else {
                ReactedOp::Copy
            });
        }
        let flushed = self.end_transaction();
        self.finish_action(action, &result);
        result?;
        flushed?;
        Ok(!progress.is_cancelled())
    }

    pub fn copy_to_local(
        &mut self,
        files: &[String],
        target: &str,
        copy_param: &CopyParam,
        params: TransferParams,
    ) -> SessionResult<bool> {
        let mut progress = OperationProgress::new(
            if params.delete_source {
                OperationKind::Move
            } else {
                OperationKind::Copy
            },
            OperationSide::Remote,
        );
        progress.batch_overwrite = copy_param.batch_overwrite;
        progress.cps_limit = copy_param.cps_limit;
        progress.start(files.len(), 0);
        self.notify_progress(&progress);

        if let Err(err) = self.events.create_local_directory(std::path::Path::new(target)) {
            return Err(SessionError::command_with(
                format!("error creating local directory '{target}'"),
                err,
            ));
        }

        let action = self.actions.begin(ActionKind::Download, target);
        self.begin_transaction();
        let message = format!("error copying files to local directory '{target}'");
        let result = self.backend_op(&message, |backend| {
            backend.copy_to_local(files, target, copy_param, params, &mut progress)
        });
        if result.is_ok() && params.delete_source {
            for file in files {
                self.file_modified(file, false);
            }
            self.react_on_command(ReactedOp::Move);
        }
        let flushed = self.end_transaction();
        self.finish_action(action, &result);
        result?;
        flushed?;
        Ok(!progress.is_cancelled())
    }

    // ------------------------------------------------------------------
    // Overwrite confirmation
    // ------------------------------------------------------------------

    /// Decide what to do about an existing destination file. Returns the
    /// canonical answer driving the actual write/append/resume, and keeps
    /// the sticky batch mode on `progress` up to date.
    pub fn confirm_file_overwrite(
        &mut self,
        file_name: &str,
        source: &OverwriteSideInfo,
        destination: &OverwriteSideInfo,
        copy_param: &CopyParam,
        params: TransferParams,
        progress: &mut OperationProgress,
    ) -> SessionResult<QueryAnswer> {
        let mut batch = if params.resume {
            BatchOverwrite::Resume
        } else if params.append {
            BatchOverwrite::Append
        } else if copy_param.newer_only {
            BatchOverwrite::Older
        } else if params.no_confirmation || !self.configuration.confirm_overwriting.get() {
            BatchOverwrite::All
        } else {
            progress.batch_overwrite
        };

        // Resume flavors only apply to a strictly shorter binary destination.
        if matches!(batch, BatchOverwrite::Resume | BatchOverwrite::AlternateResume) {
            let applicable = source.size > destination.size
                && copy_param.transfer_mode == TransferMode::Binary
                && self.is_capable(Capability::ResumeSupport);
            if !applicable {
                batch = if params.resume || params.append {
                    BatchOverwrite::Append
                } else {
                    BatchOverwrite::No
                };
            }
        }

        if batch == BatchOverwrite::No {
            let detail = format!(
                "source: {} bytes, {}; destination: {} bytes, {}",
                source.size,
                source
                    .modification
                    .map(|m| m.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string()),
                destination.size,
                destination
                    .modification
                    .map(|m| m.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string()),
            );
            let request = QueryRequest::new(
                QueryKind::Confirmation,
                format!("Target file '{file_name}' already exists. Overwrite?"),
                vec![
                    QueryAnswer::Yes,
                    QueryAnswer::No,
                    QueryAnswer::All,
                    QueryAnswer::NoToAll,
                    QueryAnswer::Older,
                    QueryAnswer::NeverAskAgain,
                ],
            )
            .with_detail(detail);
            progress.suspend();
            let answer = self.query_user(&request);
            progress.resume();
            match answer? {
                QueryAnswer::Yes => return Ok(QueryAnswer::Yes),
                QueryAnswer::No => return Ok(QueryAnswer::No),
                QueryAnswer::All => {
                    progress.batch_overwrite = BatchOverwrite::All;
                    return Ok(QueryAnswer::Yes);
                }
                QueryAnswer::NoToAll => {
                    progress.batch_overwrite = BatchOverwrite::None;
                    return Ok(QueryAnswer::No);
                }
                QueryAnswer::Older => {
                    progress.batch_overwrite = BatchOverwrite::Older;
                    batch = BatchOverwrite::Older;
                }
                QueryAnswer::NeverAskAgain => {
                    self.configuration.confirm_overwriting.set(false);
                    return Ok(QueryAnswer::Yes);
                }
                QueryAnswer::Resume | QueryAnswer::AlternateResume => {
                    return Ok(QueryAnswer::Resume)
                }
                QueryAnswer::Append => return Ok(QueryAnswer::Append),
                QueryAnswer::Abort => {
                    progress.request_cancel(CancelStatus::Cancel);
                    return Ok(QueryAnswer::No);
                }
                _ => return Ok(QueryAnswer::No),
            }
        }

        Ok(match batch {
            BatchOverwrite::All => QueryAnswer::Yes,
            BatchOverwrite::None => QueryAnswer::No,
            BatchOverwrite::Older => {
                // Yes iff the source is strictly newer after precision
                // reduction to the coarser side.
                match compare_modification(
                    source.modification,
                    source.precision,
                    destination.modification,
                    destination.precision,
                ) {
                    Some(std::cmp::Ordering::Greater) => QueryAnswer::Yes,
                    _ => QueryAnswer::No,
                }
            }
            BatchOverwrite::Resume | BatchOverwrite::AlternateResume => QueryAnswer::Resume,
            BatchOverwrite::Append => QueryAnswer::Append,
            BatchOverwrite::No => QueryAnswer::No,
        })
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.flush_directory_changes_cache();
        if self.status != TerminalStatus::Closed {
            if let Some(backend) = &mut self.backend {
                backend.close();
            }
            if self.tunnel.is_some() {
                self.close_tunnel();
            }
            self.status = TerminalStatus::Closed;
        }
    }
}
