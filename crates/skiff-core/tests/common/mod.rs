#![allow(dead_code)]

//! Shared scripted backend for integration tests: an in-memory remote
//! filesystem with call counters and per-operation failure scripting.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use skiff_core::backend::{
    BackendFactory, DeleteParams, FileProperties, FileSystemBackend, FileSystemInfo,
    SecureFlavor, SecureTransport, SessionInfo, SpaceAvailable, TransferParams, TransportUi,
};
use skiff_core::capability::{Capability, CapabilitySet};
use skiff_core::config::Configuration;
use skiff_core::copy_param::CopyParam;
use skiff_core::error::{SessionError, SessionResult};
use skiff_core::events::{PromptKind, TerminalEvents};
use skiff_core::progress::OperationProgress;
use skiff_core::remote_file::{FileKind, ModificationPrecision, RemoteFile, RemoteFileList};
use skiff_core::session::{Protocol, SessionData};
use skiff_core::session_log::SessionLog;
use skiff_core::terminal::Terminal;

#[derive(Clone, Debug)]
pub struct MockNode {
    pub is_dir: bool,
    pub size: u64,
    pub modification: Option<DateTime<Utc>>,
    pub precision: ModificationPrecision,
}

#[derive(Default)]
pub struct MockState {
    /// Absolute path -> node; "/" is an implicit directory.
    pub nodes: BTreeMap<String, MockNode>,
    pub cwd: String,
    pub opens: u32,
    pub open_failures_remaining: u32,
    pub pwd_calls: u32,
    pub cd_calls: u32,
    pub cached_cd_calls: u32,
    pub list_calls: u32,
    /// "delete:/path" -> remaining scripted failures.
    pub fail_ops: BTreeMap<String, u32>,
    pub commands: Vec<String>,
    pub uploads: Vec<String>,
    pub downloads: Vec<String>,
    /// Bulk-operation order probe: "download", "delete-remote", "upload".
    pub operations: Vec<String>,
    pub password_prompts: u32,
    pub capabilities: CapabilitySet,
    pub shell_capabilities: CapabilitySet,
    /// Password the shell backend insists on during open.
    pub shell_password: Option<String>,
}

pub type SharedState = Rc<RefCell<MockState>>;

pub fn default_capabilities() -> CapabilitySet {
    CapabilitySet::builder()
        .with(Capability::Rename)
        .with(Capability::RemoteCopy)
        .with(Capability::RemoteMove)
        .with(Capability::ResolveSymlink)
        .with(Capability::SymbolicLink)
        .with(Capability::TimestampChanging)
        .with(Capability::ModeChanging)
        .with(Capability::CalculatingChecksum)
        .with(Capability::CheckingSpaceAvailable)
        .with(Capability::AnyCommand)
        .build()
}

pub fn new_state() -> SharedState {
    let mut state = MockState::default();
    state.capabilities = default_capabilities();
    state.shell_capabilities = CapabilitySet::builder()
        .with(Capability::AnyCommand)
        .with(Capability::ShellAnyCommand)
        .build();
    Rc::new(RefCell::new(state))
}

impl MockState {
    pub fn seed_dir(&mut self, path: &str) {
        self.nodes.insert(
            path.to_string(),
            MockNode {
                is_dir: true,
                size: 0,
                modification: None,
                precision: ModificationPrecision::Full,
            },
        );
    }

    pub fn seed_file(&mut self, path: &str, size: u64, modification: DateTime<Utc>) {
        self.nodes.insert(
            path.to_string(),
            MockNode {
                is_dir: false,
                size,
                modification: Some(modification),
                precision: ModificationPrecision::Full,
            },
        );
    }

    pub fn fail(&mut self, op: &str, path: &str, times: u32) {
        self.fail_ops.insert(format!("{op}:{path}"), times);
    }

    pub fn has(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn take_failure(&mut self, op: &str, path: &str) -> bool {
        let key = format!("{op}:{path}");
        match self.fail_ops.get_mut(&key) {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => false,
        }
    }

    fn children(&self, directory: &str) -> Vec<(String, MockNode)> {
        self.nodes
            .iter()
            .filter(|(path, _)| parent_of(path) == directory && *path != "/")
            .map(|(path, node)| (file_name_of(path).to_string(), node.clone()))
            .collect()
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.nodes
            .retain(|candidate, _| candidate != path && !candidate.starts_with(&prefix));
    }
}

pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => path[..index].to_string(),
        None => String::new(),
    }
}

pub fn file_name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn resolve(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&format!("{cwd}/{path}"))
    }
}

pub struct MockBackend {
    state: SharedState,
    ui: Option<Arc<dyn TransportUi>>,
    shell: bool,
    open: bool,
}

impl MockBackend {
    fn command_err(message: impl Into<String>) -> SessionError {
        SessionError::command(message)
    }
}

impl FileSystemBackend for MockBackend {
    fn open(&mut self) -> SessionResult<()> {
        {
            let mut state = self.state.borrow_mut();
            state.opens += 1;
            if state.open_failures_remaining > 0 {
                state.open_failures_remaining -= 1;
                return Err(SessionError::fatal("connection refused"));
            }
        }
        if self.shell {
            let expected = self.state.borrow().shell_password.clone();
            if let Some(expected) = expected {
                self.state.borrow_mut().password_prompts += 1;
                let given = self
                    .ui
                    .as_ref()
                    .and_then(|ui| ui.prompt_user(PromptKind::Password, "password:"));
                if given.as_deref() != Some(expected.as_str()) {
                    return Err(SessionError::fatal("authentication failed"));
                }
            }
        }
        if let Some(ui) = &self.ui {
            ui.display_banner("Welcome to mockfs");
        }
        self.state.borrow_mut().cwd = "/".to_string();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn idle(&mut self) -> SessionResult<()> {
        Ok(())
    }

    fn capabilities(&self) -> CapabilitySet {
        let state = self.state.borrow();
        if self.shell {
            state.shell_capabilities
        } else {
            state.capabilities
        }
    }

    fn current_directory(&mut self) -> SessionResult<String> {
        let mut state = self.state.borrow_mut();
        state.pwd_calls += 1;
        Ok(state.cwd.clone())
    }

    fn change_directory(&mut self, path: &str) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        state.cd_calls += 1;
        let resolved = resolve(&state.cwd, path);
        let is_dir = resolved == "/"
            || state.nodes.get(&resolved).map(|node| node.is_dir).unwrap_or(false);
        if !is_dir {
            return Err(Self::command_err(format!("no such directory: {resolved}")));
        }
        state.cwd = resolved;
        Ok(())
    }

    fn cached_change_directory(&mut self, path: &str) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        state.cached_cd_calls += 1;
        state.cwd = path.to_string();
        Ok(())
    }

    fn home_directory(&mut self) -> SessionResult<()> {
        self.state.borrow_mut().cwd = "/".to_string();
        Ok(())
    }

    fn read_directory(&mut self, list: &mut RemoteFileList) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        state.list_calls += 1;
        let directory = list.directory().to_string();
        if directory != "/" && !state.nodes.get(&directory).map(|n| n.is_dir).unwrap_or(false) {
            return Err(Self::command_err(format!("no such directory: {directory}")));
        }
        for (name, node) in state.children(&directory) {
            let kind = if node.is_dir {
                FileKind::Directory
            } else {
                FileKind::File
            };
            let mut file = RemoteFile::new(name, kind);
            file.size = node.size;
            file.modification = node.modification;
            file.precision = node.precision;
            list.push(file);
        }
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> SessionResult<RemoteFile> {
        let state = self.state.borrow();
        let resolved = resolve(&state.cwd, path);
        let node = state
            .nodes
            .get(&resolved)
            .ok_or_else(|| Self::command_err(format!("no such file: {resolved}")))?;
        let kind = if node.is_dir {
            FileKind::Directory
        } else {
            FileKind::File
        };
        let mut file = RemoteFile::new(file_name_of(&resolved).to_string(), kind);
        file.size = node.size;
        file.modification = node.modification;
        file.precision = node.precision;
        file.directory = parent_of(&resolved);
        Ok(file)
    }

    fn read_symlink(&mut self, link: &RemoteFile) -> SessionResult<RemoteFile> {
        Err(Self::command_err(format!("not a symlink: {}", link.name)))
    }

    fn create_directory(&mut self, path: &str) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        if state.take_failure("mkdir", path) {
            return Err(Self::command_err(format!("scripted mkdir failure: {path}")));
        }
        state.seed_dir(path);
        Ok(())
    }

    fn create_link(&mut self, path: &str, _target: &str, _symbolic: bool) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        state.nodes.insert(
            path.to_string(),
            MockNode {
                is_dir: false,
                size: 0,
                modification: None,
                precision: ModificationPrecision::Full,
            },
        );
        Ok(())
    }

    fn delete_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        _params: DeleteParams,
    ) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        if state.take_failure("delete", path) {
            return Err(Self::command_err(format!("scripted delete failure: {path}")));
        }
        if !state.has(path) {
            return Err(Self::command_err(format!("no such file: {path}")));
        }
        state.remove_subtree(path);
        state.operations.push(format!("delete-remote {path}"));
        Ok(())
    }

    fn rename_file(&mut self, path: &str, new_path: &str) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        if state.take_failure("rename", path) {
            return Err(Self::command_err(format!("scripted rename failure: {path}")));
        }
        let Some(node) = state.nodes.get(path).cloned() else {
            return Err(Self::command_err(format!("no such file: {path}")));
        };
        let prefix = format!("{path}/");
        let moved: Vec<(String, MockNode)> = state
            .nodes
            .iter()
            .filter(|(candidate, _)| candidate.starts_with(&prefix))
            .map(|(candidate, node)| {
                (
                    format!("{new_path}/{}", &candidate[prefix.len()..]),
                    node.clone(),
                )
            })
            .collect();
        state.remove_subtree(path);
        state.nodes.insert(new_path.to_string(), node);
        for (path, node) in moved {
            state.nodes.insert(path, node);
        }
        Ok(())
    }

    fn copy_file(&mut self, path: &str, new_path: &str) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        let Some(node) = state.nodes.get(path).cloned() else {
            return Err(Self::command_err(format!("no such file: {path}")));
        };
        state.nodes.insert(new_path.to_string(), node);
        Ok(())
    }

    fn change_file_properties(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        properties: &FileProperties,
    ) -> SessionResult<()> {
        let mut state = self.state.borrow_mut();
        if state.take_failure("chmod", path) {
            return Err(Self::command_err(format!("scripted chmod failure: {path}")));
        }
        let Some(node) = state.nodes.get_mut(path) else {
            return Err(Self::command_err(format!("no such file: {path}")));
        };
        if let Some(modification) = properties.modification {
            node.modification = Some(modification);
        }
        Ok(())
    }

    fn copy_to_remote(
        &mut self,
        files: &[String],
        target: &str,
        copy_param: &CopyParam,
        _params: TransferParams,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        for local in files {
            if progress.is_cancelled() {
                return Ok(());
            }
            let metadata = std::fs::metadata(local)
                .map_err(|err| Self::command_err(format!("cannot read '{local}': {err}")))?;
            let name = file_name_of(local.trim_end_matches('/')).to_string();
            let name = name
                .rsplit(std::path::MAIN_SEPARATOR)
                .next()
                .unwrap_or(&name)
                .to_string();
            let path = if target == "/" {
                format!("/{name}")
            } else {
                format!("{target}/{name}")
            };
            let modification = if copy_param.preserve_time {
                metadata.modified().ok().map(DateTime::<Utc>::from)
            } else {
                Some(Utc::now())
            };
            let mut state = self.state.borrow_mut();
            if metadata.is_dir() {
                state.seed_dir(&path);
            } else {
                state.nodes.insert(
                    path.clone(),
                    MockNode {
                        is_dir: false,
                        size: metadata.len(),
                        modification,
                        precision: ModificationPrecision::Full,
                    },
                );
            }
            state.uploads.push(local.clone());
            state.operations.push(format!("upload {local}"));
            progress.set_file(local.clone());
            progress.add_transferred(metadata.len());
        }
        Ok(())
    }

    fn copy_to_local(
        &mut self,
        files: &[String],
        target: &str,
        copy_param: &CopyParam,
        params: TransferParams,
        progress: &mut OperationProgress,
    ) -> SessionResult<()> {
        for remote in files {
            if progress.is_cancelled() {
                return Ok(());
            }
            let node = {
                let state = self.state.borrow();
                state
                    .nodes
                    .get(remote)
                    .cloned()
                    .ok_or_else(|| Self::command_err(format!("no such file: {remote}")))?
            };
            let destination = std::path::Path::new(target).join(file_name_of(remote));
            if node.is_dir {
                std::fs::create_dir_all(&destination)
                    .map_err(|err| Self::command_err(err.to_string()))?;
            } else {
                std::fs::write(&destination, vec![b'x'; node.size as usize])
                    .map_err(|err| Self::command_err(err.to_string()))?;
                if copy_param.preserve_time {
                    if let Some(modification) = node.modification {
                        let _ = filetime::set_file_mtime(
                            &destination,
                            filetime::FileTime::from_system_time(modification.into()),
                        );
                    }
                }
            }
            let mut state = self.state.borrow_mut();
            state.downloads.push(remote.clone());
            state.operations.push(format!("download {remote}"));
            if params.delete_source {
                state.remove_subtree(remote);
            }
            progress.set_file(remote.clone());
            progress.add_transferred(node.size);
        }
        Ok(())
    }

    fn custom_command_on_file(
        &mut self,
        path: &str,
        _file: Option<&RemoteFile>,
        command: &str,
        output: &mut dyn FnMut(&str),
    ) -> SessionResult<()> {
        self.state
            .borrow_mut()
            .commands
            .push(format!("{command} {path}"));
        output("ok");
        Ok(())
    }

    fn any_command(&mut self, command: &str, output: &mut dyn FnMut(&str)) -> SessionResult<()> {
        self.state.borrow_mut().commands.push(command.to_string());
        output("ok");
        Ok(())
    }

    fn calculate_files_checksum(
        &mut self,
        _algorithm: &str,
        files: &[RemoteFile],
    ) -> SessionResult<Vec<String>> {
        Ok(files.iter().map(|_| "deadbeef".to_string()).collect())
    }

    fn space_available(&mut self, _path: &str) -> SessionResult<SpaceAvailable> {
        Ok(SpaceAvailable {
            bytes_on_device: 1 << 30,
            unused_bytes_on_device: 1 << 29,
            bytes_available_to_user: 1 << 30,
            unused_bytes_available_to_user: 1 << 29,
            bytes_per_allocation_unit: 4096,
        })
    }

    fn file_url(&self, path: &str) -> String {
        format!("mock://{path}")
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            protocol_name: "mock".to_string(),
            ..SessionInfo::default()
        }
    }

    fn file_system_info(&mut self, _retrieve: bool) -> SessionResult<FileSystemInfo> {
        Ok(FileSystemInfo {
            remote_system: "mockfs".to_string(),
            additional_info: String::new(),
        })
    }

    fn temporary_transfer_file(&self, name: &str) -> bool {
        name.ends_with(".filepart")
    }

    fn absolute_path(&mut self, path: &str, _local: bool) -> SessionResult<String> {
        let state = self.state.borrow();
        Ok(resolve(&state.cwd, path))
    }
}

pub struct MockTransport {
    pub fail_open: bool,
    pub sftp_fallback: bool,
    pub tunnel_error: Option<String>,
    active: bool,
}

impl SecureTransport for MockTransport {
    fn open(&mut self) -> SessionResult<()> {
        if self.fail_open {
            return Err(SessionError::fatal("transport open failed"));
        }
        self.active = true;
        Ok(())
    }

    fn close(&mut self) {
        self.active = false;
    }

    fn active(&self) -> bool {
        self.active
    }

    fn idle(&mut self, _quantum: Duration) -> SessionResult<()> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn last_tunnel_error(&self) -> Option<String> {
        self.tunnel_error.clone()
    }

    fn sftp_fallback_requested(&self) -> bool {
        self.sftp_fallback
    }
}

/// Record of one transport construction: which endpoint the descriptor
/// pointed at, and any port-forward directive it carried.
#[derive(Debug, Clone)]
pub struct TransportSpec {
    pub host: String,
    pub port: u16,
    pub port_fwd: Option<String>,
}

pub struct MockFactory {
    pub state: SharedState,
    pub transports: RefCell<Vec<TransportSpec>>,
    pub secure_flavors: RefCell<Vec<SecureFlavor>>,
    pub fail_main_transport_open: Cell<bool>,
    pub fail_tunnel_transport_open: Cell<bool>,
    pub sftp_fallback: Cell<bool>,
    pub tunnel_error: RefCell<Option<String>>,
}

impl MockFactory {
    pub fn new(state: SharedState) -> Rc<Self> {
        Rc::new(Self {
            state,
            transports: RefCell::new(Vec::new()),
            secure_flavors: RefCell::new(Vec::new()),
            fail_main_transport_open: Cell::new(false),
            fail_tunnel_transport_open: Cell::new(false),
            sftp_fallback: Cell::new(false),
            tunnel_error: RefCell::new(None),
        })
    }
}

impl BackendFactory for MockFactory {
    fn make_backend(
        &self,
        protocol: Protocol,
        _data: &SessionData,
        ui: Arc<dyn TransportUi>,
        _log: &Arc<SessionLog>,
    ) -> SessionResult<Box<dyn FileSystemBackend>> {
        Ok(Box::new(MockBackend {
            state: Rc::clone(&self.state),
            ui: Some(ui),
            shell: protocol == Protocol::Shell,
            open: false,
        }))
    }

    fn make_transport(
        &self,
        data: &SessionData,
        _ui: Arc<dyn TransportUi>,
        _log: &Arc<SessionLog>,
    ) -> SessionResult<Box<dyn SecureTransport>> {
        let is_tunnel = data.tunnel_port_fwd.is_some();
        self.transports.borrow_mut().push(TransportSpec {
            host: data.host.clone(),
            port: data.port,
            port_fwd: data.tunnel_port_fwd.clone(),
        });
        Ok(Box::new(MockTransport {
            fail_open: if is_tunnel {
                self.fail_tunnel_transport_open.get()
            } else {
                self.fail_main_transport_open.get()
            },
            sftp_fallback: self.sftp_fallback.get(),
            tunnel_error: if is_tunnel {
                self.tunnel_error.borrow().clone()
            } else {
                None
            },
            active: false,
        }))
    }

    fn make_secure_backend(
        &self,
        flavor: SecureFlavor,
        _transport: Box<dyn SecureTransport>,
        _data: &SessionData,
        _log: &Arc<SessionLog>,
    ) -> SessionResult<Box<dyn FileSystemBackend>> {
        self.secure_flavors.borrow_mut().push(flavor);
        Ok(Box::new(MockBackend {
            state: Rc::clone(&self.state),
            ui: None,
            shell: false,
            open: false,
        }))
    }
}

pub fn test_session_data() -> SessionData {
    let mut data = SessionData::parse_url("ftp://tester@files.example.com").unwrap();
    data.cache_directories = true;
    data.cache_directory_changes = true;
    data
}

pub fn make_terminal(
    state: &SharedState,
    data: SessionData,
    events: TerminalEvents,
) -> (Terminal, Rc<MockFactory>) {
    make_terminal_with_config(state, data, Rc::new(Configuration::default()), events)
}

pub fn make_terminal_with_config(
    state: &SharedState,
    data: SessionData,
    configuration: Rc<Configuration>,
    events: TerminalEvents,
) -> (Terminal, Rc<MockFactory>) {
    let factory = MockFactory::new(Rc::clone(state));
    let factory_port: Rc<dyn BackendFactory> = Rc::clone(&factory) as Rc<dyn BackendFactory>;
    let terminal = Terminal::new(data, configuration, factory_port, events);
    (terminal, factory)
}
