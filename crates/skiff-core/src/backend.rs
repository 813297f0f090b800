//! The capability-indexed port implemented by every protocol engine, the
//! secure-transport surface the tunnel drives, and the factory the embedder
//! supplies to bind engines to sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::capability::{Capability, CapabilitySet};
use crate::copy_param::CopyParam;
use crate::error::SessionResult;
use crate::events::{PromptKind, QueryAnswer, QueryRequest};
use crate::progress::OperationProgress;
use crate::remote_file::{RemoteFile, RemoteFileList};
use crate::session::SessionData;
use crate::session_log::SessionLog;

#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub protocol_name: String,
    pub security_protocol_name: String,
    pub cipher: Option<String>,
    pub login_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct FileSystemInfo {
    pub remote_system: String,
    pub additional_info: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceAvailable {
    pub bytes_on_device: u64,
    pub unused_bytes_on_device: u64,
    pub bytes_available_to_user: u64,
    pub unused_bytes_available_to_user: u64,
    pub bytes_per_allocation_unit: u32,
}

/// Property bag for change-file-properties; `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct FileProperties {
    pub rights: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub modification: Option<DateTime<Utc>>,
    pub recursive: bool,
}

impl FileProperties {
    pub fn modification_only(modification: DateTime<Utc>) -> Self {
        Self {
            modification: Some(modification),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteParams {
    /// Bypass the recycle bin even when the descriptor enables it.
    pub force: bool,
    /// Protocol-specific alternative deletion flavor.
    pub alternative: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferParams {
    /// Remove the source after a successful transfer (move semantics).
    pub delete_source: bool,
    pub no_confirmation: bool,
    pub resume: bool,
    pub append: bool,
}

/// Backend command classes the controller reacts to with cache maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactedOp {
    ChangeDirectory,
    CachedChangeDirectory,
    HomeDirectory,
    Delete,
    Rename,
    Move,
    Copy,
    MakeDirectory,
    MakeLink,
    ChangeProperties,
    AnyCommand,
}

/// The polymorphic surface implemented by each protocol engine.
///
/// All paths crossing this boundary are absolute remote paths unless the
/// operation is explicitly about the current directory. Backends report
/// recoverable failures as `SessionError::Command` and transport death as
/// `SessionError::Fatal`.
pub trait FileSystemBackend {
    fn open(&mut self) -> SessionResult<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn idle(&mut self) -> SessionResult<()>;

    fn capabilities(&self) -> CapabilitySet;
    fn is_capable(&self, capability: Capability) -> bool {
        self.capabilities().contains(capability)
    }

    fn current_directory(&mut self) -> SessionResult<String>;
    fn change_directory(&mut self, path: &str) -> SessionResult<()>;
    /// Adopt `path` as the current directory without a server round trip;
    /// used when a learned directory-change mapping pre-resolved the target.
    fn cached_change_directory(&mut self, path: &str) -> SessionResult<()>;
    fn home_directory(&mut self) -> SessionResult<()>;

    fn read_directory(&mut self, list: &mut RemoteFileList) -> SessionResult<()>;
    fn read_file(&mut self, path: &str) -> SessionResult<RemoteFile>;
    fn read_symlink(&mut self, link: &RemoteFile) -> SessionResult<RemoteFile>;

    fn create_directory(&mut self, path: &str) -> SessionResult<()>;
    fn create_link(&mut self, path: &str, target: &str, symbolic: bool) -> SessionResult<()>;
    fn delete_file(
        &mut self,
        path: &str,
        file: Option<&RemoteFile>,
        params: DeleteParams,
    ) -> SessionResult<()>;
    fn rename_file(&mut self, path: &str, new_path: &str) -> SessionResult<()>;
    fn copy_file(&mut self, path: &str, new_path: &str) -> SessionResult<()>;
    fn change_file_properties(
        &mut self,
        path: &str,
        file: Option<&RemoteFile>,
        properties: &FileProperties,
    ) -> SessionResult<()>;

    fn copy_to_remote(
        &mut self,
        files: &[String],
        target: &str,
        copy_param: &CopyParam,
        params: TransferParams,
        progress: &mut OperationProgress,
    ) -> SessionResult<()>;
    fn copy_to_local(
        &mut self,
        files: &[String],
        target: &str,
        copy_param: &CopyParam,
        params: TransferParams,
        progress: &mut OperationProgress,
    ) -> SessionResult<()>;

    fn custom_command_on_file(
        &mut self,
        path: &str,
        file: Option<&RemoteFile>,
        command: &str,
        output: &mut dyn FnMut(&str),
    ) -> SessionResult<()>;
    fn any_command(&mut self, command: &str, output: &mut dyn FnMut(&str)) -> SessionResult<()>;

    fn calculate_files_checksum(
        &mut self,
        algorithm: &str,
        files: &[RemoteFile],
    ) -> SessionResult<Vec<String>>;
    fn space_available(&mut self, path: &str) -> SessionResult<SpaceAvailable>;

    fn file_url(&self, path: &str) -> String;
    fn fixed_paths(&self) -> Vec<String> {
        Vec::new()
    }
    fn session_info(&self) -> SessionInfo;
    fn file_system_info(&mut self, retrieve: bool) -> SessionResult<FileSystemInfo>;

    /// Prefetch user/group tables; called after open when the backend
    /// advertises `Capability::UserGroupListing`.
    fn lookup_users_groups(&mut self) -> SessionResult<()> {
        Ok(())
    }

    /// Names the backend writes while a transfer is in flight; the
    /// synchronization engine skips them.
    fn temporary_transfer_file(&self, _name: &str) -> bool {
        false
    }

    /// Canonicalize `path` against the current directory.
    fn absolute_path(&mut self, path: &str, local: bool) -> SessionResult<String>;
}

/// A secure-shell transport: the tunnel relay, and the base the SCP/SFTP
/// engines are layered on. `Send` because the tunnel driver thread owns its
/// transport for the lifetime of the forward.
pub trait SecureTransport: Send {
    fn open(&mut self) -> SessionResult<()>;
    fn close(&mut self);
    fn active(&self) -> bool;
    /// Pump pending IO; the tunnel driver calls this every 250 ms.
    fn idle(&mut self, quantum: Duration) -> SessionResult<()>;
    fn last_tunnel_error(&self) -> Option<String>;
    /// Set when the server negotiated down from SFTP and the session should
    /// fall back to SCP.
    fn sftp_fallback_requested(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureFlavor {
    Sftp,
    Scp,
}

/// Prompt surface a transport may call while opening. Implementations are
/// thread-checked: calls from a thread other than the session's owner answer
/// Abort without reaching the host.
pub trait TransportUi: Send + Sync {
    fn information(&self, message: &str, status: bool);
    fn query_user(&self, request: &QueryRequest) -> QueryAnswer;
    fn prompt_user(&self, kind: PromptKind, prompt: &str) -> Option<String>;
    fn display_banner(&self, banner: &str);
}

/// Constructs protocol engines and secure transports for a descriptor. The
/// embedder supplies one; protocol engines themselves are out of the core's
/// scope.
pub trait BackendFactory {
    fn make_backend(
        &self,
        protocol: crate::session::Protocol,
        data: &SessionData,
        ui: Arc<dyn TransportUi>,
        log: &Arc<SessionLog>,
    ) -> SessionResult<Box<dyn FileSystemBackend>>;

    fn make_transport(
        &self,
        data: &SessionData,
        ui: Arc<dyn TransportUi>,
        log: &Arc<SessionLog>,
    ) -> SessionResult<Box<dyn SecureTransport>>;

    fn make_secure_backend(
        &self,
        flavor: SecureFlavor,
        transport: Box<dyn SecureTransport>,
        data: &SessionData,
        log: &Arc<SessionLog>,
    ) -> SessionResult<Box<dyn FileSystemBackend>>;
}
