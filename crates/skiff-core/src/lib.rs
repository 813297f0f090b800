pub mod backend;
pub mod cache;
pub mod capability;
pub mod config;
pub mod copy_param;
pub mod error;
pub mod events;
pub mod monitor;
pub mod progress;
pub mod remote_file;
pub mod session;
pub mod session_log;
mod shell;
pub mod sync;
pub mod terminal;
pub mod terminal_list;
pub mod tunnel;

pub use backend::{
    BackendFactory, DeleteParams, FileProperties, FileSystemBackend, FileSystemInfo, ReactedOp,
    SecureFlavor, SecureTransport, SessionInfo, SpaceAvailable, TransferParams, TransportUi,
};
pub use capability::{Capability, CapabilitySet};
pub use config::Configuration;
pub use copy_param::{CopyParam, TransferMask, TransferSide};
pub use error::{ExtendedInfo, SessionError, SessionResult};
pub use events::{PromptKind, QueryAnswer, QueryKind, QueryRequest, TerminalEvents, TransportPrompts};
pub use monitor::{MonitorController, MonitorOptions, MonitorState};
pub use progress::{BatchOverwrite, CancelStatus, OperationKind, OperationProgress, OperationSide};
pub use remote_file::{FileKind, ModificationPrecision, RemoteFile, RemoteFileList};
pub use session::{Protocol, SessionData, TunnelOptions};
pub use session_log::{ActionKind, ActionLog, ActionState, SessionLog};
pub use sync::{
    ChecklistItem, SyncAction, SyncMode, SyncParams, SyncSide, SynchronizeChecklist,
};
pub use terminal::{
    BulkResult, OverwriteSideInfo, ReopenOptions, Terminal, TerminalStatus,
};
pub use terminal_list::TerminalList;
