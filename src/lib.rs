pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod interact;
pub mod logging;
pub mod storage;
pub mod vfs;
pub mod workspace;

pub use config::{Protocol, ServerConfig, ServerId, WorkspaceConfig};
pub use core::{ListOptions, ModifiedPolicy, Outcome, SyncCacher, TaskList, TaskOp, TransferOptions};
pub use error::{ErrorCode, Result, SyncError};
pub use interact::Interact;
pub use workspace::Workspace;
