pub mod cacher;
pub mod comparator;
pub mod conflict;
pub mod manager;
pub mod scanner;
pub mod scheduler;
pub mod tasklist;

pub use cacher::{normalize_workpath, ListOptions, Outcome, SyncCacher, TransferOptions};
pub use comparator::{ActionSummary, FileComparator, FileRelation};
pub use conflict::ModifiedPolicy;
pub use manager::ConnectionManager;
pub use scanner::{IgnoreMatcher, LocalEntry};
pub use scheduler::{Scheduler, Task, TaskHandle, TaskState, PRIORITY_HIGH, PRIORITY_IDLE, PRIORITY_NORMAL};
pub use tasklist::{BatchResult, TaskList, TaskOp};
