use std::fmt;

use futures::future::BoxFuture;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

pub use coordinator::{TaskCoordinator, TaskEvent, Ticket};

use crate::models::{Device, FileEntry, Listing, TransferProgress};

mod coordinator;

/// A unit of work produced by the repository or registry, run on a worker task
pub type Job<T> = BoxFuture<'static, anyhow::Result<T>>;

/// Logical task identity. At most one task per identity is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    Devices,
    Connect,
    Disconnect,
    List,
    Stat,
    Rename,
    Delete,
    CreateDirectory,
    Upload,
    ReadFile,
    /// One identity per remote path
    Download(String),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Devices => f.write_str("list devices"),
            Self::Connect => f.write_str("connect"),
            Self::Disconnect => f.write_str("disconnect"),
            Self::List => f.write_str("list files"),
            Self::Stat => f.write_str("file properties"),
            Self::Rename => f.write_str("rename"),
            Self::Delete => f.write_str("delete"),
            Self::CreateDirectory => f.write_str("create folder"),
            Self::Upload => f.write_str("upload"),
            Self::ReadFile => f.write_str("open file"),
            Self::Download(path) => write!(f, "download {path}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Result payload of a finished task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Devices(Vec<Device>),
    Connected(Device),
    /// Serial of the device that was disconnected
    Disconnected(String),
    Listing(Listing),
    Entry(FileEntry),
    /// Success message of a mutating operation
    Done(String),
    /// File contents
    Text(String),
}

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Started { id: TaskId, instance: u64 },
    Progress { id: TaskId, instance: u64, progress: TransferProgress },
    Finished { id: TaskId, instance: u64, result: anyhow::Result<TaskOutput> },
}

/// Handle a worker uses to report transfer progress for its task
#[derive(Debug, Clone)]
pub struct ProgressSender {
    id: TaskId,
    instance: u64,
    tx: UnboundedSender<WorkerMessage>,
}

impl ProgressSender {
    pub(crate) fn new(id: TaskId, instance: u64, tx: UnboundedSender<WorkerMessage>) -> Self {
        Self { id, instance, tx }
    }

    /// Sender whose updates go nowhere
    pub fn detached(id: TaskId) -> Self {
        let (tx, _) = unbounded_channel();
        Self { id, instance: 0, tx }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.id
    }

    pub fn send(&self, progress: TransferProgress) {
        // Receiver gone means nobody is interested anymore
        let _ = self.tx.send(WorkerMessage::Progress {
            id: self.id.clone(),
            instance: self.instance,
            progress,
        });
    }
}
