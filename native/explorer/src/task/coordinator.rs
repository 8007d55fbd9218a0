use std::{collections::HashMap, error::Error};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{Instrument, debug, info_span, instrument, trace, warn};

use super::{Job, ProgressSender, TaskId, TaskOutput, TaskState, WorkerMessage};
use crate::{error::ExplorerError, models::TransferProgress};

#[derive(Debug)]
struct TaskSlot {
    instance: u64,
    device: Option<String>,
    state: TaskState,
    /// Requester lost interest, result will be dropped
    detached: bool,
}

/// Permission to launch one task, handed out by [`TaskCoordinator::reserve`]
#[derive(Debug)]
pub struct Ticket {
    id: TaskId,
    instance: u64,
    tx: UnboundedSender<WorkerMessage>,
}

impl Ticket {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn progress(&self) -> ProgressSender {
        ProgressSender::new(self.id.clone(), self.instance, self.tx.clone())
    }
}

/// What the coordinating side sees of its tasks
#[derive(Debug)]
pub enum TaskEvent {
    Started { id: TaskId, device: Option<String> },
    Progress { id: TaskId, device: Option<String>, progress: TransferProgress },
    Finished { id: TaskId, device: Option<String>, result: anyhow::Result<TaskOutput> },
}

impl TaskEvent {
    pub fn id(&self) -> &TaskId {
        match self {
            Self::Started { id, .. } | Self::Progress { id, .. } | Self::Finished { id, .. } => id,
        }
    }

    pub fn device(&self) -> Option<&str> {
        match self {
            Self::Started { device, .. }
            | Self::Progress { device, .. }
            | Self::Finished { device, .. } => device.as_deref(),
        }
    }
}

/// Runs jobs on worker tasks with single-flight per [`TaskId`].
///
/// Workers report back over one channel; task state only changes inside
/// [`next_event`](Self::next_event), on whichever task drives the coordinator.
#[derive(Debug)]
pub struct TaskCoordinator {
    slots: HashMap<TaskId, TaskSlot>,
    next_instance: u64,
    tx: UnboundedSender<WorkerMessage>,
    rx: UnboundedReceiver<WorkerMessage>,
}

impl Default for TaskCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { slots: HashMap::new(), next_instance: 0, tx, rx }
    }

    /// Rejects `id` while a previous task with the same identity has not finished.
    /// Every finished task is evicted, so [`state`](Self::state) only remembers them
    /// until the next reservation.
    #[instrument(level = "debug", skip(self), err)]
    pub fn reserve(&mut self, id: TaskId) -> anyhow::Result<Ticket> {
        if self.is_busy(&id) {
            return Err(ExplorerError::TaskInFlight(id.to_string()).into());
        }
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.state.is_finished());
        trace!(%id, evicted = before - self.slots.len(), "Evicted finished tasks");
        self.next_instance += 1;
        Ok(Ticket { id, instance: self.next_instance, tx: self.tx.clone() })
    }

    /// Spawns `job` for a reserved identity
    pub fn launch(&mut self, ticket: Ticket, device: Option<String>, job: Job<TaskOutput>) {
        let Ticket { id, instance, tx } = ticket;
        debug!(%id, instance, ?device, "Launching task");
        self.slots.insert(
            id.clone(),
            TaskSlot { instance, device, state: TaskState::Pending, detached: false },
        );

        let span = info_span!("task", id = %id, instance);
        tokio::spawn(
            async move {
                let _ = tx.send(WorkerMessage::Started { id: id.clone(), instance });
                let result = job.await;
                if let Err(e) = &result {
                    warn!(error = e.as_ref() as &dyn Error, "Task failed");
                }
                let _ = tx.send(WorkerMessage::Finished { id, instance, result });
            }
            .instrument(span),
        );
    }

    /// Stops delivering events for `id`. The worker keeps running and occupies the
    /// identity until it finishes.
    pub fn cancel(&mut self, id: &TaskId) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if !slot.state.is_finished() && !slot.detached => {
                debug!(%id, "Detaching from task");
                slot.detached = true;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.slots.get(id).map(|slot| if slot.detached { TaskState::Cancelled } else { slot.state })
    }

    pub fn is_busy(&self, id: &TaskId) -> bool {
        self.slots.get(id).is_some_and(|slot| !slot.state.is_finished())
    }

    /// Waits for the next event of a task that is still of interest
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        loop {
            let message = self.rx.recv().await?;
            if let Some(event) = self.apply(message) {
                return Some(event);
            }
        }
    }

    /// Like [`next_event`](Self::next_event) but returns `None` when nothing is queued
    pub fn try_next_event(&mut self) -> Option<TaskEvent> {
        while let Ok(message) = self.rx.try_recv() {
            if let Some(event) = self.apply(message) {
                return Some(event);
            }
        }
        None
    }

    fn apply(&mut self, message: WorkerMessage) -> Option<TaskEvent> {
        let (id, instance) = match &message {
            WorkerMessage::Started { id, instance }
            | WorkerMessage::Progress { id, instance, .. }
            | WorkerMessage::Finished { id, instance, .. } => (id, *instance),
        };
        let slot = match self.slots.get_mut(id) {
            Some(slot) if slot.instance == instance => slot,
            _ => {
                trace!(%id, instance, "Dropping message of an evicted task");
                return None;
            }
        };
        let device = slot.device.clone();

        match message {
            WorkerMessage::Started { id, .. } => {
                slot.state = TaskState::Running;
                (!slot.detached).then_some(TaskEvent::Started { id, device })
            }
            WorkerMessage::Progress { id, progress, .. } => {
                (!slot.detached).then_some(TaskEvent::Progress { id, device, progress })
            }
            WorkerMessage::Finished { id, result, .. } => {
                if slot.detached {
                    debug!(%id, "Discarding result of cancelled task");
                    slot.state = TaskState::Cancelled;
                    return None;
                }
                slot.state =
                    if result.is_ok() { TaskState::Completed } else { TaskState::Failed };
                Some(TaskEvent::Finished { id, device, result })
            }
        }
    }
}
