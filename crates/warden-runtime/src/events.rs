//! UI-facing event stream.
//!
//! The orchestrator never talks to a terminal. It publishes
//! [`KernelEvent`]s on an [`EventBus`] and any number of front-ends
//! subscribe. Answers flow back through
//! [`HumanResponder`][warden_kernel::HumanResponder], not through the bus.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;
use warden_types::{PermissionLevel, StepStatus, TaskStatus, ToolCall};

/// Events buffered per subscriber before the slowest one starts lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelEvent {
    StepUpdate {
        task_id: Uuid,
        step: u32,
        title: String,
        status: StepStatus,
    },
    HumanRequired {
        task_id: Uuid,
        step: u32,
        reason: String,
        options: Vec<String>,
    },
    ToolConfirmRequired {
        task_id: Uuid,
        step: u32,
        call: ToolCall,
        level: PermissionLevel,
        needs_preview: bool,
    },
    Completed {
        task_id: Uuid,
        status: TaskStatus,
    },
    Error {
        task_id: Uuid,
        message: String,
    },
    Info {
        task_id: Uuid,
        message: String,
    },
}

impl KernelEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            KernelEvent::StepUpdate { task_id, .. }
            | KernelEvent::HumanRequired { task_id, .. }
            | KernelEvent::ToolConfirmRequired { task_id, .. }
            | KernelEvent::Completed { task_id, .. }
            | KernelEvent::Error { task_id, .. }
            | KernelEvent::Info { task_id, .. } => *task_id,
        }
    }
}

/// Broadcast channel of [`KernelEvent`]s. Clones share the channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<KernelEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.sender.subscribe()
    }

    /// Publish `event`. Returns how many subscribers received it; having
    /// none is normal.
    pub fn publish(&self, event: KernelEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn info(&self, task_id: Uuid, message: impl Into<String>) {
        self.publish(KernelEvent::Info {
            task_id,
            message: message.into(),
        });
    }
}
