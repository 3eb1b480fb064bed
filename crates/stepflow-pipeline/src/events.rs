//! Run event system for observability.
//!
//! Emits [`WorkflowEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, progress displays, tests) can follow a run without
//! coupling to the executor internals.

use serde::{Deserialize, Serialize};

/// Events emitted during a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    RunStarted {
        workflow: String,
        run_id: String,
        step_count: usize,
    },
    RunCompleted {
        workflow: String,
        run_id: String,
        visited: Vec<String>,
        duration_ms: u64,
    },
    RunFailed {
        workflow: String,
        run_id: String,
        error: String,
    },
    StepStarted {
        step: String,
    },
    StepCompleted {
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        step: String,
        error: String,
    },
    BranchSelected {
        condition: String,
        branch: String,
        targets: Vec<String>,
    },
    CheckpointSaved {
        step: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
