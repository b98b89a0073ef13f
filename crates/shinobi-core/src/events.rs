//! Runtime lifecycle events and the broadcast emitter that carries them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{AgentId, RunId, ToolCallId};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    SpecialistStarted {
        run_id: RunId,
        agent_id: AgentId,
        specialist: String,
    },
    TurnStarted {
        run_id: RunId,
        turn: u32,
    },
    CapabilityStarted {
        run_id: RunId,
        call_id: ToolCallId,
        capability: String,
    },
    CapabilityFinished {
        run_id: RunId,
        call_id: ToolCallId,
        capability: String,
        is_error: bool,
        duration: Duration,
    },
    SpecialistFinished {
        run_id: RunId,
        specialist: String,
        /// `complete`, `failed` or `human_input_required`.
        status: String,
        turns: u32,
    },
}

impl RuntimeEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::SpecialistStarted { run_id, .. }
            | Self::TurnStarted { run_id, .. }
            | Self::CapabilityStarted { run_id, .. }
            | Self::CapabilityFinished { run_id, .. }
            | Self::SpecialistFinished { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SpecialistStarted { .. } => "specialist_started",
            Self::TurnStarted { .. } => "turn_started",
            Self::CapabilityStarted { .. } => "capability_started",
            Self::CapabilityFinished { .. } => "capability_finished",
            Self::SpecialistFinished { .. } => "specialist_finished",
        }
    }
}

/// Broadcast-based event emitter.
///
/// `emit` never awaits. Slow receivers lag and lose events instead of
/// blocking the runtime.
#[derive(Debug)]
pub struct EventEmitter {
    tx: broadcast::Sender<RuntimeEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Returns the number of receivers reached; 0 with no subscribers.
    pub fn emit(&self, event: RuntimeEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
