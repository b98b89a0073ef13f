use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Started,
    Note,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position in the log, starting at 0.
    pub seq: u64,
    pub module: String,
    pub kind: TraceKind,
    pub message: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

/// Append-only execution log.
#[derive(Debug, Default)]
pub struct Trace {
    events: Mutex<Vec<TraceEvent>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, module: &str, kind: TraceKind, message: impl Into<String>) -> u64 {
        self.push(module, kind, message.into(), None)
    }

    pub fn append_timed(
        &self,
        module: &str,
        kind: TraceKind,
        message: impl Into<String>,
        duration: Duration,
    ) -> u64 {
        self.push(module, kind, message.into(), Some(duration))
    }

    fn push(&self, module: &str, kind: TraceKind, message: String, duration: Option<Duration>) -> u64 {
        let mut events = self.events.lock();
        let seq = events.len() as u64;
        events.push(TraceEvent {
            seq,
            module: module.to_string(),
            kind,
            message,
            at: Utc::now(),
            duration,
        });
        seq
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn for_module(&self, module: &str) -> Vec<TraceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.module == module)
            .cloned()
            .collect()
    }
}
