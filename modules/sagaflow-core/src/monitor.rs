//! Monitor events and implementations.

use std::cell::{Cell, RefCell};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::task::TaskStatus;
use crate::traits::Monitor;
use crate::value::Action;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    TaskStarted {
        task: u64,
        parent: Option<u64>,
        name: String,
    },
    EffectTriggered {
        task: u64,
        effect: u64,
        /// Enclosing `race`/`all` effect, if any.
        parent: Option<u64>,
        kind: String,
    },
    EffectResolved {
        effect: u64,
    },
    EffectRejected {
        effect: u64,
        error: String,
    },
    EffectCancelled {
        effect: u64,
    },
    ActionDispatched {
        action: Action,
    },
    TaskFinished {
        task: u64,
        status: TaskStatus,
    },
}

// ---------------------------------------------------------------------------
// TracingMonitor (production: forwards to the tracing subscriber)
// ---------------------------------------------------------------------------

/// Emits every event as a `debug` record on the `sagaflow::monitor` target.
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn record(&self, event: MonitorEvent) {
        debug!(target: "sagaflow::monitor", ?event);
    }
}

// ---------------------------------------------------------------------------
// MemoryMonitor (tests: keeps everything for assertions)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MonitorRecord {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event: MonitorEvent,
}

/// In-memory recorder with incrementing sequence numbers.
pub struct MemoryMonitor {
    next_seq: Cell<i64>,
    records: RefCell<Vec<MonitorRecord>>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self {
            next_seq: Cell::new(1),
            records: RefCell::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<MonitorRecord> {
        self.records.borrow().clone()
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.records.borrow().iter().map(|r| r.event.clone()).collect()
    }

    /// Types of every dispatched action, in dispatch order.
    pub fn dispatched(&self) -> Vec<String> {
        self.records
            .borrow()
            .iter()
            .filter_map(|r| match &r.event {
                MonitorEvent::ActionDispatched { action } => Some(action.kind.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for MemoryMonitor {
    fn record(&self, event: MonitorEvent) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.records.borrow_mut().push(MonitorRecord {
            seq,
            ts: Utc::now(),
            event,
        });
    }
}
