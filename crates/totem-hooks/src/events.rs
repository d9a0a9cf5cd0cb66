//! Hook event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use totem_types::{ExitStatus, RunId, TaskId};

/// Why a due task was not dispatched on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous run of the task has not finished.
    StillRunning,
    /// The task was already dispatched for this occurrence.
    AlreadyRanThisMinute,
    /// The dispatch queue was full.
    AtCapacity,
}

/// Events that hooks can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// In-flight entries left by a previous process were marked abandoned.
    OrphansReconciled { count: usize },
    /// A tick began scanning.
    TickStarted { at: DateTime<Utc> },
    /// A tick finished its dispatching phase.
    TickCompleted {
        due: usize,
        dispatched: usize,
        skipped: usize,
    },
    /// The task store could not be read; the tick was discarded.
    TickAbandoned { error: String },
    /// A due task was handed to the worker pool.
    TaskDispatched { task_id: TaskId, run_id: RunId },
    /// A due task was not dispatched.
    TaskSkipped { task_id: TaskId, reason: SkipReason },
    /// A run log entry was completed.
    RunCompleted {
        task_id: TaskId,
        run_id: RunId,
        exit_status: ExitStatus,
        runtime_ms: u64,
    },
    /// The scheduler loop exited.
    SchedulerStopped,
}
