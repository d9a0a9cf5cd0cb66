//! totem-cron: Scheduling engine.
//!
//! Evaluates task frequencies once a minute, dispatches due tasks to a
//! bounded worker pool, executes their commands and records every attempt
//! in the run log. [`TaskService`] exposes the management operations
//! (create, edit, delete, list with statistics, run now).

pub mod error;
pub mod executor;
pub mod frequency;
pub mod scheduler;
pub mod service;
pub mod stats;

pub use error::{Result, SchedulerError, ValidationError};
pub use executor::{TRUNCATION_MARKER, TaskExecutor, truncate_output};
pub use frequency::{FrequencyKind, catalog, is_due, parse_timezone};
pub use scheduler::{LoopPhase, Scheduler, SchedulerHealth, TickReport};
pub use service::{TaskDetails, TaskForm, TaskService, TaskSort, parse_retention};
pub use stats::{compute_stats, task_stats};
