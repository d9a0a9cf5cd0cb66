//! totem-hooks: Scheduler observability events.
//!
//! The scheduler and executor emit [`events::SchedulerEvent`]s (dispatches,
//! skips, completions, abandoned ticks) through a [`registry::HookRegistry`],
//! which logs them and broadcasts them to subscribers.

pub mod events;
pub mod registry;

pub use events::{SchedulerEvent, SkipReason};
pub use registry::HookRegistry;
