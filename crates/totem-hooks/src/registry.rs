//! Hook registry: logs scheduler events and broadcasts them to subscribers.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SchedulerEvent;

/// Buffered events per broadcast subscriber before it starts lagging.
const BROADCAST_CAPACITY: usize = 256;

/// Logs scheduler events and fans them out to subscribers.
///
/// `emit` never blocks the caller: subscribers that fall behind lose the
/// oldest events.
pub struct HookRegistry {
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl HookRegistry {
    /// Create a new registry with no subscribers.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { events_tx }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    /// Log an event and broadcast it to subscribers.
    pub fn emit(&self, event: SchedulerEvent) {
        log_event(&event);
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::OrphansReconciled { count } => {
            if *count > 0 {
                warn!(count, "Marked orphaned in-flight runs as abandoned");
            }
        }
        SchedulerEvent::TickStarted { at } => debug!(%at, "Tick started"),
        SchedulerEvent::TickCompleted {
            due,
            dispatched,
            skipped,
        } => debug!(due, dispatched, skipped, "Tick completed"),
        SchedulerEvent::TickAbandoned { error } => {
            warn!(%error, "Tick abandoned: task store unavailable")
        }
        SchedulerEvent::TaskDispatched { task_id, run_id } => {
            info!(%task_id, run_id, "Dispatched task")
        }
        SchedulerEvent::TaskSkipped { task_id, reason } => {
            info!(%task_id, reason = ?reason, "Skipped due task")
        }
        SchedulerEvent::RunCompleted {
            task_id,
            run_id,
            exit_status,
            runtime_ms,
        } => {
            match exit_status.failure() {
                None => info!(%task_id, run_id, runtime_ms, "Run completed"),
                Some(kind) => {
                    warn!(%task_id, run_id, runtime_ms, %kind, status = %exit_status, "Run failed")
                }
            }
        }
        SchedulerEvent::SchedulerStopped => info!("Scheduler stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SkipReason;

    #[tokio::test]
    async fn test_subscribe_receives_in_order() {
        let registry = HookRegistry::new();
        let mut rx = registry.subscribe();

        registry.emit(SchedulerEvent::TaskDispatched {
            task_id: "t1".into(),
            run_id: 7,
        });
        registry.emit(SchedulerEvent::SchedulerStopped);

        match rx.recv().await.unwrap() {
            SchedulerEvent::TaskDispatched { task_id, run_id } => {
                assert_eq!(task_id, "t1");
                assert_eq!(run_id, 7);
            }
            other => panic!("Expected TaskDispatched, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            SchedulerEvent::SchedulerStopped
        ));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let registry = HookRegistry::new();
        registry.emit(SchedulerEvent::OrphansReconciled { count: 2 });

        // Late subscribers only see later events.
        let mut rx = registry.subscribe();
        assert!(rx.try_recv().is_err());
        registry.emit(SchedulerEvent::TaskSkipped {
            task_id: "t1".into(),
            reason: SkipReason::AtCapacity,
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(SchedulerEvent::TaskSkipped {
                reason: SkipReason::AtCapacity,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let registry = HookRegistry::new();
        let mut rx = registry.subscribe();
        for count in 0..(BROADCAST_CAPACITY + 10) {
            registry.emit(SchedulerEvent::OrphansReconciled { count });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(10))
        ));
        assert!(matches!(
            rx.recv().await,
            Ok(SchedulerEvent::OrphansReconciled { count: 10 })
        ));
    }
}
