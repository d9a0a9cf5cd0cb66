//! Scheduler loop: ticks once a minute, dispatches due tasks to a bounded
//! worker pool and keeps its health observable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use totem_config::SchedulerConfig;
use totem_hooks::{HookRegistry, SchedulerEvent, SkipReason};
use totem_storage::{RunLogStore, StorageError, TaskStore};
use totem_types::{RunId, RunLogEntry, Task, TaskFilter, TaskId};

use crate::error::{Result, SchedulerError};
use crate::executor::TaskExecutor;
use crate::frequency;

/// Observable scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerHealth {
    /// No tick has completed yet.
    Starting,
    Healthy,
    /// Recent ticks were abandoned because storage was unavailable.
    Degraded {
        consecutive_failures: u32,
        last_error: String,
    },
    Stopped,
}

/// Where the loop is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Scanning,
    Dispatching,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: Vec<(TaskId, RunId)>,
    pub skipped: Vec<(TaskId, SkipReason)>,
}

enum Dispatch {
    Queued(RunId),
    Skipped(SkipReason),
}

/// A due task with its in-flight entry, waiting for a worker.
struct Job {
    task: Task,
    entry: RunLogEntry,
}

pub struct Scheduler {
    tasks: Arc<dyn TaskStore>,
    run_log: Arc<dyn RunLogStore>,
    executor: Arc<TaskExecutor>,
    hooks: Arc<HookRegistry>,
    config: SchedulerConfig,
    health_tx: watch::Sender<SchedulerHealth>,
    phase_tx: watch::Sender<LoopPhase>,
    jobs_tx: mpsc::Sender<Job>,
    jobs_rx: Mutex<mpsc::Receiver<Job>>,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        run_log: Arc<dyn RunLogStore>,
        executor: Arc<TaskExecutor>,
        hooks: Arc<HookRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (health_tx, _) = watch::channel(SchedulerHealth::Starting);
        let (phase_tx, _) = watch::channel(LoopPhase::Idle);
        Self {
            tasks,
            run_log,
            executor,
            hooks,
            config,
            health_tx,
            phase_tx,
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
        }
    }

    /// Watch the scheduler's health.
    pub fn health(&self) -> watch::Receiver<SchedulerHealth> {
        self.health_tx.subscribe()
    }

    /// Watch the loop phase.
    pub fn phase(&self) -> watch::Receiver<LoopPhase> {
        self.phase_tx.subscribe()
    }

    /// Enabled tasks due at `now`. Reads only.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = self.tasks.list(&TaskFilter::enabled()).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.enabled && frequency::is_due(&t.frequency, t.timezone, now))
            .collect())
    }

    /// Evaluate every enabled task at `now` and dispatch the due ones.
    ///
    /// A storage failure discards the rest of the tick and degrades health;
    /// the next tick starts from scratch.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.hooks.emit(SchedulerEvent::TickStarted { at: now });
        self.phase_tx.send_replace(LoopPhase::Scanning);
        let result = self.scan_and_dispatch(now).await;
        self.phase_tx.send_replace(LoopPhase::Idle);
        result
    }

    async fn scan_and_dispatch(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = match self.scan(now).await {
            Ok(due) => due,
            Err(e) => return Err(self.abandon_tick(e)),
        };

        self.phase_tx.send_replace(LoopPhase::Dispatching);
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        for task in due {
            let task_id = task.id.clone();
            match self.dispatch(task, now).await {
                Ok(Dispatch::Queued(run_id)) => {
                    self.hooks.emit(SchedulerEvent::TaskDispatched {
                        task_id: task_id.clone(),
                        run_id,
                    });
                    report.dispatched.push((task_id, run_id));
                }
                Ok(Dispatch::Skipped(reason)) => {
                    self.hooks.emit(SchedulerEvent::TaskSkipped {
                        task_id: task_id.clone(),
                        reason,
                    });
                    report.skipped.push((task_id, reason));
                }
                Err(e) => return Err(self.abandon_tick(e)),
            }
        }

        self.health_tx.send_if_modified(|health| {
            if *health == SchedulerHealth::Healthy {
                false
            } else {
                *health = SchedulerHealth::Healthy;
                true
            }
        });
        self.hooks.emit(SchedulerEvent::TickCompleted {
            due: report.due,
            dispatched: report.dispatched.len(),
            skipped: report.skipped.len(),
        });
        Ok(report)
    }

    async fn dispatch(&self, task: Task, now: DateTime<Utc>) -> Result<Dispatch> {
        if let Some(last) = self.run_log.latest_started(&task.id).await? {
            if last.is_in_flight() {
                return Ok(Dispatch::Skipped(SkipReason::StillRunning));
            }
            if frequency::same_minute(last.started_at, now) {
                return Ok(Dispatch::Skipped(SkipReason::AlreadyRanThisMinute));
            }
        }

        // Reserve queue space first so a full queue never leaves an
        // in-flight entry behind.
        let Ok(permit) = self.jobs_tx.try_reserve() else {
            return Ok(Dispatch::Skipped(SkipReason::AtCapacity));
        };

        let entry = match self.executor.begin(&task, now).await {
            Ok(entry) => entry,
            // Lost the race against a manual run.
            Err(StorageError::AlreadyRunning { .. }) => {
                return Ok(Dispatch::Skipped(SkipReason::StillRunning));
            }
            Err(e) => return Err(e.into()),
        };
        let run_id = entry.id;
        permit.send(Job { task, entry });
        Ok(Dispatch::Queued(run_id))
    }

    fn abandon_tick(&self, err: SchedulerError) -> SchedulerError {
        let last_error = err.to_string();
        self.health_tx.send_modify(|health| {
            let consecutive_failures = match health {
                SchedulerHealth::Degraded {
                    consecutive_failures,
                    ..
                } => *consecutive_failures + 1,
                _ => 1,
            };
            *health = SchedulerHealth::Degraded {
                consecutive_failures,
                last_error: last_error.clone(),
            };
        });
        self.hooks
            .emit(SchedulerEvent::TickAbandoned { error: last_error });
        err
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Reconciles orphaned in-flight entries, starts `max_concurrent`
    /// workers and ticks every `tick_interval_secs`. On shutdown, queued
    /// jobs are abandoned and running ones get `shutdown_grace_secs` to
    /// finish before they are killed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrent = self.config.max_concurrent,
            tick_interval_secs = self.config.tick_interval_secs,
            "Scheduler started"
        );

        match self.run_log.reconcile_in_flight(Utc::now()).await {
            Ok(count) => self.hooks.emit(SchedulerEvent::OrphansReconciled { count }),
            Err(e) => warn!(error = %e, "Failed to reconcile orphaned runs"),
        }

        let mut workers = JoinSet::new();
        for index in 0..self.config.max_concurrent.max(1) {
            workers.spawn(self.clone().worker(index, shutdown.clone()));
        }

        let start = if self.config.align_to_minute {
            Instant::now() + until_next_minute(Utc::now())
        } else {
            Instant::now()
        };
        let mut interval = tokio::time::interval_at(start, self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    // Already surfaced through health and hooks.
                    if let Err(e) = self.tick(Utc::now()).await {
                        debug!(error = %e, "Tick failed");
                    }
                }
            }
        }

        self.stop(workers).await;
    }

    async fn worker(self: Arc<Self>, index: usize, shutdown: CancellationToken) {
        debug!(worker = index, "Worker started");
        loop {
            let job = {
                let mut rx = self.jobs_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { break };
            self.executor.run(&job.task, job.entry).await;
        }
        debug!(worker = index, "Worker stopped");
    }

    async fn stop(&self, mut workers: JoinSet<()>) {
        info!("Scheduler stopping");

        {
            let mut rx = self.jobs_rx.lock().await;
            while let Ok(job) = rx.try_recv() {
                debug!(task_id = %job.task.id, run_id = job.entry.id, "Abandoning queued run");
                self.executor.abandon(&job.entry).await;
            }
        }

        let grace = self.config.shutdown_grace();
        let joined = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            // Killed children stay in flight until the next startup reconciles them.
            warn!(grace_secs = grace.as_secs(), "Runs still active after shutdown grace, killing");
            workers.shutdown().await;
        }

        self.health_tx.send_replace(SchedulerHealth::Stopped);
        self.hooks.emit(SchedulerEvent::SchedulerStopped);
    }
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let next = frequency::truncate_to_minute(now) + chrono::Duration::minutes(1);
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
