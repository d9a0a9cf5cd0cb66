//! Task executor: runs one task's command as a child process and records
//! the outcome in the run log.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use totem_config::{CommandRegistry, SchedulerConfig};
use totem_hooks::{HookRegistry, SchedulerEvent};
use totem_storage::{RunLogStore, StorageError};
use totem_types::{ExitStatus, NewRunEntry, RunCompletion, RunLogEntry, Task};

use crate::error::Result;

/// Appended to output cut at the size limit.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Attempts made to write a completion before giving up on the entry.
const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_BACKOFF: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 8 * 1024;

/// Runs task commands and owns the run log lifecycle of each attempt:
/// append in flight, execute, complete, prune.
pub struct TaskExecutor {
    registry: Arc<CommandRegistry>,
    run_log: Arc<dyn RunLogStore>,
    hooks: Arc<HookRegistry>,
    default_timeout: Duration,
    max_output_bytes: usize,
    drain_grace: Duration,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<CommandRegistry>,
        run_log: Arc<dyn RunLogStore>,
        hooks: Arc<HookRegistry>,
        config: &SchedulerConfig,
    ) -> Self {
        let mut max_output_bytes = config.max_output_bytes;
        if max_output_bytes < TRUNCATION_MARKER.len() {
            warn!(
                configured = max_output_bytes,
                minimum = TRUNCATION_MARKER.len(),
                "max_output_bytes too small to hold the truncation marker, raising it"
            );
            max_output_bytes = TRUNCATION_MARKER.len();
        }
        Self {
            registry,
            run_log,
            hooks,
            default_timeout: config.default_timeout(),
            max_output_bytes,
            drain_grace: config.output_drain_grace(),
        }
    }

    /// Append an in-flight entry for `task`.
    ///
    /// Fails with [`StorageError::AlreadyRunning`] if the task already has
    /// one; the check and the insert are a single atomic write.
    pub async fn begin(
        &self,
        task: &Task,
        started_at: DateTime<Utc>,
    ) -> std::result::Result<RunLogEntry, StorageError> {
        let id = self
            .run_log
            .append(&NewRunEntry {
                task_id: task.id.clone(),
                started_at,
            })
            .await?;
        Ok(RunLogEntry {
            id,
            task_id: task.id.clone(),
            started_at,
            finished_at: None,
            exit_status: None,
            output: String::new(),
        })
    }

    /// Execute `task` for an entry returned by [`TaskExecutor::begin`] and
    /// complete it.
    ///
    /// Never fails: every failure mode ends up as the entry's exit status.
    pub async fn run(&self, task: &Task, entry: RunLogEntry) -> RunLogEntry {
        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        info!(task_id = %task.id, run_id = entry.id, command = %task.command, "Running task");
        let (exit_status, output) = self.spawn_and_wait(task, timeout).await;

        let completion = RunCompletion {
            finished_at: Utc::now(),
            exit_status,
            output,
        };
        self.record_completion(entry.id, &completion).await;

        if let Some(retention) = task.retention {
            match self.run_log.prune(&task.id, retention, completion.finished_at).await {
                Ok(0) => {}
                Ok(removed) => debug!(task_id = %task.id, removed, %retention, "Pruned run history"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to prune run history"),
            }
        }

        let completed = RunLogEntry {
            finished_at: Some(completion.finished_at),
            exit_status: Some(completion.exit_status),
            output: completion.output,
            ..entry
        };
        self.hooks.emit(SchedulerEvent::RunCompleted {
            task_id: completed.task_id.clone(),
            run_id: completed.id,
            exit_status: completion.exit_status,
            runtime_ms: completed
                .runtime()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        });
        completed
    }

    /// Begin and run `task` now, outside the schedule.
    pub async fn execute(&self, task: &Task) -> Result<RunLogEntry> {
        let entry = self.begin(task, Utc::now()).await?;
        Ok(self.run(task, entry).await)
    }

    /// Complete an entry that was appended but will never run.
    pub async fn abandon(&self, entry: &RunLogEntry) {
        let completion = RunCompletion {
            finished_at: Utc::now(),
            exit_status: ExitStatus::Abandoned,
            output: "scheduler stopped before the run started".to_string(),
        };
        self.record_completion(entry.id, &completion).await;
    }

    async fn record_completion(&self, run_id: i64, completion: &RunCompletion) {
        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.run_log.complete(run_id, completion).await {
                Ok(true) => return,
                Ok(false) => {
                    warn!(run_id, "Run log entry was no longer in flight");
                    return;
                }
                Err(e) if attempt < COMPLETE_ATTEMPTS => {
                    warn!(run_id, attempt, error = %e, "Failed to complete run log entry, retrying");
                    tokio::time::sleep(COMPLETE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    // Left in flight; reconciled as abandoned on next startup.
                    error!(run_id, error = %e, "Giving up on completing run log entry");
                }
            }
        }
    }

    async fn spawn_and_wait(&self, task: &Task, timeout: Duration) -> (ExitStatus, String) {
        let (program, args) = self
            .registry
            .resolve(&task.command.name, &task.command.arguments);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %task.id, %program, error = %e, "Failed to spawn task command");
                return (
                    ExitStatus::ExecutorError,
                    truncate_output(&format!("failed to spawn '{program}': {e}"), self.max_output_bytes),
                );
            }
        };

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.max_output_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, buffer.clone())));
        }

        let exit_status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status
                .code()
                .map(ExitStatus::Exited)
                .unwrap_or(ExitStatus::Signaled),
            Ok(Err(e)) => {
                let _ = child.kill().await;
                lock(&buffer).note(&format!("\nexecutor error: {e}"));
                ExitStatus::ExecutorError
            }
            Err(_) => {
                warn!(task_id = %task.id, timeout_secs = timeout.as_secs(), "Task timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(task_id = %task.id, error = %e, "Failed to kill timed out task");
                }
                ExitStatus::TimedOut
            }
        };

        // Grandchildren may hold the pipes open; stop reading after the grace period.
        let drained = tokio::time::timeout(self.drain_grace, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(task_id = %task.id, "Output pipes still open after grace period");
            for reader in &readers {
                reader.abort();
            }
        }

        let output = lock(&buffer).render();
        (exit_status, output)
    }
}

/// Combined stdout/stderr, in arrival order, capped at `limit` bytes.
struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn note(&mut self, message: &str) {
        self.push(message.as_bytes());
    }

    fn render(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        if self.truncated || text.len() > self.limit {
            mark_truncated(&text, self.limit)
        } else {
            text.into_owned()
        }
    }
}

fn lock(buffer: &Mutex<OutputBuffer>) -> std::sync::MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(|e| e.into_inner())
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<OutputBuffer>>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            // Keep reading past the limit so the child never blocks on a full pipe.
            Ok(n) => lock(&buffer).push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// Bound `text` to `max` bytes, ending in [`TRUNCATION_MARKER`] when cut.
///
/// A cut is always marked: a `max` shorter than the marker yields the marker
/// alone.
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        mark_truncated(text, max)
    }
}

fn mark_truncated(text: &str, max: usize) -> String {
    let keep = floor_char_boundary(text, max.saturating_sub(TRUNCATION_MARKER.len()));
    format!("{}{TRUNCATION_MARKER}", &text[..keep])
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use totem_config::CommandConfig;
    use totem_storage::TotemStorage;
    use totem_types::{CommandSpec, Frequency, Retention};

    fn task(id: &str, program: &str, args: &[&str]) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            description: format!("task {id}"),
            command: CommandSpec::new(program, args.iter().map(|a| a.to_string()).collect()),
            frequency: Frequency::EveryMinutes { n: 1 },
            timezone: chrono_tz::UTC,
            enabled: true,
            timeout_secs: None,
            retention: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn executor_with(
        storage: &TotemStorage,
        registry: CommandRegistry,
        max_output_bytes: usize,
    ) -> TaskExecutor {
        let config = SchedulerConfig {
            max_output_bytes,
            output_drain_grace_ms: 200,
            ..Default::default()
        };
        TaskExecutor::new(
            Arc::new(registry),
            Arc::new(storage.clone()),
            Arc::new(HookRegistry::new()),
            &config,
        )
    }

    fn executor(storage: &TotemStorage) -> TaskExecutor {
        executor_with(storage, CommandRegistry::new(BTreeMap::new(), true), 64 * 1024)
    }

    #[test]
    fn test_truncate_output_bounds() {
        assert_eq!(truncate_output("short", 100), "short");

        let long = "x".repeat(500);
        let cut = truncate_output(&long, 100);
        assert_eq!(cut.len(), 100);
        assert!(cut.ends_with(TRUNCATION_MARKER));

        // Never splits a multi-byte character.
        let wide = "é".repeat(100);
        let cut = truncate_output(&wide, 51);
        assert!(cut.len() <= 51);
        assert!(cut.ends_with(TRUNCATION_MARKER));

        // Too small for any text: the cut is still marked.
        assert_eq!(truncate_output(&long, 10), TRUNCATION_MARKER);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tiny_output_limit_still_marks_truncation() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor_with(&storage, CommandRegistry::new(BTreeMap::new(), true), 10);

        let entry = exec
            .execute(&task("t1", "sh", &["-c", "printf 'x%.0s' $(seq 1 500)"]))
            .await
            .unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::Exited(0)));
        assert!(entry.output.ends_with(TRUNCATION_MARKER));
        assert!(entry.output.len() <= TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_output_buffer_keeps_prefix() {
        let mut buffer = OutputBuffer::new(64);
        buffer.push(b"first line\n");
        buffer.push(&[b'y'; 200]);
        let text = buffer.render();
        assert!(text.starts_with("first line\n"));
        assert!(text.len() <= 64);
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_records_success() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);

        let entry = exec.execute(&task("t1", "echo", &["hello"])).await.unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::Exited(0)));
        assert_eq!(entry.output, "hello\n");
        assert!(!entry.is_in_flight());

        let stored = storage.get_run(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.exit_status, Some(ExitStatus::Exited(0)));
        assert_eq!(stored.output, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_records_failure_and_stderr() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);

        let entry = exec
            .execute(&task("t1", "sh", &["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::Exited(3)));
        assert!(entry.output.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);
        let mut slow = task("t1", "sleep", &["10"]);
        slow.timeout_secs = Some(1);

        let entry = exec.execute(&slow).await.unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::TimedOut));
        // timeout + drain grace, with a second of slack for process teardown
        let bound = Duration::from_secs(1) + Duration::from_millis(200) + Duration::from_secs(1);
        let stored = storage.get_run(entry.id).await.unwrap().unwrap();
        let runtime = stored.runtime().unwrap();
        assert!(runtime >= Duration::from_millis(990), "runtime {runtime:?}");
        assert!(runtime < bound, "runtime {runtime:?}");
        assert!(storage.latest_in_flight("t1").await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_executor_error() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);

        let entry = exec
            .execute(&task("t1", "totem-no-such-program-xyz", &[]))
            .await
            .unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::ExecutorError));
        assert!(entry.output.contains("totem-no-such-program-xyz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_output_is_truncated() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor_with(&storage, CommandRegistry::new(BTreeMap::new(), true), 100);

        let entry = exec
            .execute(&task("t1", "sh", &["-c", "yes | head -c 100000"]))
            .await
            .unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::Exited(0)));
        assert!(entry.output.len() <= 100);
        assert!(entry.output.ends_with(TRUNCATION_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registered_command_expands() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            "greet".to_string(),
            CommandConfig {
                description: "Say hi".into(),
                program: "echo".into(),
                args: vec!["hi".into()],
            },
        );
        let exec = executor_with(&storage, CommandRegistry::new(commands, false), 1024);

        let entry = exec.execute(&task("t1", "greet", &["there"])).await.unwrap();
        assert_eq!(entry.output, "hi there\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_begin_rejects_second_in_flight() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);
        let t = task("t1", "true", &[]);

        let first = exec.begin(&t, Utc::now()).await.unwrap();
        let err = exec.begin(&t, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyRunning { .. }));

        // A manual run is refused as well.
        assert!(matches!(
            exec.execute(&t).await,
            Err(crate::error::SchedulerError::AlreadyRunning(_))
        ));

        exec.run(&t, first).await;
        assert!(exec.execute(&t).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retention_prunes_after_run() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);
        let mut t = task("t1", "true", &[]);
        t.retention = Some(Retention::Runs(2));

        for _ in 0..4 {
            exec.execute(&t).await.unwrap();
        }
        assert_eq!(storage.history("t1", 10).await.unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandon_completes_entry() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let exec = executor(&storage);
        let t = task("t1", "true", &[]);

        let entry = exec.begin(&t, Utc::now()).await.unwrap();
        exec.abandon(&entry).await;
        let stored = storage.get_run(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.exit_status, Some(ExitStatus::Abandoned));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_emits_completion_event() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let hooks = Arc::new(HookRegistry::new());
        let mut events = hooks.subscribe();
        let exec = TaskExecutor::new(
            Arc::new(CommandRegistry::new(BTreeMap::new(), true)),
            Arc::new(storage.clone()),
            hooks,
            &SchedulerConfig::default(),
        );

        let entry = exec.execute(&task("t1", "false", &[])).await.unwrap();
        match events.recv().await.unwrap() {
            SchedulerEvent::RunCompleted {
                task_id,
                run_id,
                exit_status,
                ..
            } => {
                assert_eq!(task_id, "t1");
                assert_eq!(run_id, entry.id);
                assert_eq!(exit_status, ExitStatus::Exited(1));
            }
            other => panic!("Expected RunCompleted, got {other:?}"),
        }
    }
}
