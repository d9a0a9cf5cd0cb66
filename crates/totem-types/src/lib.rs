use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Unique task identifier (a UUID string, immutable after creation).
pub type TaskId = String;

/// Unique run log entry identifier.
pub type RunId = i64;

// ──────────────────── Task Types ────────────────────

/// The command a task runs: a registered command name (or a program on
/// `PATH`) followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Registered command name or program.
    pub name: String,
    /// Arguments appended after any registered arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.arguments {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// A recurrence rule, evaluated against the local wall-clock minute of the
/// task's timezone.
///
/// The rule carries no memory of previous evaluations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frequency {
    /// Due when the minutes elapsed since local midnight are a multiple of `n`.
    EveryMinutes { n: u32 },
    /// Due once an hour at the given minute.
    HourlyAt { minute: u32 },
    /// Due once a day at the given local time.
    DailyAt { hour: u32, minute: u32 },
    /// Due once a week on `day` at the given local time.
    WeeklyOn { day: Weekday, hour: u32, minute: u32 },
    /// Due once a month on day-of-month `day`. Months shorter than `day`
    /// are skipped.
    MonthlyOn { day: u32, hour: u32, minute: u32 },
    /// A 5- or 6-field cron expression.
    Cron { expression: String },
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::EveryMinutes { n: 1 } => f.write_str("every minute"),
            Frequency::EveryMinutes { n } => write!(f, "every {n} minutes"),
            Frequency::HourlyAt { minute } => write!(f, "hourly at {minute}"),
            Frequency::DailyAt { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Frequency::WeeklyOn { day, hour, minute } => write!(
                f,
                "weekly on {} at {hour:02}:{minute:02}",
                weekday_name(*day)
            ),
            Frequency::MonthlyOn { day, hour, minute } => {
                write!(f, "monthly on {day} at {hour:02}:{minute:02}")
            }
            Frequency::Cron { expression } => write!(f, "cron {expression}"),
        }
    }
}

/// Lowercase English name of a weekday, as used in frequency text.
pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Automatic cleanup of a task's completed run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "keep", content = "count", rename_all = "snake_case")]
pub enum Retention {
    /// Keep only the newest `n` completed runs.
    Runs(u32),
    /// Drop completed runs that started more than `n` days ago.
    Days(u32),
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retention::Runs(n) => write!(f, "runs:{n}"),
            Retention::Days(n) => write!(f, "days:{n}"),
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub command: CommandSpec,
    pub frequency: Frequency,
    /// Zone the frequency is interpreted in.
    pub timezone: Tz,
    /// Disabled tasks are never evaluated for due-ness.
    pub enabled: bool,
    /// Per-task timeout override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated, storage-ready fields of a task, used for both create and update.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFields {
    pub description: String,
    pub command: CommandSpec,
    pub frequency: Frequency,
    pub timezone: Tz,
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    pub retention: Option<Retention>,
}

impl From<&Task> for TaskFields {
    fn from(task: &Task) -> Self {
        Self {
            description: task.description.clone(),
            command: task.command.clone(),
            frequency: task.frequency.clone(),
            timezone: task.timezone,
            enabled: task.enabled,
            timeout_secs: task.timeout_secs,
            retention: task.retention,
        }
    }
}

/// Listing filter for the task store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks with this enabled flag.
    pub enabled: Option<bool>,
    /// Case-insensitive substring match on the description.
    pub search: Option<String>,
}

impl TaskFilter {
    /// Filter matching only enabled tasks, as scanned by the scheduler.
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            search: None,
        }
    }
}

// ──────────────────── Run Log Types ────────────────────

/// How an execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitStatus {
    /// The process exited with a status code.
    Exited(i32),
    /// The process was terminated by a signal it did not handle.
    Signaled,
    /// The executor killed the process after its timeout elapsed.
    TimedOut,
    /// The executor could not run the command (spawn failure, I/O error).
    ExecutorError,
    /// The entry was left in flight by a previous process and reconciled.
    Abandoned,
}

/// Classification of a non-successful [`ExitStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    Timeout,
    Executor,
    Abandoned,
}

impl ExitStatus {
    /// Stable storage name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ExitStatus::Exited(_) => "exited",
            ExitStatus::Signaled => "signaled",
            ExitStatus::TimedOut => "timed_out",
            ExitStatus::ExecutorError => "executor_error",
            ExitStatus::Abandoned => "abandoned",
        }
    }

    /// Exit code, for [`ExitStatus::Exited`] only.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Rebuild a status from its stored kind and code.
    pub fn from_parts(kind: &str, code: Option<i32>) -> Option<Self> {
        match (kind, code) {
            ("exited", Some(code)) => Some(ExitStatus::Exited(code)),
            ("signaled", _) => Some(ExitStatus::Signaled),
            ("timed_out", _) => Some(ExitStatus::TimedOut),
            ("executor_error", _) => Some(ExitStatus::ExecutorError),
            ("abandoned", _) => Some(ExitStatus::Abandoned),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            ExitStatus::Exited(0) => None,
            ExitStatus::Exited(_) | ExitStatus::Signaled => Some(FailureKind::Execution),
            ExitStatus::TimedOut => Some(FailureKind::Timeout),
            ExitStatus::ExecutorError => Some(FailureKind::Executor),
            ExitStatus::Abandoned => Some(FailureKind::Abandoned),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Executor => "executor",
            FailureKind::Abandoned => "abandoned",
        })
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit {code}"),
            ExitStatus::Signaled => f.write_str("killed by signal"),
            ExitStatus::TimedOut => f.write_str("timed out"),
            ExitStatus::ExecutorError => f.write_str("executor error"),
            ExitStatus::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// One attempt to execute a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: RunId,
    /// Owning task. A weak reference: the task may since have been deleted.
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    /// `None` while the run is in flight.
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the run is in flight.
    pub exit_status: Option<ExitStatus>,
    /// Captured stdout and stderr, size-bounded.
    #[serde(default)]
    pub output: String,
}

impl RunLogEntry {
    pub fn is_in_flight(&self) -> bool {
        self.finished_at.is_none()
    }

    /// Wall-clock runtime of a completed entry.
    pub fn runtime(&self) -> Option<Duration> {
        let finished = self.finished_at?;
        (finished - self.started_at).to_std().ok()
    }
}

/// A new in-flight entry to append to the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunEntry {
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
}

/// Fields written when a run log entry completes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub finished_at: DateTime<Utc>,
    pub exit_status: ExitStatus,
    pub output: String,
}

/// Derived statistics for a task, computed from its run log on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Start time of the most recent completed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ran_at: Option<DateTime<Utc>>,
    /// Mean runtime over the most recent completed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_runtime: Option<Duration>,
}

/// A task together with its derived statistics, as shown in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: Task,
    pub stats: TaskStats,
}

// ──────────────────── Command Registry Types ────────────────────

/// A command offered on task create/edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
}
