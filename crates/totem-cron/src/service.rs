//! Task management operations: create/edit with validation, delete under the
//! configured history policy, listings with derived statistics, manual runs.

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use totem_config::{CommandRegistry, DeletePolicy, TotemConfig};
use totem_storage::{RunLogStore, TaskStore};
use totem_types::{
    CommandInfo, CommandSpec, Retention, RunLogEntry, Task, TaskFields, TaskFilter, TaskStats,
    TaskSummary,
};

use crate::error::{Result, SchedulerError, ValidationError};
use crate::executor::TaskExecutor;
use crate::frequency::{self, FrequencyKind};
use crate::stats;

/// Unvalidated task input as entered on create/edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskForm {
    pub description: String,
    /// Registered command name, or a program when unregistered commands are allowed.
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Frequency text, e.g. `daily at 02:00`.
    pub frequency: String,
    /// IANA zone name; the configured default when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// `runs:N` or `days:N`.
    #[serde(default)]
    pub retention: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl From<&Task> for TaskForm {
    fn from(task: &Task) -> Self {
        Self {
            description: task.description.clone(),
            command: task.command.name.clone(),
            arguments: task.command.arguments.clone(),
            frequency: task.frequency.to_string(),
            timezone: Some(task.timezone.name().to_string()),
            enabled: task.enabled,
            timeout_secs: task.timeout_secs,
            retention: task.retention.map(|r| r.to_string()),
        }
    }
}

/// Sort key for task listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskSort {
    #[default]
    Description,
    LastRanAt,
    AverageRuntime,
}

impl FromStr for TaskSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "description" => Ok(TaskSort::Description),
            "last_ran_at" | "last-ran-at" => Ok(TaskSort::LastRanAt),
            "average_runtime" | "average-runtime" => Ok(TaskSort::AverageRuntime),
            other => Err(format!(
                "unknown sort '{other}', expected description, last_ran_at or average_runtime"
            )),
        }
    }
}

/// A task with its statistics and recent history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDetails {
    #[serde(flatten)]
    pub summary: TaskSummary,
    /// Newest first, in-flight entry included.
    pub history: Vec<RunLogEntry>,
}

pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
    run_log: Arc<dyn RunLogStore>,
    executor: Arc<TaskExecutor>,
    registry: Arc<CommandRegistry>,
    on_delete: DeletePolicy,
    stats_window: usize,
    default_timezone: Tz,
}

impl TaskService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        run_log: Arc<dyn RunLogStore>,
        executor: Arc<TaskExecutor>,
        registry: Arc<CommandRegistry>,
        config: &TotemConfig,
    ) -> Result<Self> {
        Ok(Self {
            tasks,
            run_log,
            executor,
            registry,
            on_delete: config.on_delete,
            stats_window: config.scheduler.stats_window,
            default_timezone: frequency::parse_timezone(&config.default_timezone)?,
        })
    }

    /// Validate a form into storage-ready fields.
    pub fn validate(&self, form: &TaskForm) -> std::result::Result<TaskFields, ValidationError> {
        let description = form.description.trim();
        if description.is_empty() {
            return Err(ValidationError::Description);
        }

        let command = form.command.trim();
        if command.is_empty() {
            return Err(ValidationError::Command("command must not be empty".into()));
        }
        if !self.registry.contains(command) && !self.registry.allows_unregistered() {
            return Err(ValidationError::Command(format!(
                "'{command}' is not a registered command"
            )));
        }

        let frequency = frequency::parse(&form.frequency)?;
        let timezone = match form.timezone.as_deref() {
            Some(name) if !name.trim().is_empty() => frequency::parse_timezone(name)?,
            _ => self.default_timezone,
        };
        if form.timeout_secs == Some(0) {
            return Err(ValidationError::Timeout);
        }
        let retention = form.retention.as_deref().map(parse_retention).transpose()?;

        Ok(TaskFields {
            description: description.to_string(),
            command: CommandSpec::new(command, form.arguments.clone()),
            frequency,
            timezone,
            enabled: form.enabled,
            timeout_secs: form.timeout_secs,
            retention,
        })
    }

    /// Create a task.
    pub async fn store(&self, form: &TaskForm) -> Result<Task> {
        let fields = self.validate(form)?;
        let task = self.tasks.store(fields).await?;
        info!(task_id = %task.id, description = %task.description, "Task created");
        Ok(task)
    }

    /// Replace a task's fields. Changes apply from the next tick.
    pub async fn update(&self, id: &str, form: &TaskForm) -> Result<Task> {
        let fields = self.validate(form)?;
        let task = self
            .tasks
            .update(id, fields)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        info!(task_id = %task.id, "Task updated");
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// A task with its stats and up to `history_limit` newest run log entries.
    pub async fn show(&self, id: &str, history_limit: usize) -> Result<TaskDetails> {
        let task = self.get(id).await?;
        let stats = self.stats(id).await?;
        let history = self.run_log.history(id, history_limit).await?;
        Ok(TaskDetails {
            summary: TaskSummary { task, stats },
            history,
        })
    }

    /// Delete a task.
    ///
    /// A run in progress is not interrupted; it completes into the run log.
    /// Completed history is kept or removed according to the delete policy.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        if !self.tasks.destroy(id).await? {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        match self.on_delete {
            DeletePolicy::Retain => info!(task_id = %id, "Task deleted, history retained"),
            DeletePolicy::Cascade => {
                let removed = self.run_log.delete_for_task(id).await?;
                info!(task_id = %id, removed, "Task deleted with its history");
            }
        }
        Ok(())
    }

    /// Tasks matching `filter` with their derived statistics.
    ///
    /// Tasks that never ran sort last in either direction.
    pub async fn list_with_stats(
        &self,
        filter: &TaskFilter,
        sort: TaskSort,
        descending: bool,
    ) -> Result<Vec<TaskSummary>> {
        let tasks = self.tasks.list(filter).await?;
        let mut summaries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let stats = self.stats(&task.id).await?;
            summaries.push(TaskSummary { task, stats });
        }
        sort_summaries(&mut summaries, sort, descending);
        Ok(summaries)
    }

    pub async fn stats(&self, id: &str) -> Result<TaskStats> {
        stats::task_stats(self.run_log.as_ref(), id, self.stats_window).await
    }

    /// Execute a task immediately, regardless of its schedule or enabled
    /// flag. Refused while the task has a run in flight.
    pub async fn run_now(&self, id: &str) -> Result<RunLogEntry> {
        let task = self.get(id).await?;
        info!(task_id = %task.id, "Manual run requested");
        self.executor.execute(&task).await
    }

    pub fn list_available_commands(&self) -> Vec<CommandInfo> {
        self.registry.list_available_commands()
    }

    pub fn frequencies(&self) -> &'static [FrequencyKind] {
        frequency::catalog()
    }
}

/// Parse `runs:N` or `days:N` with N at least 1.
pub fn parse_retention(text: &str) -> std::result::Result<Retention, ValidationError> {
    let invalid = || ValidationError::Retention(text.to_string());
    let (kind, count) = text.trim().split_once(':').ok_or_else(invalid)?;
    let count: u32 = count.trim().parse().map_err(|_| invalid())?;
    if count == 0 {
        return Err(invalid());
    }
    match kind.trim().to_ascii_lowercase().as_str() {
        "runs" => Ok(Retention::Runs(count)),
        "days" => Ok(Retention::Days(count)),
        _ => Err(invalid()),
    }
}

fn sort_summaries(summaries: &mut [TaskSummary], sort: TaskSort, descending: bool) {
    summaries.sort_by(|a, b| {
        let by_description = || {
            a.task
                .description
                .to_lowercase()
                .cmp(&b.task.description.to_lowercase())
        };
        match sort {
            TaskSort::Description if descending => by_description().reverse(),
            TaskSort::Description => by_description(),
            TaskSort::LastRanAt => {
                compare_present_first(a.stats.last_ran_at, b.stats.last_ran_at, descending)
                    .then_with(by_description)
            }
            TaskSort::AverageRuntime => compare_present_first(
                a.stats.average_runtime,
                b.stats.average_runtime,
                descending,
            )
            .then_with(by_description),
        }
    });
}

fn compare_present_first<T: Ord>(a: Option<T>, b: Option<T>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if descending => b.cmp(&a),
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use totem_config::CommandConfig;
    use totem_hooks::HookRegistry;
    use totem_storage::TotemStorage;
    use totem_types::{ExitStatus, Frequency, NewRunEntry, RunCompletion};

    fn service_with(storage: &TotemStorage, config: TotemConfig) -> TaskService {
        let registry = Arc::new(CommandRegistry::from_config(&config));
        let executor = Arc::new(TaskExecutor::new(
            registry.clone(),
            Arc::new(storage.clone()),
            Arc::new(HookRegistry::new()),
            &config.scheduler,
        ));
        TaskService::new(
            Arc::new(storage.clone()),
            Arc::new(storage.clone()),
            executor,
            registry,
            &config,
        )
        .unwrap()
    }

    fn service(storage: &TotemStorage) -> TaskService {
        service_with(storage, TotemConfig::default())
    }

    fn form(description: &str) -> TaskForm {
        TaskForm {
            description: description.to_string(),
            command: "echo".into(),
            arguments: vec!["hi".into()],
            frequency: "daily at 02:00".into(),
            timezone: None,
            enabled: true,
            timeout_secs: None,
            retention: None,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    async fn completed_run(storage: &TotemStorage, task_id: &str, minute: u32, secs: i64) {
        let id = storage
            .append(&NewRunEntry {
                task_id: task_id.to_string(),
                started_at: at(minute),
            })
            .await
            .unwrap();
        storage
            .complete(
                id,
                &RunCompletion {
                    finished_at: at(minute) + chrono::Duration::seconds(secs),
                    exit_status: ExitStatus::Exited(0),
                    output: String::new(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_validates_and_applies_defaults() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let config = TotemConfig {
            default_timezone: "Europe/Berlin".into(),
            ..Default::default()
        };
        let svc = service_with(&storage, config);

        let mut input = form("  Nightly backup  ");
        input.retention = Some("runs:10".into());
        let task = svc.store(&input).await.unwrap();

        assert_eq!(task.description, "Nightly backup");
        assert_eq!(task.frequency, Frequency::DailyAt { hour: 2, minute: 0 });
        assert_eq!(task.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(task.retention, Some(Retention::Runs(10)));
        assert_eq!(svc.get(&task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);

        let cases: Vec<(TaskForm, fn(&ValidationError) -> bool)> = vec![
            (form("   "), |e| matches!(e, ValidationError::Description)),
            (
                TaskForm {
                    frequency: "every 0 minutes".into(),
                    ..form("a")
                },
                |e| matches!(e, ValidationError::Frequency { .. }),
            ),
            (
                TaskForm {
                    timezone: Some("Atlantis/Lost".into()),
                    ..form("a")
                },
                |e| matches!(e, ValidationError::Timezone(_)),
            ),
            (
                TaskForm {
                    command: " ".into(),
                    ..form("a")
                },
                |e| matches!(e, ValidationError::Command(_)),
            ),
            (
                TaskForm {
                    timeout_secs: Some(0),
                    ..form("a")
                },
                |e| matches!(e, ValidationError::Timeout),
            ),
            (
                TaskForm {
                    retention: Some("forever".into()),
                    ..form("a")
                },
                |e| matches!(e, ValidationError::Retention(_)),
            ),
        ];
        for (input, expected) in cases {
            match svc.store(&input).await {
                Err(SchedulerError::Validation(e)) => assert!(expected(&e), "unexpected {e:?}"),
                other => panic!("Expected validation error for {input:?}, got {other:?}"),
            }
        }
        // Nothing was persisted.
        assert!(storage.list(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_command_rejected_when_disallowed() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            "backup".to_string(),
            CommandConfig {
                description: "Run backups".into(),
                program: "/usr/local/bin/backup".into(),
                args: vec![],
            },
        );
        let config = TotemConfig {
            allow_unregistered_commands: false,
            commands,
            ..Default::default()
        };
        let svc = service_with(&storage, config);

        let err = svc.store(&form("echo")).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Validation(ValidationError::Command(_))
        ));

        let ok = TaskForm {
            command: "backup".into(),
            ..form("backup")
        };
        assert!(svc.store(&ok).await.is_ok());
        assert_eq!(svc.list_available_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_not_found() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);
        let task = svc.store(&form("before")).await.unwrap();

        let mut edit = TaskForm::from(&task);
        edit.description = "after".into();
        edit.frequency = "every 15 minutes".into();
        let updated = svc.update(&task.id, &edit).await.unwrap();
        assert_eq!(updated.description, "after");
        assert_eq!(updated.frequency, Frequency::EveryMinutes { n: 15 });
        assert_eq!(updated.created_at, task.created_at);

        assert!(matches!(
            svc.update("missing", &edit).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(svc.get("missing").await, Err(SchedulerError::NotFound(_))));
        assert!(matches!(svc.destroy("missing").await, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_destroy_retains_history_by_default() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);
        let task = svc.store(&form("keep")).await.unwrap();
        completed_run(&storage, &task.id, 0, 5).await;

        svc.destroy(&task.id).await.unwrap();
        assert!(storage.get(&task.id).await.unwrap().is_none());
        assert_eq!(storage.history(&task.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_cascade_keeps_in_flight_run() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let config = TotemConfig {
            on_delete: DeletePolicy::Cascade,
            ..Default::default()
        };
        let svc = service_with(&storage, config);
        let task = svc.store(&form("drop")).await.unwrap();
        completed_run(&storage, &task.id, 0, 5).await;
        storage
            .append(&NewRunEntry {
                task_id: task.id.clone(),
                started_at: at(10),
            })
            .await
            .unwrap();

        svc.destroy(&task.id).await.unwrap();
        let history = storage.history(&task.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_in_flight());
    }

    #[tokio::test]
    async fn test_list_with_stats_sorting() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);
        let slow = svc.store(&form("Slow")).await.unwrap();
        let fast = svc.store(&form("fast")).await.unwrap();
        let never = svc.store(&form("Never ran")).await.unwrap();
        completed_run(&storage, &slow.id, 0, 60).await;
        completed_run(&storage, &fast.id, 5, 2).await;

        let ids = |summaries: Vec<TaskSummary>| -> Vec<String> {
            summaries.into_iter().map(|s| s.task.id).collect()
        };

        let by_name = svc
            .list_with_stats(&TaskFilter::default(), TaskSort::Description, false)
            .await
            .unwrap();
        assert_eq!(ids(by_name), vec![fast.id.clone(), never.id.clone(), slow.id.clone()]);

        let by_runtime = svc
            .list_with_stats(&TaskFilter::default(), TaskSort::AverageRuntime, true)
            .await
            .unwrap();
        assert_eq!(by_runtime[0].stats.average_runtime, Some(Duration::from_secs(60)));
        assert_eq!(ids(by_runtime), vec![slow.id.clone(), fast.id.clone(), never.id.clone()]);

        let by_last_ran = svc
            .list_with_stats(&TaskFilter::default(), TaskSort::LastRanAt, false)
            .await
            .unwrap();
        assert_eq!(ids(by_last_ran), vec![slow.id.clone(), fast.id.clone(), never.id.clone()]);

        let filtered = svc
            .list_with_stats(
                &TaskFilter {
                    search: Some("FAST".into()),
                    ..Default::default()
                },
                TaskSort::Description,
                false,
            )
            .await
            .unwrap();
        assert_eq!(ids(filtered), vec![fast.id]);
    }

    #[tokio::test]
    async fn test_show_includes_history() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);
        let task = svc.store(&form("shown")).await.unwrap();
        completed_run(&storage, &task.id, 0, 10).await;
        completed_run(&storage, &task.id, 1, 30).await;

        let details = svc.show(&task.id, 1).await.unwrap();
        assert_eq!(details.history.len(), 1);
        assert_eq!(details.history[0].started_at, at(1));
        assert_eq!(details.summary.stats.average_runtime, Some(Duration::from_secs(20)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_now_executes_disabled_task() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);
        let mut input = form("manual");
        input.enabled = false;
        let task = svc.store(&input).await.unwrap();

        let entry = svc.run_now(&task.id).await.unwrap();
        assert_eq!(entry.exit_status, Some(ExitStatus::Exited(0)));
        assert_eq!(entry.output, "hi\n");

        storage
            .append(&NewRunEntry {
                task_id: task.id.clone(),
                started_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(matches!(
            svc.run_now(&task.id).await,
            Err(SchedulerError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn test_parse_retention() {
        assert_eq!(parse_retention("runs:5"), Ok(Retention::Runs(5)));
        assert_eq!(parse_retention(" Days: 30 "), Ok(Retention::Days(30)));
        for bad in ["runs", "runs:0", "weeks:2", "days:-1", ""] {
            assert!(parse_retention(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_task_sort_from_str() {
        assert_eq!("last_ran_at".parse::<TaskSort>(), Ok(TaskSort::LastRanAt));
        assert!("priority".parse::<TaskSort>().is_err());
    }

    #[test]
    fn test_frequencies_catalog() {
        let storage = TotemStorage::open_in_memory().unwrap();
        let svc = service(&storage);
        assert!(svc.frequencies().iter().any(|k| k.kind == "cron"));
    }
}
