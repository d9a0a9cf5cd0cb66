//! Derived task statistics, computed from the run log on read.

use std::time::Duration;

use totem_storage::RunLogStore;
use totem_types::{RunLogEntry, TaskStats};

use crate::error::Result;

/// Statistics over a task's completed entries.
///
/// `last_ran_at` is the newest start time; `average_runtime` the mean
/// runtime of all entries given. In-flight entries are ignored.
pub fn compute_stats(entries: &[RunLogEntry]) -> TaskStats {
    let completed: Vec<(&RunLogEntry, Duration)> = entries
        .iter()
        .filter_map(|e| e.runtime().map(|runtime| (e, runtime)))
        .collect();

    if completed.is_empty() {
        return TaskStats::default();
    }

    let last_ran_at = completed.iter().map(|(e, _)| e.started_at).max();
    let total: Duration = completed.iter().map(|(_, runtime)| *runtime).sum();
    TaskStats {
        last_ran_at,
        average_runtime: Some(total / completed.len() as u32),
    }
}

/// Statistics over the task's `window` most recent completed runs.
pub async fn task_stats(
    run_log: &dyn RunLogStore,
    task_id: &str,
    window: usize,
) -> Result<TaskStats> {
    let recent = run_log.recent_completed(task_id, window.max(1)).await?;
    Ok(compute_stats(&recent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use totem_storage::TotemStorage;
    use totem_types::{ExitStatus, NewRunEntry, RunCompletion};

    fn start(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap()
    }

    fn completed(id: i64, started_at: DateTime<Utc>, secs: i64) -> RunLogEntry {
        RunLogEntry {
            id,
            task_id: "t1".into(),
            started_at,
            finished_at: Some(started_at + ChronoDuration::seconds(secs)),
            exit_status: Some(ExitStatus::Exited(0)),
            output: String::new(),
        }
    }

    #[test]
    fn test_no_runs_has_no_stats() {
        assert_eq!(compute_stats(&[]), TaskStats::default());
    }

    #[test]
    fn test_average_excludes_in_flight() {
        let in_flight = RunLogEntry {
            id: 4,
            task_id: "t1".into(),
            started_at: start(30),
            finished_at: None,
            exit_status: None,
            output: String::new(),
        };
        let entries = vec![
            completed(1, start(0), 10),
            completed(2, start(10), 20),
            completed(3, start(20), 30),
            in_flight,
        ];

        let stats = compute_stats(&entries);
        assert_eq!(stats.average_runtime, Some(Duration::from_secs(20)));
        assert_eq!(stats.last_ran_at, Some(start(20)));
    }

    #[test]
    fn test_failed_runs_count() {
        let mut failed = completed(2, start(5), 4);
        failed.exit_status = Some(ExitStatus::TimedOut);
        let stats = compute_stats(&[completed(1, start(0), 2), failed]);
        assert_eq!(stats.average_runtime, Some(Duration::from_secs(3)));
        assert_eq!(stats.last_ran_at, Some(start(5)));
    }

    #[tokio::test]
    async fn test_task_stats_uses_window() {
        let storage = TotemStorage::open_in_memory().unwrap();
        // Oldest first: 100s, then 10s, 20s, 30s.
        for (minute, secs) in [(0, 100), (10, 10), (20, 20), (30, 30)] {
            let id = storage
                .append(&NewRunEntry {
                    task_id: "t1".into(),
                    started_at: start(minute),
                })
                .await
                .unwrap();
            storage
                .complete(
                    id,
                    &RunCompletion {
                        finished_at: start(minute) + ChronoDuration::seconds(secs),
                        exit_status: ExitStatus::Exited(0),
                        output: String::new(),
                    },
                )
                .await
                .unwrap();
        }
        // An in-flight run does not affect the stats.
        storage
            .append(&NewRunEntry {
                task_id: "t1".into(),
                started_at: start(40),
            })
            .await
            .unwrap();

        let stats = task_stats(&storage, "t1", 3).await.unwrap();
        assert_eq!(stats.average_runtime, Some(Duration::from_secs(20)));
        assert_eq!(stats.last_ran_at, Some(start(30)));

        let empty = task_stats(&storage, "other", 3).await.unwrap();
        assert_eq!(empty, TaskStats::default());
    }
}
