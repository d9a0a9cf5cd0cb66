use std::time::Duration;

use anyhow::Result;
use clap::Args;

use totem_cron::{TaskForm, TaskSort};
use totem_types::{RunLogEntry, TaskFilter, TaskSummary};

use crate::app::App;

#[derive(Args)]
pub struct FormArgs {
    /// What the task does
    #[arg(short, long)]
    description: String,

    /// Registered command name, or a program on PATH
    #[arg(short, long)]
    command: String,

    /// Argument passed to the command (repeatable)
    #[arg(short = 'a', long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// e.g. "every 5 minutes", "daily at 02:00", "cron 0 * * * *"
    #[arg(short, long)]
    frequency: String,

    /// IANA timezone the frequency is evaluated in
    #[arg(short, long)]
    timezone: Option<String>,

    /// Create the task disabled
    #[arg(long)]
    disabled: bool,

    /// Kill the command after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// History cleanup: runs:N or days:N
    #[arg(long)]
    retention: Option<String>,
}

impl From<FormArgs> for TaskForm {
    fn from(args: FormArgs) -> Self {
        TaskForm {
            description: args.description,
            command: args.command,
            arguments: args.args,
            frequency: args.frequency,
            timezone: args.timezone,
            enabled: !args.disabled,
            timeout_secs: args.timeout,
            retention: args.retention,
        }
    }
}

#[derive(Args)]
pub struct EditArgs {
    id: String,

    #[arg(short, long)]
    description: Option<String>,

    #[arg(short, long)]
    command: Option<String>,

    /// Replace the argument list (repeatable)
    #[arg(short = 'a', long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Remove all arguments
    #[arg(long, conflicts_with = "args")]
    clear_args: bool,

    #[arg(short, long)]
    frequency: Option<String>,

    #[arg(short, long)]
    timezone: Option<String>,

    #[arg(long, conflicts_with = "disable")]
    enable: bool,

    #[arg(long)]
    disable: bool,

    #[arg(long)]
    timeout: Option<u64>,

    /// Fall back to the default timeout
    #[arg(long, conflicts_with = "timeout")]
    clear_timeout: bool,

    #[arg(long)]
    retention: Option<String>,

    /// Keep all history
    #[arg(long, conflicts_with = "retention")]
    clear_retention: bool,
}

impl EditArgs {
    fn apply(self, form: &mut TaskForm) {
        if let Some(description) = self.description {
            form.description = description;
        }
        if let Some(command) = self.command {
            form.command = command;
        }
        if self.clear_args {
            form.arguments.clear();
        } else if !self.args.is_empty() {
            form.arguments = self.args;
        }
        if let Some(frequency) = self.frequency {
            form.frequency = frequency;
        }
        if self.timezone.is_some() {
            form.timezone = self.timezone;
        }
        if self.enable {
            form.enabled = true;
        }
        if self.disable {
            form.enabled = false;
        }
        if self.clear_timeout {
            form.timeout_secs = None;
        } else if self.timeout.is_some() {
            form.timeout_secs = self.timeout;
        }
        if self.clear_retention {
            form.retention = None;
        } else if self.retention.is_some() {
            form.retention = self.retention;
        }
    }
}

pub async fn list(
    app: &App,
    search: Option<String>,
    enabled: Option<bool>,
    sort: TaskSort,
    descending: bool,
    json: bool,
) -> Result<()> {
    let filter = TaskFilter { enabled, search };
    let summaries = app.service.list_with_stats(&filter, sort, descending).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<30}  {:<26}  {:<20}  {:>9}",
        "ID", "DESCRIPTION", "FREQUENCY", "LAST RUN", "AVG"
    );
    for TaskSummary { task, stats } in &summaries {
        let description = if task.enabled {
            task.description.clone()
        } else {
            format!("{} (disabled)", task.description)
        };
        println!(
            "{:<36}  {:<30}  {:<26}  {:<20}  {:>9}",
            task.id,
            description,
            task.frequency.to_string(),
            stats
                .last_ran_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".into()),
            format_runtime(stats.average_runtime),
        );
    }
    Ok(())
}

pub async fn show(app: &App, id: &str, history: usize, json: bool) -> Result<()> {
    let details = app.service.show(id, history).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }

    let task = &details.summary.task;
    let stats = &details.summary.stats;
    println!("{}", task.description);
    println!("  id:          {}", task.id);
    println!("  command:     {}", task.command);
    println!("  frequency:   {} ({})", task.frequency, task.timezone);
    println!("  enabled:     {}", task.enabled);
    if let Some(timeout) = task.timeout_secs {
        println!("  timeout:     {timeout}s");
    }
    if let Some(retention) = task.retention {
        println!("  retention:   {retention}");
    }
    println!(
        "  last run:    {}",
        stats
            .last_ran_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into())
    );
    println!("  avg runtime: {}", format_runtime(stats.average_runtime));

    if details.history.is_empty() {
        println!("\nNo runs yet.");
    } else {
        println!("\nHistory:");
        for entry in &details.history {
            println!("  {}", format_entry(entry));
        }
    }
    Ok(())
}

pub async fn add(app: &App, args: FormArgs, json: bool) -> Result<()> {
    let task = app.service.store(&args.into()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Task created successfully. ({})", task.id);
    }
    Ok(())
}

pub async fn edit(app: &App, args: EditArgs, json: bool) -> Result<()> {
    let current = app.service.get(&args.id).await?;
    let id = current.id.clone();
    let mut form = TaskForm::from(&current);
    args.apply(&mut form);

    let task = app.service.update(&id, &form).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Task updated successfully.");
    }
    Ok(())
}

pub async fn delete(app: &App, id: &str) -> Result<()> {
    app.service.destroy(id).await?;
    println!("Task deleted successfully.");
    Ok(())
}

pub async fn run_now(app: &App, id: &str, json: bool) -> Result<()> {
    let entry = app.service.run_now(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }
    println!("{}", format_entry(&entry));
    if !entry.output.is_empty() {
        print!("{}", entry.output);
        if !entry.output.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn format_runtime(runtime: Option<Duration>) -> String {
    match runtime {
        Some(d) => format!("{:.2}s", d.as_secs_f64()),
        None => "-".into(),
    }
}

fn format_entry(entry: &RunLogEntry) -> String {
    let started = entry.started_at.format("%Y-%m-%d %H:%M:%S");
    match &entry.exit_status {
        Some(status) => {
            let line = format!(
                "#{} {started}  {status}  {}",
                entry.id,
                format_runtime(entry.runtime())
            );
            match status.failure() {
                Some(kind) => format!("{line}  FAILED ({kind})"),
                None => line,
            }
        }
        None => format!("#{} {started}  running", entry.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use totem_types::ExitStatus;

    #[test]
    fn test_format_runtime() {
        assert_eq!(format_runtime(Some(Duration::from_millis(1500))), "1.50s");
        assert_eq!(format_runtime(None), "-");
    }

    #[test]
    fn test_format_entry() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let mut entry = RunLogEntry {
            id: 7,
            task_id: "t1".into(),
            started_at,
            finished_at: None,
            exit_status: None,
            output: String::new(),
        };
        assert_eq!(format_entry(&entry), "#7 2024-01-01 02:00:00  running");

        entry.finished_at = Some(started_at + chrono::Duration::seconds(3));
        entry.exit_status = Some(ExitStatus::TimedOut);
        assert_eq!(
            format_entry(&entry),
            "#7 2024-01-01 02:00:00  timed out  3.00s  FAILED (timeout)"
        );

        entry.exit_status = Some(ExitStatus::Exited(0));
        assert_eq!(format_entry(&entry), "#7 2024-01-01 02:00:00  exit 0  3.00s");
    }

    #[test]
    fn test_edit_args_apply() {
        let mut form = TaskForm {
            description: "old".into(),
            command: "echo".into(),
            arguments: vec!["a".into()],
            frequency: "hourly".into(),
            timezone: Some("UTC".into()),
            enabled: true,
            timeout_secs: Some(10),
            retention: Some("runs:5".into()),
        };
        let args = EditArgs {
            id: "t1".into(),
            description: Some("new".into()),
            command: None,
            args: vec![],
            clear_args: true,
            frequency: None,
            timezone: None,
            enable: false,
            disable: true,
            timeout: None,
            clear_timeout: true,
            retention: None,
            clear_retention: false,
        };
        args.apply(&mut form);
        assert_eq!(form.description, "new");
        assert!(form.arguments.is_empty());
        assert!(!form.enabled);
        assert_eq!(form.timeout_secs, None);
        assert_eq!(form.retention.as_deref(), Some("runs:5"));
        assert_eq!(form.frequency, "hourly");
    }
}
