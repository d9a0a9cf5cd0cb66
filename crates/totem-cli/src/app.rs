use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use totem_config::{CommandRegistry, TotemConfig};
use totem_cron::{Scheduler, TaskExecutor, TaskService};
use totem_hooks::HookRegistry;
use totem_storage::{RunLogStore, TaskStore, TotemStorage};
use totem_types::TaskFilter;

/// Everything a command needs, wired from the loaded config.
pub struct App {
    pub config: TotemConfig,
    pub storage: TotemStorage,
    pub hooks: Arc<HookRegistry>,
    pub executor: Arc<TaskExecutor>,
    pub service: TaskService,
}

impl App {
    pub fn open(config: TotemConfig) -> Result<Self> {
        let db_path = config.database_path()?;
        let storage = TotemStorage::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        let registry = Arc::new(CommandRegistry::from_config(&config));
        let hooks = Arc::new(HookRegistry::new());
        let executor = Arc::new(TaskExecutor::new(
            registry.clone(),
            Arc::new(storage.clone()),
            hooks.clone(),
            &config.scheduler,
        ));
        let service = TaskService::new(
            Arc::new(storage.clone()),
            Arc::new(storage.clone()),
            executor.clone(),
            registry,
            &config,
        )
        .context("Invalid default_timezone in config")?;

        Ok(Self {
            config,
            storage,
            hooks,
            executor,
            service,
        })
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            Arc::new(self.storage.clone()),
            Arc::new(self.storage.clone()),
            self.executor.clone(),
            self.hooks.clone(),
            self.config.scheduler.clone(),
        ))
    }

    pub async fn print_health(&self, json: bool) -> Result<()> {
        let db_path = self.config.database_path()?;
        let tasks = self
            .storage
            .list(&TaskFilter::default())
            .await
            .context("Task store unavailable")?;
        let enabled = tasks.iter().filter(|t| t.enabled).count();
        let mut running = Vec::new();
        for task in &tasks {
            if let Some(entry) = self.storage.latest_in_flight(&task.id).await? {
                running.push((task.description.clone(), entry.started_at));
            }
        }

        if json {
            let report = json!({
                "status": "ok",
                "database": db_path,
                "tasks": tasks.len(),
                "enabled": enabled,
                "running": running
                    .iter()
                    .map(|(description, started_at)| json!({
                        "description": description,
                        "started_at": started_at,
                    }))
                    .collect::<Vec<_>>(),
                "max_concurrent": self.config.scheduler.max_concurrent,
                "commands": self.config.commands.len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("totem is healthy");
            println!("  database: {}", db_path.display());
            println!("  tasks: {} ({enabled} enabled)", tasks.len());
            println!("  running now: {}", running.len());
            for (description, started_at) in &running {
                println!("    {description} (since {started_at})");
            }
            println!("  max concurrent: {}", self.config.scheduler.max_concurrent);
            println!("  registered commands: {}", self.config.commands.len());
        }
        Ok(())
    }
}
