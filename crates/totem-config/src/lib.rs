use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use totem_types::CommandInfo;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "TOTEM_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Scheduler loop, worker pool and executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Delay the first tick until the next wall-clock minute boundary.
    #[serde(default = "default_true")]
    pub align_to_minute: bool,
    /// Number of workers, i.e. the cap on concurrent executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Capacity of the bounded dispatch queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Timeout applied to tasks that do not set their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Upper bound on captured output, truncation marker included.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Number of recent completed runs averaged into `average_runtime`.
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    /// How long to keep reading output pipes after the process exited or was killed.
    #[serde(default = "default_output_drain_grace_ms")]
    pub output_drain_grace_ms: u64,
    /// How long shutdown waits for running tasks before killing them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_stats_window() -> usize {
    20
}

fn default_output_drain_grace_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn output_drain_grace(&self) -> Duration {
        Duration::from_millis(self.output_drain_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            align_to_minute: true,
            max_concurrent: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
            default_timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            stats_window: default_stats_window(),
            output_drain_grace_ms: default_output_drain_grace_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `~/.totem/totem.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// What happens to a task's run history when the task is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Keep history for audit; entries keep the dangling task id.
    #[default]
    Retain,
    /// Delete completed history together with the task.
    Cascade,
}

/// A command available to tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Shown when choosing a command for a task.
    #[serde(default)]
    pub description: String,
    /// Program to execute.
    pub program: String,
    /// Arguments placed before the task's own arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Top-level totem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotemConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Run history policy on task deletion.
    #[serde(default)]
    pub on_delete: DeletePolicy,
    /// Accept task commands that are not in `commands` (run as `PATH` programs).
    #[serde(default = "default_true")]
    pub allow_unregistered_commands: bool,
    /// Timezone offered for new tasks.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Named commands.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandConfig>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for TotemConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
            on_delete: DeletePolicy::default(),
            allow_unregistered_commands: true,
            default_timezone: default_timezone(),
            commands: BTreeMap::new(),
        }
    }
}

impl TotemConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.path {
            Some(path) => Ok(path.clone()),
            None => Ok(ensure_config_dir()?.join("totem.db")),
        }
    }
}

/// Immutable registry of named commands, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandConfig>,
    allow_unregistered: bool,
}

impl CommandRegistry {
    pub fn new(commands: BTreeMap<String, CommandConfig>, allow_unregistered: bool) -> Self {
        Self {
            commands,
            allow_unregistered,
        }
    }

    pub fn from_config(config: &TotemConfig) -> Self {
        Self::new(config.commands.clone(), config.allow_unregistered_commands)
    }

    /// Commands offered for task create/edit, sorted by name.
    pub fn list_available_commands(&self) -> Vec<CommandInfo> {
        self.commands
            .iter()
            .map(|(name, cmd)| CommandInfo {
                name: name.clone(),
                description: cmd.description.clone(),
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn allows_unregistered(&self) -> bool {
        self.allow_unregistered
    }

    /// Program and full argument list for a task command.
    ///
    /// Registered names expand to their program and registered arguments;
    /// anything else is taken as a program name.
    pub fn resolve(&self, name: &str, task_args: &[String]) -> (String, Vec<String>) {
        match self.commands.get(name) {
            Some(cmd) => {
                let mut args = cmd.args.clone();
                args.extend(task_args.iter().cloned());
                (cmd.program.clone(), args)
            }
            None => (name.to_string(), task_args.to_vec()),
        }
    }
}

/// Resolve the totem config directory (~/.totem/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".totem"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path: `$TOTEM_CONFIG`, else ~/.totem/config.json5.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<TotemConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<TotemConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(TotemConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TotemConfig = json5::from_str(&content)?;
    tracing::debug!(
        commands = config.commands.len(),
        "Loaded config from {}",
        path.display()
    );
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}
