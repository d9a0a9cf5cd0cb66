mod app;
mod daemon;
mod tasks;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use totem_cron::TaskSort;

use crate::app::App;
use crate::tasks::{EditArgs, FormArgs};

#[derive(Parser)]
#[command(name = "totem", about = "Cron-style task scheduler with run history")]
struct Cli {
    /// Config file (defaults to $TOTEM_CONFIG or ~/.totem/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs and command output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// List the commands tasks can run
    Commands,
    /// List the supported frequency forms
    Frequencies,
    /// List timezone names
    Timezones {
        /// Case-insensitive substring filter
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Check configuration and storage
    Health,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List tasks with their last run and average runtime
    List {
        /// Case-insensitive description search
        #[arg(short, long)]
        search: Option<String>,

        /// Only enabled tasks
        #[arg(long, conflicts_with = "disabled")]
        enabled: bool,

        /// Only disabled tasks
        #[arg(long)]
        disabled: bool,

        /// description, last_ran_at or average_runtime
        #[arg(long, default_value = "description")]
        sort: TaskSort,

        /// Sort descending
        #[arg(long)]
        desc: bool,
    },
    /// Show a task with its run history
    Show {
        id: String,

        /// Number of history entries to show
        #[arg(long, default_value_t = 20)]
        history: usize,
    },
    /// Create a task
    Add(FormArgs),
    /// Edit a task; omitted options keep their current value
    Edit(EditArgs),
    /// Delete a task
    Delete { id: String },
    /// Execute a task now, outside its schedule
    Run { id: String },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => totem_config::load_config_from(path)?,
        None => totem_config::load_config()?,
    };
    let json = cli.json;

    match cli.command {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = App::open(config)?;
                daemon::run_daemon(app, json).await
            })?;
        }
        Commands::Task(command) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = App::open(config)?;
                match command {
                    TaskCommand::List {
                        search,
                        enabled,
                        disabled,
                        sort,
                        desc,
                    } => {
                        let only = match (enabled, disabled) {
                            (true, _) => Some(true),
                            (_, true) => Some(false),
                            _ => None,
                        };
                        tasks::list(&app, search, only, sort, desc, json).await
                    }
                    TaskCommand::Show { id, history } => tasks::show(&app, &id, history, json).await,
                    TaskCommand::Add(args) => tasks::add(&app, args, json).await,
                    TaskCommand::Edit(args) => tasks::edit(&app, args, json).await,
                    TaskCommand::Delete { id } => tasks::delete(&app, &id).await,
                    TaskCommand::Run { id } => tasks::run_now(&app, &id, json).await,
                }
            })?;
        }
        Commands::Commands => {
            let registry = totem_config::CommandRegistry::from_config(&config);
            let commands = registry.list_available_commands();
            if json {
                println!("{}", serde_json::to_string_pretty(&commands)?);
            } else if commands.is_empty() {
                println!("No commands registered.");
                if registry.allows_unregistered() {
                    println!("Tasks may run any program on PATH.");
                }
            } else {
                for cmd in commands {
                    println!("{:<20} {}", cmd.name, cmd.description);
                }
            }
        }
        Commands::Frequencies => {
            let catalog = totem_cron::catalog();
            if json {
                println!("{}", serde_json::to_string_pretty(catalog)?);
            } else {
                for kind in catalog {
                    println!("{:<24} {:<28} e.g. {}", kind.label, kind.syntax, kind.example);
                }
            }
        }
        Commands::Timezones { filter } => {
            let filter = filter.map(|f| f.to_lowercase());
            let names: Vec<&str> = chrono_tz::TZ_VARIANTS
                .iter()
                .map(|tz| tz.name())
                .filter(|name| {
                    filter
                        .as_deref()
                        .is_none_or(|f| name.to_lowercase().contains(f))
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        Commands::Health => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let app = App::open(config)?;
                app.print_health(json).await
            })?;
        }
    }

    Ok(())
}
