mod app;
mod bridge;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "autobrowse")]
#[command(about = "Run browser automation tasks on demand or on a schedule", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore schedules and run them until Ctrl-C
    Daemon,

    /// Serve JSON-lines commands on stdin/stdout while the scheduler runs
    Bridge,

    /// Manage browser profiles
    Browser {
        #[command(subcommand)]
        command: BrowserCommands,
    },

    /// Manage and run tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Manage schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Manage the package cache
    Deps {
        #[command(subcommand)]
        command: DepsCommands,
    },
}

#[derive(Subcommand)]
enum BrowserCommands {
    /// Create a browser profile
    Create {
        /// Profile name
        name: String,
        /// Browser engine (chrome, edge)
        #[arg(long)]
        engine: Option<String>,
        /// Browser executable path
        #[arg(long)]
        executable: Option<String>,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
        /// Proxy server, e.g. socks5://127.0.0.1:1080
        #[arg(long)]
        proxy: Option<String>,
        /// User agent override
        #[arg(long)]
        user_agent: Option<String>,
        /// Browser locale, e.g. en-US
        #[arg(long)]
        locale: Option<String>,
    },
    /// List browser profiles
    List,
    /// Open a browser and keep it running until Ctrl-C
    Open { id: String },
    /// Close a browser
    Close { id: String },
    /// Show a profile's status
    Status { id: String },
    /// Delete a profile and its data
    Delete { id: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a task from a Rhai script
    Add {
        /// Task name
        #[arg(long)]
        name: String,
        /// Script file defining `fn run(params)`
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        description: Option<String>,
        /// JSON file with the parameter schema
        #[arg(long)]
        params_schema: Option<PathBuf>,
        /// Package requirement (name or name@range), repeatable
        #[arg(long = "dep")]
        deps: Vec<String>,
        /// Reset browser state after every run
        #[arg(long)]
        restore: bool,
        /// Cache results by parameters
        #[arg(long)]
        cache: bool,
        /// Script timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List tasks
    List,
    /// Show a task and its recent executions
    Show { id: String },
    /// Run a task and wait for it to finish
    Run {
        id: String,
        /// Browser profile id
        #[arg(short, long)]
        browser: String,
        /// JSON parameters
        #[arg(short, long)]
        params: Option<String>,
        /// Stream logs and progress
        #[arg(short, long)]
        follow: bool,
    },
    /// Delete a task
    Delete { id: String },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Schedule a task. Immediate unless a delay, interval or cron rule is given
    Add {
        #[arg(long)]
        task: String,
        #[arg(long)]
        browser: String,
        #[arg(long)]
        name: Option<String>,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        #[arg(long, conflicts_with_all = ["interval_ms", "cron"])]
        delay_ms: Option<i64>,
        #[arg(long, conflicts_with = "cron")]
        interval_ms: Option<i64>,
        /// Cron expression (5, 6 or 7 fields)
        #[arg(long)]
        cron: Option<String>,
        /// IANA timezone for cron rules
        #[arg(long)]
        tz: Option<String>,
        #[arg(long)]
        max_iterations: Option<u64>,
        #[arg(long)]
        max_executions: Option<u64>,
        /// RFC 3339 start time
        #[arg(long)]
        start_at: Option<String>,
        /// RFC 3339 end time
        #[arg(long)]
        end_at: Option<String>,
    },
    /// List schedules
    List,
    Pause { id: String },
    Resume { id: String },
    Delete { id: String },
    /// Fire a schedule once now
    Run { id: String },
}

#[derive(Subcommand)]
enum DepsCommands {
    /// Check which requirements the cache satisfies
    Check { requirements: Vec<String> },
    /// Install requirements into the cache
    Install {
        requirements: Vec<String>,
        /// Task the packages are installed for
        #[arg(long)]
        task: Option<String>,
        /// Reinstall even when cached
        #[arg(long)]
        force: bool,
    },
    /// Remove install workspaces
    Cleanup {
        /// Only this task's workspace, releasing its cache references
        #[arg(long)]
        task: Option<String>,
        /// Evict unreferenced entries over the cache bounds afterwards
        #[arg(long)]
        evict: bool,
    },
    /// Show cache statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout belongs to command output and the bridge protocol
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Daemon => commands::daemon::run().await?,
        Commands::Bridge => commands::daemon::bridge().await?,

        Commands::Browser { command } => match command {
            BrowserCommands::Create {
                name,
                engine,
                executable,
                headed,
                proxy,
                user_agent,
                locale,
            } => {
                commands::browser::create(commands::browser::CreateOptions {
                    name,
                    engine,
                    executable,
                    headed,
                    proxy,
                    user_agent,
                    locale,
                })
                .await?;
            }
            BrowserCommands::List => commands::browser::list().await?,
            BrowserCommands::Open { id } => commands::browser::open(id).await?,
            BrowserCommands::Close { id } => commands::browser::close(id).await?,
            BrowserCommands::Status { id } => commands::browser::status(id).await?,
            BrowserCommands::Delete { id } => commands::browser::delete(id).await?,
        },

        Commands::Task { command } => match command {
            TaskCommands::Add {
                name,
                script,
                description,
                params_schema,
                deps,
                restore,
                cache,
                timeout,
            } => {
                commands::task::add(commands::task::AddOptions {
                    name,
                    script,
                    description,
                    params_schema,
                    deps,
                    restore,
                    cache,
                    timeout_secs: timeout,
                })
                .await?;
            }
            TaskCommands::List => commands::task::list().await?,
            TaskCommands::Show { id } => commands::task::show(id).await?,
            TaskCommands::Run {
                id,
                browser,
                params,
                follow,
            } => commands::task::run(id, browser, params, follow).await?,
            TaskCommands::Delete { id } => commands::task::delete(id).await?,
        },

        Commands::Schedule { command } => match command {
            ScheduleCommands::Add {
                task,
                browser,
                name,
                params,
                delay_ms,
                interval_ms,
                cron,
                tz,
                max_iterations,
                max_executions,
                start_at,
                end_at,
            } => {
                commands::schedule::add(commands::schedule::AddOptions {
                    task,
                    browser,
                    name,
                    params,
                    delay_ms,
                    interval_ms,
                    cron,
                    timezone: tz,
                    max_iterations,
                    max_executions,
                    start_at,
                    end_at,
                })
                .await?;
            }
            ScheduleCommands::List => commands::schedule::list().await?,
            ScheduleCommands::Pause { id } => commands::schedule::pause(id).await?,
            ScheduleCommands::Resume { id } => commands::schedule::resume(id).await?,
            ScheduleCommands::Delete { id } => commands::schedule::delete(id).await?,
            ScheduleCommands::Run { id } => commands::schedule::run(id).await?,
        },

        Commands::Deps { command } => match command {
            DepsCommands::Check { requirements } => commands::deps::check(requirements).await?,
            DepsCommands::Install {
                requirements,
                task,
                force,
            } => commands::deps::install(requirements, task, force).await?,
            DepsCommands::Cleanup { task, evict } => commands::deps::cleanup(task, evict).await?,
            DepsCommands::Stats => commands::deps::stats().await?,
        },
    }

    Ok(())
}
