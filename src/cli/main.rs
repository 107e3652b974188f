//! CLI binary entry point for data-load

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use data_load_engine::cli::commands::args::{ArgsArgs, handle_args};
#[cfg(feature = "cli")]
use data_load_engine::cli::commands::names::{NamesArgs, handle_names};
#[cfg(all(feature = "cli", feature = "postgres-backend"))]
use data_load_engine::cli::commands::trigger::{TriggerAction, TriggerArgs, handle_trigger};
#[cfg(all(feature = "cli", feature = "duckdb-backend"))]
use data_load_engine::cli::commands::window::{WindowAction, WindowArgs, handle_window};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "data-load")]
#[command(about = "Stage naming, audit triggers and permission windows for data loads")]
#[command(version)]
struct Cli {
    /// Directory holding .data-load.toml (default: current directory)
    #[arg(short, long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Resolve the physical database and table names of a stage
    Names {
        /// Live database name of the load
        root: String,
        /// Stage (raw, staging, live, archive)
        stage: String,
        /// Logical table name
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Inspect and manage the audit trigger of a live table
    #[cfg(feature = "postgres-backend")]
    Trigger {
        #[arg(value_enum)]
        action: TriggerActionArg,
        /// Live table name
        #[arg(short, long)]
        table: String,
        /// Schema of the live table (default: configured schema or session default)
        #[arg(short, long)]
        schema: Option<String>,
        /// Connection string (default: configured connection string)
        #[arg(long)]
        connection_string: Option<String>,
    },

    /// Manage permission windows in the engine store
    #[cfg(feature = "duckdb-backend")]
    Window {
        #[command(subcommand)]
        command: WindowCommands,
    },

    /// Print the command line of a data load execution
    Args {
        /// Load metadata id
        #[arg(long)]
        load_metadata: u64,
        /// Check instead of run
        #[arg(long)]
        check: bool,
        #[arg(long)]
        iterative: bool,
        #[arg(long)]
        days_to_load: Option<u32>,
        /// Stage to stop after (raw, staging, live)
        #[arg(long)]
        stop_after: Option<String>,
        /// Explicit load date (yyyy-mm-dd)
        #[arg(long)]
        explicit_date: Option<String>,
        #[arg(long, requires = "logging_server")]
        logging_database: Option<String>,
        #[arg(long, requires = "logging_database")]
        logging_server: Option<String>,
    },
}

#[cfg(all(feature = "cli", feature = "postgres-backend"))]
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TriggerActionArg {
    Status,
    Create,
    Drop,
    Sync,
    Enable,
    Disable,
    /// Drop, extend the archive table, create
    Recreate,
}

#[cfg(all(feature = "cli", feature = "postgres-backend"))]
impl From<TriggerActionArg> for TriggerAction {
    fn from(action: TriggerActionArg) -> Self {
        match action {
            TriggerActionArg::Status => TriggerAction::Status,
            TriggerActionArg::Create => TriggerAction::Create,
            TriggerActionArg::Drop => TriggerAction::Drop,
            TriggerActionArg::Sync => TriggerAction::Sync,
            TriggerActionArg::Enable => TriggerAction::Enable,
            TriggerActionArg::Disable => TriggerAction::Disable,
            TriggerActionArg::Recreate => TriggerAction::Recreate,
        }
    }
}

#[cfg(all(feature = "cli", feature = "duckdb-backend"))]
#[derive(Subcommand)]
enum WindowCommands {
    /// List windows with their periods and lock state
    List,
    /// Define a new window
    Add {
        name: String,
        /// Period, e.g. "Mon 09:00-17:00" or "2024-01-01T00:00:00Z/2024-01-02T00:00:00Z"
        #[arg(short, long = "period")]
        periods: Vec<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Show whether a window would admit a run now
    Check { id: String },
    /// Release a lock held by HOLDER
    Release { id: String, holder: String },
    /// Release a lock whoever holds it
    ForceRelease { id: String },
}

#[cfg(feature = "cli")]
fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("DATA_LOAD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(feature = "cli")]
fn main() {
    init_tracing();
    let cli = Cli::parse();
    let config_dir = cli.config_dir;

    let result = match cli.command {
        Commands::Names { root, stage, table } => handle_names(&NamesArgs {
            root,
            stage,
            table,
            config_dir,
        }),
        #[cfg(feature = "postgres-backend")]
        Commands::Trigger {
            action,
            table,
            schema,
            connection_string,
        } => handle_trigger(&TriggerArgs {
            action: action.into(),
            table,
            schema,
            connection_string,
            config_dir,
        }),
        #[cfg(feature = "duckdb-backend")]
        Commands::Window { command } => {
            let action = match command {
                WindowCommands::List => WindowAction::List,
                WindowCommands::Add {
                    name,
                    periods,
                    description,
                } => WindowAction::Add {
                    name,
                    description,
                    periods,
                },
                WindowCommands::Check { id } => WindowAction::Check { id },
                WindowCommands::Release { id, holder } => WindowAction::Release { id, holder },
                WindowCommands::ForceRelease { id } => WindowAction::ForceRelease { id },
            };
            handle_window(&WindowArgs { action, config_dir })
        }
        Commands::Args {
            load_metadata,
            check,
            iterative,
            days_to_load,
            stop_after,
            explicit_date,
            logging_database,
            logging_server,
        } => handle_args(&ArgsArgs {
            check,
            load_metadata,
            iterative,
            days_to_load,
            stop_after,
            explicit_date,
            logging_database,
            logging_server,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
