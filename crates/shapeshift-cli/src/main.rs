mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "shapeshift",
    version,
    about = "Harmonize source entities into a linked target schema"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a project and write the resulting tables
    Run {
        /// Path to project YAML file
        project: PathBuf,
        /// Only run this entity and what it depends on
        #[arg(long)]
        entity: Option<String>,
        /// Directory output tables are written to
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Dispatcher used for output (csv, jsonl)
        #[arg(long, default_value = "csv")]
        format: String,
        /// Also write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate project configuration without loading data
    Check {
        /// Path to project YAML file
        project: PathBuf,
    },
    /// Print the order entities would be processed in
    Order {
        /// Path to project YAML file
        project: PathBuf,
        /// Only show this entity and what it depends on
        #[arg(long)]
        entity: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            project,
            entity,
            output_dir,
            format,
            report,
        } => commands::run::execute(
            &project,
            entity.as_deref(),
            &output_dir,
            &format,
            report.as_deref(),
        ),
        Commands::Check { project } => commands::check::execute(&project),
        Commands::Order { project, entity } => {
            commands::order::execute(&project, entity.as_deref())
        }
    }
}
