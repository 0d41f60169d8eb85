use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod commands;
mod config;

use commands::compile_stats::CompileStatsCommand;
use commands::disasm::DisasmCommand;
use commands::routines::RoutinesCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(name = "quill", version, about = "Quill Z-machine runner")]
struct Cli {
    /// Configuration file (default: nearest quill.toml or .quillrc.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a story over stdin/stdout
    Run(RunCommand),
    /// Disassemble discovered routines
    Disasm(DisasmCommand),
    /// List discovered routines
    Routines(RoutinesCommand),
    /// Compile every discovered routine and print statistics
    CompileStats(CompileStatsCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    match &cli.command {
        Commands::Run(command) => command.run(&config),
        Commands::Disasm(command) => command.run(&config),
        Commands::Routines(command) => command.run(&config),
        Commands::CompileStats(command) => command.run(&config),
    }
}
