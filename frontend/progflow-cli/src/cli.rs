use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "progflow", about = "Validate and run engagement programs")]
pub struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, env = "PROGFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `logging.level`; `RUST_LOG` still wins.
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check program definitions without running them.
    Validate {
        /// Program file or directory of program files.
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Run one program to completion.
    Run {
        /// Program file or directory of program files.
        path: PathBuf,
        /// Program id to run when `path` holds more than one program.
        #[arg(long)]
        program: Option<String>,
        /// Version to run when several versions are loaded.
        #[arg(long)]
        version: Option<u32>,
        /// JSON file holding a run request (tenant, variables, events).
        #[arg(long)]
        context: Option<PathBuf>,
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long)]
        user: Option<String>,
        /// Run variable as `name=value`; the value is parsed as JSON when possible.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// Event name made visible to user_action triggers.
        #[arg(long = "event")]
        events: Vec<String>,
        /// Keep the full event trace and print it after the run.
        #[arg(long)]
        debug: bool,
        /// Print trace events as they happen.
        #[arg(long)]
        follow: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// List registered step, trigger and action types.
    Handlers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
