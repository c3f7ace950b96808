// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `synth`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "synth",
    version,
    about = "Run shell commands from a declarative flow of triggers.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SYNTH_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a flow from the configuration file.
    Run {
        /// The flow to execute.
        #[arg(default_value = "default", value_name = "FLOW")]
        flow: String,

        /// Path to the config file (YAML).
        ///
        /// If omitted, `synth.yaml` is searched upwards from the current
        /// directory.
        #[arg(long, value_name = "PATH", env = "SYNTHFILE")]
        config: Option<PathBuf>,

        /// Replace every restart/watch trigger with a one-shot trigger, so
        /// the flow runs to completion and exits.
        #[arg(long)]
        once: bool,

        /// Parse + validate, print the flow, but don't execute any commands.
        #[arg(long)]
        dry_run: bool,

        /// Print the flow as a Mermaid flowchart and exit.
        #[arg(long)]
        mermaid: bool,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
