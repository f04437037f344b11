// src/cli.rs

//! CLI argument parsing using `clap` (derive).

use clap::{Parser, ValueEnum};

/// Command-line arguments for `probuild`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "probuild",
    version,
    about = "Discover how to build a project by probing its source tree.",
    long_about = None
)]
pub struct CliArgs {
    /// Source tree root to scan.
    #[arg(value_name = "DIR", default_value = ".")]
    pub root: String,

    /// Path to the config file (TOML), resolved inside the source root.
    #[arg(long, value_name = "PATH", default_value = "Probuild.toml")]
    pub config: String,

    /// Maximum number of actions running at once.
    ///
    /// Defaults to `options.jobs` from the config, or the CPU count.
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Output directory for derived files and installed binaries.
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output: Option<String>,

    /// Keep running after convergence and rebuild as files change.
    #[arg(long)]
    pub watch: bool,

    /// Progress rendering.
    #[arg(long, value_enum, value_name = "KIND", default_value = "text")]
    pub dashboard: DashboardKind,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PROBUILD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Scan and report what would run, without executing anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum DashboardKind {
    Text,
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
