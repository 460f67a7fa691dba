//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};

/// Run tasks in a pool of child processes.
#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run copies of a built-in task through a pool.
    Run(RunArgs),

    /// List the built-in tasks.
    Tasks,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Name of the task (see `forkpool tasks`).
    pub task: String,

    /// Task arguments as JSON.
    #[arg(short, long, default_value = "null")]
    pub args: String,

    /// Number of copies to run.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,

    /// Maximum number of concurrent children.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Per-task timeout in seconds.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Cap on each task's encoded result, in bytes.
    #[arg(long)]
    pub max_output: Option<usize>,

    /// Run tasks inline instead of in child processes.
    #[arg(long)]
    pub sync: bool,
}

impl Cli {
    /// Log filter implied by -v/-q, if any.
    pub fn log_filter(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("info"),
            _ => Some("debug"),
        }
    }
}
