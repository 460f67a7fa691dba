//! forkpool - run tasks in a pool of child processes

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use forkpool::logging::{self, LogConfig};
use forkpool::{Pool, PoolConfig, Task, demo, runtime};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use cli::{Cli, Commands, RunArgs};

fn main() {
    // Children of a pool run their task and exit here.
    runtime::run_child_if_requested(&demo::registry());

    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let mut log_config = LogConfig::for_cli().with_ansi(!cli.no_color);
    if let Some(filter) = cli.log_filter() {
        log_config = log_config.with_filter(filter.to_string());
    }
    logging::init(log_config.with_env_overrides());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Tasks => cmd_tasks(),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Run `count` copies of a demo task, then print the results and the
/// pool status.
fn cmd_run(args: &RunArgs) -> Result<()> {
    let task_args: Value = serde_json::from_str(&args.args)
        .with_context(|| format!("--args is not valid JSON: {}", args.args))?;
    let task = Task::new(&args.task, &task_args)?;

    let mut config = PoolConfig::default()
        .with_env_overrides()
        .context("Invalid FORKPOOL_* environment")?;
    if let Some(concurrency) = args.concurrency {
        config = config.concurrency(concurrency);
    }
    if let Some(secs) = args.timeout {
        config = config.timeout(Duration::from_secs(secs));
    }
    if let Some(bytes) = args.max_output {
        config = config.max_output(bytes);
    }
    if args.sync {
        config = config.force_synchronous(true);
    }
    config.validate()?;

    let mut pool = Pool::new(config)
        .with_registry(Arc::new(demo::registry()))
        .with_error_registry(demo::error_registry());

    let problems = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..args.count {
        let on_error = Rc::clone(&problems);
        let on_timeout = Rc::clone(&problems);
        pool.add(task.clone())?
            .catch(move |failure| on_error.borrow_mut().push(failure.to_string()))
            .on_timeout(move || on_timeout.borrow_mut().push("timed out".to_string()));
    }

    let results = pool.wait()?;
    println!("{}", serde_json::to_string(&results)?);
    println!("{}", pool.status());

    let problems = problems.borrow();
    if !problems.is_empty() {
        bail!("{} of {} task(s) did not succeed", problems.len(), args.count);
    }
    Ok(())
}

fn cmd_tasks() -> Result<()> {
    for name in demo::registry().names() {
        println!("{}", name);
    }
    Ok(())
}
