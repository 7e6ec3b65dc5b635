//! Taskline CLI entry point

use anyhow::Result;
use clap::Parser;
use crossterm::tty::IsTty;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use taskline::config::SUDO_PASSWORD_VAR;
use taskline::ui::{format_report, NullRenderer, Renderer, TerminalRenderer};
use taskline::{Config, DurationCache, Orchestrator, RunReport, TaskLogger, TaskTree};

#[derive(Parser)]
#[command(name = "taskline")]
#[command(about = "Run a tree of shell tasks with live progress", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML task file
    config: PathBuf,

    /// Override max-parallel-commands
    #[arg(short = 'p', long)]
    max_parallel: Option<usize>,

    /// Write one log file per task into this directory
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Duration cache file
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Neither read nor write the duration cache
    #[arg(long)]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("taskline: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(cli, config).await {
        Ok(report) if report.success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            eprintln!("taskline: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<RunReport> {
    let mut options = config.run_options();
    if let Some(max_parallel) = cli.max_parallel {
        options.max_parallel = max_parallel.max(1);
    }
    options.sudo_password = std::env::var(SUDO_PASSWORD_VAR).ok();

    let cache_path = cli
        .cache_path
        .or_else(|| config.config.cache_path.clone())
        .unwrap_or_else(DurationCache::default_path);
    let cache = if cli.no_cache {
        DurationCache::default()
    } else {
        DurationCache::load(&cache_path).unwrap_or_else(|e| {
            log::warn!("Ignoring duration cache: {:#}", e);
            DurationCache::default()
        })
    };

    let log_dir = cli.log_path.or_else(|| config.config.log_path.clone());
    if let Some(dir) = &log_dir {
        std::fs::create_dir_all(dir)?;
    }
    let logger = TaskLogger::new(log_dir);
    let tree = TaskTree::build(config.specs(), config.placeholder(), &cache);

    let (report, mut cache) = if io::stdout().is_tty() {
        execute(tree, options, TerminalRenderer::stdout(), cache, logger).await?
    } else {
        execute(tree, options, NullRenderer::new(), cache, logger).await?
    };

    if !cli.no_cache {
        if let Err(e) = cache.save(&cache_path) {
            log::warn!("Failed to save duration cache: {:#}", e);
        }
    }

    if !report.failures.is_empty() {
        eprint!("\n{}", format_report(&report.failures));
    }
    Ok(report)
}

async fn execute<R: Renderer>(
    tree: TaskTree,
    options: taskline::RunOptions,
    renderer: R,
    cache: DurationCache,
    logger: TaskLogger,
) -> Result<(RunReport, DurationCache)> {
    let mut orchestrator = Orchestrator::new(tree, options, renderer, cache).with_logger(logger);
    let report = orchestrator.run().await?;
    Ok((report, orchestrator.into_history()))
}
