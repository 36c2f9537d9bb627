mod catalog;
mod cli;
mod config;
mod error;
mod monitor;
mod orchestrator;
mod partition;
mod pipeline;
mod process;
mod supervisor;
mod ui;
mod worker;

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use catalog::{WorkItem, WorkItemSource, filter_by_range, item_dir_name};
use cli::{Cli, Command};
use config::{BatchConfig, ConfigOverrides, DEFAULT_CONFIG_FILE, RunConfig};
use monitor::RunSummary;
use orchestrator::BatchOrchestrator;
use pipeline::{PipelineExecutor, StageKind};
use ui::StatusBoard;
use worker::WorkerAssignment;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Run {
            pipeline,
            range,
            workers,
            log_dir,
            poll_interval,
            dry_run,
        } => {
            let overrides = ConfigOverrides {
                workers,
                log_dir,
                poll_interval_secs: poll_interval,
                ..range.apply(pipeline.overrides())
            };
            run(cli.config.as_deref(), overrides, dry_run).await
        }
        Command::Worker {
            pipeline,
            range,
            worker_id,
            ids,
        } => {
            let overrides = range.apply(pipeline.overrides());
            run_worker(cli.config.as_deref(), overrides, WorkerAssignment { worker_id, ids }).await
        }
        Command::Rerender { pipeline, dry_run } => {
            let mut overrides = pipeline.overrides();
            overrides.max_retries = overrides.max_retries.or(Some(1));
            rerender(cli.config.as_deref(), overrides, dry_run).await
        }
        Command::Status {
            catalog,
            results_dir,
            start_id,
            end_id,
            skip,
        } => {
            let overrides = ConfigOverrides {
                catalog,
                results_dir,
                start_id,
                end_id,
                skip_stages: skip.kinds(),
                ..Default::default()
            };
            status(cli.config.as_deref(), overrides)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "batchgen=debug" } else { "batchgen=info" };
    let use_color = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(use_color)
                .with_target(false),
        )
        .init();
}

fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<RunConfig> {
    let file = BatchConfig::load(path)?;
    // Remember which file was used so workers load the same one.
    let used = path.or_else(|| {
        let default = Path::new(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    });
    let config_path = used.map(std::path::absolute).transpose()?;
    Ok(RunConfig::resolve(file, overrides, config_path)?)
}

async fn run(config_path: Option<&Path>, overrides: ConfigOverrides, dry_run: bool) -> Result<ExitCode> {
    let orchestrator = BatchOrchestrator::new(load_config(config_path, overrides)?);
    let config = orchestrator.config();
    let plan = orchestrator.plan()?;

    if config.skip_existing {
        println!(
            "Found {} incomplete items out of {} in range",
            plan.pending(),
            plan.in_range
        );
    }
    if plan.pending() == 0 {
        println!("No items to process!");
        ui::print_summary(&RunSummary {
            skipped: plan.skipped_existing,
            ..Default::default()
        });
        return Ok(ExitCode::SUCCESS);
    }

    ui::print_banner(config, &plan);

    let program = std::env::current_exe().context("cannot locate the batchgen executable")?;
    let specs = orchestrator.worker_specs(&plan, &program);
    if dry_run {
        ui::print_dry_run(&specs);
        return Ok(ExitCode::SUCCESS);
    }

    // Handlers go in before any worker exists, so no signal can orphan one.
    let shutdown = process::shutdown_signal().context("cannot install signal handlers")?;
    let log_dir = orchestrator.run_log_dir();
    println!("Log dir: {}", log_dir.display());
    println!("Press Ctrl+C to cancel all workers.");
    println!();

    let launched = plan.partitions.iter().filter(|p| !p.is_empty()).count();
    let board = StatusBoard::start(launched);
    let outcome = orchestrator
        .execute(specs, plan.skipped_existing, log_dir.clone(), shutdown, |line| {
            board.update(line)
        })
        .await?;
    board.finish();

    ui::print_run_report(&outcome.monitor, &log_dir, outcome.report.cancelled);
    Ok(ExitCode::from(outcome.exit_code()))
}

async fn run_worker(
    config_path: Option<&Path>,
    overrides: ConfigOverrides,
    assignment: WorkerAssignment,
) -> Result<ExitCode> {
    let config = load_config(config_path, overrides)?;
    worker::run_worker(&config, &assignment).await?;
    Ok(ExitCode::SUCCESS)
}

async fn rerender(config_path: Option<&Path>, overrides: ConfigOverrides, dry_run: bool) -> Result<ExitCode> {
    let config = load_config(config_path, overrides)?;
    let ids = monitor::rerender_candidates(
        &config.results_dir,
        config.terminal_artifact(),
        &config.pre_render_artifacts(),
    )
    .with_context(|| format!("cannot scan {}", config.results_dir.display()))?;

    println!("Found {} items needing re-render", ids.len());
    if dry_run {
        for id in &ids {
            println!("  {}", item_dir_name(*id));
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Descriptions are optional here; the render stage rarely needs them.
    let source = WorkItemSource::new(&config.results_dir);
    let descriptions: HashMap<u64, String> = source
        .load(&config.catalog)
        .map(|items| items.into_iter().map(|i| (i.id, i.description)).collect())
        .unwrap_or_default();
    let items: Vec<WorkItem> = ids
        .iter()
        .map(|&id| {
            let description = descriptions.get(&id).cloned().unwrap_or_default();
            WorkItem::new(id, description, &config.results_dir)
        })
        .collect();

    let stages = config
        .command_stages()
        .into_iter()
        .map(|mut stage| {
            stage.enabled = stage.kind == StageKind::Render;
            stage
        })
        .collect();
    let executor = PipelineExecutor::new(stages, config.retry, config.attempt_timeout);
    let report = worker::run_partition(&executor, &items, None).await;

    println!();
    ui::print_summary(&report.summary);
    Ok(ExitCode::SUCCESS)
}

fn status(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<ExitCode> {
    let config = load_config(config_path, overrides)?;
    let source = WorkItemSource::new(&config.results_dir);
    let items = filter_by_range(source.load(&config.catalog)?, config.start_id, config.end_id);

    let report = monitor::scan_items(
        &items,
        config.terminal_artifact(),
        &config.pre_render_artifacts(),
    );
    println!("Catalog: {} ({} items in range)", config.catalog.display(), items.len());
    ui::print_status(&report, &config.results_dir);
    Ok(ExitCode::SUCCESS)
}
