mod breeder;
mod calc_dir;
mod cli;
mod config;
mod corrector;
mod detector;
mod error;
mod grazer;
mod params;
mod scheduler;
mod ui;
mod workflow;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use console::Style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use breeder::{Breeder, WorkflowRecord};
use cli::{Cli, Command};
use config::KelpieConfig;
use grazer::GrazerSettings;
use scheduler::SlurmScheduler;
use ui::StageProgress;
use workflow::WorkflowDefinition;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "kelpie=debug" } else { "kelpie=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", Style::new().red().bold().apply_to("error:"));
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = KelpieConfig::load(cli.config.as_deref())?;
    if let Some(budget) = cli.retry_budget {
        config.retry_budget = budget;
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling the active stage");
            token.cancel();
        }
    });

    let scheduler = SlurmScheduler::from_config(&config.scheduler);
    let settings = config.grazer_settings()?;
    let progress = StageProgress::new();

    let outcome = match cli.command {
        Command::Breed {
            input, run, submit, ..
        } => {
            let definition = config.workflow_definition()?;
            let breeder = make_breeder(&config, definition, &run, &scheduler, &settings, &progress)?;
            if submit {
                breeder.start(&input, &cancel).await?
            } else {
                breeder.run(&input, &cancel).await?
            }
        }
        Command::Graze { run, from_scratch } => {
            let record = WorkflowRecord::load(&run)?;
            let breeder = make_breeder(
                &config,
                record.definition.clone(),
                &run,
                &scheduler,
                &settings,
                &progress,
            )?;
            if from_scratch {
                breeder.reset().await?;
            }
            breeder.run(&run.join(&record.initial_structure), &cancel).await?
        }
        Command::Status { run } => {
            let (record, reports) = breeder::inspect(&run)?;
            ui::print_status(&record, &reports);
            return Ok(0);
        }
    };

    ui::print_outcome(&outcome);
    Ok(outcome.exit_code())
}

fn make_breeder<'a>(
    config: &KelpieConfig,
    definition: WorkflowDefinition,
    run: &Path,
    scheduler: &'a SlurmScheduler,
    settings: &'a GrazerSettings,
    progress: &'a StageProgress,
) -> Result<Breeder<'a, SlurmScheduler>> {
    Ok(
        Breeder::new(definition, run, scheduler, settings, config.retry_policy()?)
            .with_shared_inputs(config.shared_inputs.clone())
            .with_scheduler_log(config.scheduler.log_file.clone())
            .with_observer(progress),
    )
}
