use anyhow::Context;
use cadence_core::db;
use cadence_core::error::CoreError;
use cadence_core::generator::OccurrenceGenerator;
use cadence_core::recurrence::ScheduleEvaluator;
use cadence_core::repository::SqliteRepository;
use cadence_core::scheduler::SchedulerLoop;
use cadence_core::sync::{CalendarProvider, HttpCalendarProvider, InMemoryCalendarProvider};
use clap::Parser;
use owo_colors::{OwoColorize, Style};
use std::sync::Arc;
use tracing::{debug, warn};

mod cli;
mod commands;
mod config;
mod logging;
mod parser;
mod timezone;
mod util;
mod views;

use commands::App;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let config = match config::Config::new(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Invalid configuration: {}", "Error:".red().bold(), e);
            std::process::exit(2);
        }
    };
    logging::init(&config.logging);

    let app = match build_app(config).await {
        Ok(app) => app,
        Err(e) => {
            handle_error(e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        cli::Commands::Template(command) => commands::template::template_command(&app, command).await,
        cli::Commands::Instances(command) => commands::instances::instances_command(&app, command).await,
        cli::Commands::Tick => commands::run::tick(&app).await,
        cli::Commands::Run => commands::run::run(&app).await,
        cli::Commands::Outbox(command) => commands::outbox::outbox_command(&app, command).await,
    };

    if let Err(e) = result {
        handle_error(e);
        std::process::exit(1);
    }
}

async fn build_app(config: config::Config) -> anyhow::Result<App> {
    let pool = db::establish_connection(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database '{}'", config.database_path))?;
    let repo = Arc::new(SqliteRepository::new(pool));

    let provider: Arc<dyn CalendarProvider> = match &config.calendar.base_url {
        Some(base_url) => Arc::new(HttpCalendarProvider::new(base_url, config.calendar.token.clone())?),
        None => {
            debug!("No calendar endpoint configured; using the in-process provider");
            Arc::new(InMemoryCalendarProvider::new())
        }
    };
    if config.calendar.base_url.is_none() && config.calendar.token.is_some() {
        warn!("Calendar token is set but calendar.base_url is missing; the token is ignored");
    }

    let evaluator = Arc::new(ScheduleEvaluator::new(config.scheduler.lookahead_days));
    let scheduler = SchedulerLoop::new(
        repo.clone(),
        provider,
        evaluator,
        config.scheduler,
        &config.sync,
    );

    Ok(App {
        generator: OccurrenceGenerator::new(repo.clone()),
        repo,
        scheduler,
        default_timezone: config.default_timezone,
    })
}

fn handle_error(err: anyhow::Error) {
    let error_style = Style::new().red().bold();

    if let Some(core_error) = err.chain().find_map(|e| e.downcast_ref::<CoreError>()) {
        match core_error {
            CoreError::NotFound(s) => {
                eprintln!("{} {}", "Error:".style(error_style), s);
            }
            CoreError::AmbiguousId(matches) => {
                eprintln!("{}", "Error: Ambiguous ID.".style(error_style));
                eprintln!("Did you mean one of these?");
                for (id, label) in matches {
                    eprintln!("  {} ({})", id.yellow(), label);
                }
            }
            CoreError::InvalidInput(s) => {
                eprintln!("{} Invalid input: {}", "Error:".style(error_style), s);
            }
            CoreError::InvalidRule(s) => {
                eprintln!("{} Invalid schedule: {}", "Error:".style(error_style), s);
            }
            CoreError::InvalidTimezone(s) => {
                eprintln!("{} Invalid timezone: {}", "Error:".style(error_style), s.yellow());
            }
            CoreError::AlreadyRunning | CoreError::NotRunning => {
                eprintln!("{} {}", "Error:".style(error_style), core_error);
            }
            _ => eprintln!("{} {:#}", "Error:".style(error_style), err),
        }
    } else {
        eprintln!("{} {:#}", "Error:".style(error_style), err);
    }
}
