use anyhow::Result;
use cadence_core::models::TickSummary;
use chrono::Utc;
use owo_colors::{OwoColorize, Style};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::App;

pub async fn tick(app: &App) -> Result<()> {
    let summary = app.scheduler.tick(Utc::now()).await;
    print_summary(&summary);
    Ok(())
}

/// Runs the loop in the foreground until Ctrl-C.
pub async fn run(app: &App) -> Result<()> {
    let shutdown = CancellationToken::new();
    app.scheduler.start(&shutdown).await?;
    println!(
        "{} Scheduler running every {}s. Press Ctrl-C to stop.",
        "▶".green().bold(),
        app.scheduler.config().tick_interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    app.scheduler.stop().await?;

    println!("{} Scheduler stopped.", "■".yellow());
    Ok(())
}

fn print_summary(summary: &TickSummary) {
    let label = Style::new().bold();
    let warn = Style::new().yellow();
    let bad = Style::new().red().bold();

    println!("{} ({} ms)", "Tick complete".style(label), summary.duration_ms);
    println!("  Templates due:       {}", summary.templates_evaluated);
    println!("  Instances created:   {}", summary.instances_created.green());
    if summary.templates_completed > 0 {
        println!("  Templates completed: {}", summary.templates_completed);
    }
    println!(
        "  Sync intents:        {} flushed, {} acked, {} failed, {} dead",
        summary.intents_flushed,
        summary.intents_acked.green(),
        summary.intents_failed.style(warn),
        summary.intents_dead.style(bad)
    );

    if !summary.errors.is_empty() {
        println!("  {}", "Errors:".style(bad));
        for error in &summary.errors {
            println!("    - {}", error);
        }
    }
}
