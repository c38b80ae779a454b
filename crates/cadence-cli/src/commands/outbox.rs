use anyhow::Result;
use cadence_core::repository::OutboxRepository;
use owo_colors::OwoColorize;

use super::App;
use crate::cli::{IntentIdArg, ListOutboxCommand, OutboxCommand};
use crate::util::{resolve_intent_id, short_id};
use crate::views::table::display_intents;

pub async fn outbox_command(app: &App, command: OutboxCommand) -> Result<()> {
    match command {
        OutboxCommand::List(command) => list_intents(app, command).await,
        OutboxCommand::Redrive(command) => redrive_intent(app, command).await,
    }
}

pub async fn list_intents(app: &App, command: ListOutboxCommand) -> Result<()> {
    let intents = app.repo.list_intents(command.status).await?;
    display_intents(&intents);
    Ok(())
}

pub async fn redrive_intent(app: &App, command: IntentIdArg) -> Result<()> {
    let id = resolve_intent_id(app.repo.as_ref(), &command.id).await?;
    let intent = app.repo.requeue_intent(id).await?;

    println!(
        "{} Re-queued {} intent {} for instance {}",
        "✓".green().bold(),
        intent.op,
        short_id(&intent.id).yellow(),
        short_id(&intent.instance_id).yellow()
    );
    println!("  {} It will be retried on the next tick", "→".blue());
    Ok(())
}
