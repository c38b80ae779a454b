use anyhow::{anyhow, Result};
use cadence_core::error::CoreError;
use cadence_core::models::TaskStatus;
use cadence_core::repository::InstanceRepository;
use chrono::Utc;
use owo_colors::OwoColorize;

use super::App;
use crate::cli::{InstanceIdArg, InstancesCommand, ListInstancesCommand};
use crate::util::{resolve_instance_id, resolve_template_id};
use crate::views::table::display_instances;

pub async fn instances_command(app: &App, command: InstancesCommand) -> Result<()> {
    match command {
        InstancesCommand::List(command) => list_instances(app, command).await,
        InstancesCommand::Complete(command) => complete_instance(app, command).await,
    }
}

pub async fn list_instances(app: &App, command: ListInstancesCommand) -> Result<()> {
    let template_id = match &command.template_id {
        Some(short) => Some(resolve_template_id(app.repo.as_ref(), short).await?),
        None => None,
    };
    let instances = app.repo.list_instances(template_id, command.limit).await?;
    display_instances(&instances);
    Ok(())
}

pub async fn complete_instance(app: &App, command: InstanceIdArg) -> Result<()> {
    let id = resolve_instance_id(app.repo.as_ref(), &command.id).await?;
    let mut instance = app
        .repo
        .get_instance_by_id(id)
        .await?
        .ok_or_else(|| anyhow!(CoreError::NotFound(format!("Instance with ID '{}' not found.", id))))?;

    if instance.status != TaskStatus::Pending {
        return Err(anyhow!(CoreError::InvalidInput(format!(
            "Instance '{}' is already {:?}",
            instance.title, instance.status
        ))));
    }

    instance.status = TaskStatus::Completed;
    instance.updated_at = Utc::now();
    app.repo.save_instance(&instance).await?;

    println!("{} Completed: {}", "✅".green(), instance.title.bright_white().bold());
    Ok(())
}
