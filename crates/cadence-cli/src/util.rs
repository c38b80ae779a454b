use anyhow::{anyhow, Result};
use cadence_core::error::CoreError;
use cadence_core::repository::{InstanceRepository, OutboxRepository, TemplateRepository};
use uuid::Uuid;

fn check_prefix(short_id: &str) -> Result<()> {
    if short_id.len() < 2 {
        return Err(anyhow!(CoreError::InvalidInput(
            "Short ID must be at least 2 characters long.".to_string()
        )));
    }
    Ok(())
}

fn pick_single(kind: &str, short_id: &str, mut matches: Vec<(Uuid, String)>) -> Result<Uuid> {
    match matches.len() {
        1 => Ok(matches.remove(0).0),
        0 => Err(anyhow!(CoreError::NotFound(format!(
            "No {} found with ID prefix '{}'",
            kind, short_id
        )))),
        _ => Err(anyhow!(CoreError::AmbiguousId(
            matches.into_iter().map(|(id, label)| (id.to_string(), label)).collect()
        ))),
    }
}

pub async fn resolve_template_id(repo: &impl TemplateRepository, short_id: &str) -> Result<Uuid> {
    check_prefix(short_id)?;
    let templates = repo.find_templates_by_short_id_prefix(short_id).await?;
    pick_single(
        "template",
        short_id,
        templates.into_iter().map(|t| (t.id, t.payload.title)).collect(),
    )
}

pub async fn resolve_instance_id(repo: &impl InstanceRepository, short_id: &str) -> Result<Uuid> {
    check_prefix(short_id)?;
    let instances = repo.find_instances_by_short_id_prefix(short_id).await?;
    pick_single(
        "instance",
        short_id,
        instances
            .into_iter()
            .map(|i| (i.id, format!("{} @ {}", i.title, i.scheduled_for.format("%Y-%m-%d %H:%M UTC"))))
            .collect(),
    )
}

pub async fn resolve_intent_id(repo: &impl OutboxRepository, short_id: &str) -> Result<Uuid> {
    check_prefix(short_id)?;
    let intents = repo.find_intents_by_short_id_prefix(short_id).await?;
    pick_single(
        "sync intent",
        short_id,
        intents.into_iter().map(|i| (i.id, format!("{} ({})", i.op, i.status))).collect(),
    )
}

/// The 7-character short form shown in tables.
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..7].to_string()
}
