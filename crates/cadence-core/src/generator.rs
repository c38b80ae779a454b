use crate::error::CoreError;
use crate::models::{
    EventPayload, Generation, RecurringTemplate, SyncIntent, SyncOp, TaskInstance, TaskStatus,
};
use crate::repository::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Materializes task instances for template firings and records their sync intents.
pub struct OccurrenceGenerator {
    store: Arc<dyn Store>,
}

impl OccurrenceGenerator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Decides what a firing would write without writing it.
    ///
    /// An existing instance for `(template.id, firing)` is returned unchanged
    /// with no intent attached.
    pub async fn plan(&self, template: &RecurringTemplate, firing: DateTime<Utc>) -> Result<Generation, CoreError> {
        if let Some(existing) = self.store.get_instance(template.id, firing).await? {
            debug!(template_id = %template.id, scheduled_for = %firing, "Instance already exists");
            return Ok(Generation {
                instance: existing,
                intent: None,
            });
        }

        let instance = TaskInstance::from_template(template, firing);
        let intent = SyncIntent::new(&instance, SyncOp::Create, event_payload(template, &instance));
        Ok(Generation {
            instance,
            intent: Some(intent),
        })
    }

    /// Returns the instance for this firing, creating it and its create intent if needed.
    pub async fn generate(&self, template: &RecurringTemplate, firing: DateTime<Utc>) -> Result<TaskInstance, CoreError> {
        let Generation { instance, intent } = self.plan(template, firing).await?;
        let Some(intent) = intent else {
            return Ok(instance);
        };

        let (stored, inserted) = self.store.save_instance_with_intent(&instance, &intent).await?;
        if inserted {
            debug!(template_id = %template.id, instance_id = %stored.id, "Instance generated");
        }
        Ok(stored)
    }

    /// Copies the template's current payload onto its pending instances after
    /// `after` and enqueues an update intent for each.
    pub async fn resync_pending(&self, template: &RecurringTemplate, after: DateTime<Utc>) -> Result<usize, CoreError> {
        let pending = self.store.list_pending_instances(template.id, after).await?;
        let count = pending.len();

        for mut instance in pending {
            instance.title = template.payload.title.clone();
            instance.description = template.payload.description.clone();
            instance.category = template.payload.category.clone();
            instance.priority = template.payload.priority.clone();
            instance.assignee = template.payload.assignee.clone();
            instance.updated_at = Utc::now();

            let intent = SyncIntent::new(&instance, SyncOp::Update, event_payload(template, &instance));
            self.store.update_instance_with_intent(&instance, &intent).await?;
        }

        debug!(template_id = %template.id, count, "Resynced pending instances");
        Ok(count)
    }

    /// Cancels pending instances after `after` and enqueues a cancel intent for each.
    pub async fn cancel_pending(&self, template: &RecurringTemplate, after: DateTime<Utc>) -> Result<usize, CoreError> {
        let pending = self.store.list_pending_instances(template.id, after).await?;
        let count = pending.len();

        for mut instance in pending {
            instance.status = TaskStatus::Cancelled;
            instance.updated_at = Utc::now();

            let intent = SyncIntent::new(&instance, SyncOp::Cancel, event_payload(template, &instance));
            self.store.update_instance_with_intent(&instance, &intent).await?;
        }

        debug!(template_id = %template.id, count, "Cancelled pending instances");
        Ok(count)
    }
}

/// Intents only carry a payload when the template is linked to a calendar.
fn event_payload(template: &RecurringTemplate, instance: &TaskInstance) -> Option<EventPayload> {
    template
        .external_calendar_id
        .as_deref()
        .map(|calendar_id| EventPayload::for_instance(calendar_id, instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::establish_connection;
    use crate::models::{IntentStatus, TaskPayload};
    use crate::recurrence::RecurrenceRule;
    use crate::repository::SqliteRepository;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup() -> (Arc<dyn Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("generator.db");
        let pool = establish_connection(db_path.to_str().unwrap()).await.unwrap();
        (Arc::new(SqliteRepository::new(pool)), dir)
    }

    async fn template(store: &Arc<dyn Store>, calendar: Option<&str>) -> RecurringTemplate {
        let anchor = Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap();
        let now = Utc::now();
        let template = RecurringTemplate {
            id: Uuid::now_v7(),
            rule: RecurrenceRule::weekly(anchor, "UTC"),
            payload: TaskPayload {
                title: "Water plants".to_string(),
                ..Default::default()
            },
            next_run_at: anchor,
            external_calendar_id: calendar.map(str::to_string),
            active: true,
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        };
        store.save_template(&template).await.unwrap();
        template
    }

    #[tokio::test]
    async fn test_generate_is_idempotent() {
        let (store, _dir) = setup().await;
        let template = template(&store, Some("team")).await;
        let generator = OccurrenceGenerator::new(Arc::clone(&store));

        let first = generator.generate(&template, template.next_run_at).await.unwrap();
        let second = generator.generate(&template, template.next_run_at).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_intents(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_attaches_payload_only_with_calendar() {
        let (store, _dir) = setup().await;
        let generator = OccurrenceGenerator::new(Arc::clone(&store));

        let linked = template(&store, Some("team")).await;
        let unlinked = template(&store, None).await;

        let linked_plan = generator.plan(&linked, linked.next_run_at).await.unwrap();
        let unlinked_plan = generator.plan(&unlinked, unlinked.next_run_at).await.unwrap();

        let payload = linked_plan.intent.unwrap().payload.unwrap();
        assert_eq!(payload.calendar_id, "team");
        assert_eq!(payload.starts_at, linked.next_run_at);
        assert!(unlinked_plan.intent.unwrap().payload.is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_marks_instances_and_enqueues_cancels() {
        let (store, _dir) = setup().await;
        let template = template(&store, Some("team")).await;
        let generator = OccurrenceGenerator::new(Arc::clone(&store));

        let instance = generator.generate(&template, template.next_run_at).await.unwrap();
        let cancelled = generator
            .cancel_pending(&template, template.next_run_at - chrono::Duration::days(1))
            .await
            .unwrap();

        assert_eq!(cancelled, 1);
        let stored = store.get_instance_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);

        let ops: Vec<SyncOp> = store
            .list_intents(Some(IntentStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.op)
            .collect();
        assert!(ops.contains(&SyncOp::Cancel));
    }
}
