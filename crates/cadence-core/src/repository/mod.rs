use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{
    EventPayload, Generation, IntentStatus, RecurringTemplate, SyncIntent, SyncOp, TaskInstance,
    TaskPayload, TaskPriority,
};
use crate::recurrence::RecurrenceRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

pub mod instances;
pub mod outbox;
pub mod templates;

// Traits are defined in this module and implemented in respective domain modules

/// Domain-specific trait for template persistence
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get_active_templates(&self) -> Result<Vec<RecurringTemplate>, CoreError>;
    async fn list_templates(&self, include_inactive: bool) -> Result<Vec<RecurringTemplate>, CoreError>;
    async fn get_template(&self, id: Uuid) -> Result<Option<RecurringTemplate>, CoreError>;
    async fn find_templates_by_short_id_prefix(&self, short_id: &str) -> Result<Vec<RecurringTemplate>, CoreError>;
    /// Inserts or fully replaces the template row.
    async fn save_template(&self, template: &RecurringTemplate) -> Result<(), CoreError>;
}

/// Domain-specific trait for instance persistence
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get_instance(&self, template_id: Uuid, scheduled_for: DateTime<Utc>) -> Result<Option<TaskInstance>, CoreError>;
    async fn get_instance_by_id(&self, id: Uuid) -> Result<Option<TaskInstance>, CoreError>;
    async fn find_instances_by_short_id_prefix(&self, short_id: &str) -> Result<Vec<TaskInstance>, CoreError>;
    async fn list_instances(&self, template_id: Option<Uuid>, limit: u32) -> Result<Vec<TaskInstance>, CoreError>;
    /// Pending instances of `template_id` scheduled strictly after `after`.
    async fn list_pending_instances(&self, template_id: Uuid, after: DateTime<Utc>) -> Result<Vec<TaskInstance>, CoreError>;
    /// Inserts or fully replaces an instance without touching the outbox.
    async fn save_instance(&self, instance: &TaskInstance) -> Result<(), CoreError>;
    /// Inserts the instance and its intent atomically.
    ///
    /// If an instance already exists for the same `(template_id, scheduled_for)`
    /// nothing is written and the stored instance is returned instead.
    async fn save_instance_with_intent(&self, instance: &TaskInstance, intent: &SyncIntent) -> Result<(TaskInstance, bool), CoreError>;
    /// Replaces the instance fields and enqueues the intent atomically.
    async fn update_instance_with_intent(&self, instance: &TaskInstance, intent: &SyncIntent) -> Result<(), CoreError>;
    /// Persists a planned firing together with the template's new cursor.
    ///
    /// The instance, its intent and the template row are written in one
    /// transaction, so a crash leaves either all of them or none.
    async fn commit_generation(&self, template: &RecurringTemplate, generation: Option<&Generation>) -> Result<(), CoreError>;
}

/// Domain-specific trait for the sync outbox
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Records an intent. Re-enqueueing a create with the same key is a no-op;
    /// updates and cancels replace the stored payload and reopen the row.
    async fn enqueue(&self, intent: &SyncIntent) -> Result<(), CoreError>;
    /// Marks the intent delivered and backfills the instance's remote id.
    async fn ack(&self, intent_id: Uuid, external_event_id: Option<&str>) -> Result<(), CoreError>;
    /// Pending and failed intents, oldest first.
    async fn list_pending(&self, limit: u32) -> Result<Vec<SyncIntent>, CoreError>;
    async fn mark_intent_failed(&self, intent_id: Uuid, attempts: u32, error: &str) -> Result<(), CoreError>;
    async fn mark_intent_dead(&self, intent_id: Uuid, attempts: u32, error: &str) -> Result<(), CoreError>;
    async fn get_intent(&self, id: Uuid) -> Result<Option<SyncIntent>, CoreError>;
    async fn list_intents(&self, status: Option<IntentStatus>) -> Result<Vec<SyncIntent>, CoreError>;
    async fn find_intents_by_short_id_prefix(&self, short_id: &str) -> Result<Vec<SyncIntent>, CoreError>;
    /// Moves a failed or dead intent back to pending with its attempts reset.
    async fn requeue_intent(&self, intent_id: Uuid) -> Result<SyncIntent, CoreError>;
}

/// Composite trait combining all domain repositories
pub trait Store: TemplateRepository + InstanceRepository + OutboxRepository {}

impl<T> Store for T where T: TemplateRepository + InstanceRepository + OutboxRepository {}

/// Main SQLite repository implementation
#[derive(Clone)]
pub struct SqliteRepository {
    pool: DbPool,
}

impl SqliteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Reclassifies database failures raised by write paths.
pub(crate) fn write_error(err: CoreError) -> CoreError {
    match err {
        CoreError::Database(e) => CoreError::write_failure(e),
        other => other,
    }
}

/// Hyphens are dropped so `1a2b3c4d-` and `1a2b3c4d` match the same ids.
pub(crate) fn short_id_pattern(short_id: &str) -> String {
    let mut pattern: String = short_id
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    pattern.push('%');
    pattern
}

// Row types mirror the tables; JSON columns are decoded on the way out.

#[derive(Debug, FromRow)]
pub(crate) struct TemplateRow {
    pub id: Uuid,
    pub rule: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: TaskPriority,
    pub assignee: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub external_calendar_id: Option<String>,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for RecurringTemplate {
    type Error = CoreError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        let rule: RecurrenceRule = serde_json::from_str(&row.rule)?;
        Ok(RecurringTemplate {
            id: row.id,
            rule,
            payload: TaskPayload {
                title: row.title,
                description: row.description,
                category: row.category,
                priority: row.priority,
                assignee: row.assignee,
            },
            next_run_at: row.next_run_at,
            external_calendar_id: row.external_calendar_id,
            active: row.active,
            deactivated_at: row.deactivated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct IntentRow {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub op: SyncOp,
    pub external_event_id: Option<String>,
    pub idempotency_key: Uuid,
    pub payload: Option<String>,
    pub status: IntentStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for SyncIntent {
    type Error = CoreError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        let payload = row
            .payload
            .as_deref()
            .map(serde_json::from_str::<EventPayload>)
            .transpose()?;
        Ok(SyncIntent {
            id: row.id,
            instance_id: row.instance_id,
            op: row.op,
            external_event_id: row.external_event_id,
            idempotency_key: row.idempotency_key,
            payload,
            status: row.status,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn templates_from_rows(rows: Vec<TemplateRow>) -> Result<Vec<RecurringTemplate>, CoreError> {
    rows.into_iter().map(RecurringTemplate::try_from).collect()
}

pub(crate) fn intents_from_rows(rows: Vec<IntentRow>) -> Result<Vec<SyncIntent>, CoreError> {
    rows.into_iter().map(SyncIntent::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_pattern_strips_hyphens() {
        assert_eq!(short_id_pattern("01AB-cd"), "01abcd%");
        assert_eq!(short_id_pattern(""), "%");
    }
}
