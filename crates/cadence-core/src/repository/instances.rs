use super::outbox::enqueue_on;
use super::{short_id_pattern, write_error, InstanceRepository, SqliteRepository};
use crate::error::CoreError;
use crate::models::{Generation, RecurringTemplate, SyncIntent, TaskInstance, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Inserts unless the `(template_id, scheduled_for)` slot is taken. Returns whether a row was written.
async fn insert_instance_on(conn: &mut SqliteConnection, instance: &TaskInstance) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"INSERT INTO task_instances (
               id, template_id, scheduled_for, status, title, description, category,
               priority, assignee, external_event_id, created_at, updated_at
           ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
           ON CONFLICT (template_id, scheduled_for) DO NOTHING"#,
    )
    .bind(instance.id)
    .bind(instance.template_id)
    .bind(instance.scheduled_for)
    .bind(&instance.status)
    .bind(&instance.title)
    .bind(&instance.description)
    .bind(&instance.category)
    .bind(&instance.priority)
    .bind(&instance.assignee)
    .bind(&instance.external_event_id)
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn update_template_cursor_on(conn: &mut SqliteConnection, template: &RecurringTemplate) -> Result<(), CoreError> {
    let result = sqlx::query(
        "UPDATE templates SET next_run_at = $1, active = $2, deactivated_at = $3, updated_at = $4 WHERE id = $5",
    )
    .bind(template.next_run_at)
    .bind(template.active)
    .bind(template.deactivated_at)
    .bind(template.updated_at)
    .bind(template.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!("Template {}", template.id)));
    }
    Ok(())
}

#[async_trait]
impl InstanceRepository for SqliteRepository {
    async fn get_instance(&self, template_id: Uuid, scheduled_for: DateTime<Utc>) -> Result<Option<TaskInstance>, CoreError> {
        let instance = sqlx::query_as("SELECT * FROM task_instances WHERE template_id = $1 AND scheduled_for = $2")
            .bind(template_id)
            .bind(scheduled_for)
            .fetch_optional(self.pool())
            .await?;
        Ok(instance)
    }

    async fn get_instance_by_id(&self, id: Uuid) -> Result<Option<TaskInstance>, CoreError> {
        let instance = sqlx::query_as("SELECT * FROM task_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(instance)
    }

    async fn find_instances_by_short_id_prefix(&self, short_id: &str) -> Result<Vec<TaskInstance>, CoreError> {
        let instances = sqlx::query_as("SELECT * FROM task_instances WHERE lower(hex(id)) LIKE $1")
            .bind(short_id_pattern(short_id))
            .fetch_all(self.pool())
            .await?;
        Ok(instances)
    }

    async fn list_instances(&self, template_id: Option<Uuid>, limit: u32) -> Result<Vec<TaskInstance>, CoreError> {
        let instances = match template_id {
            Some(template_id) => {
                sqlx::query_as(
                    "SELECT * FROM task_instances WHERE template_id = $1 ORDER BY scheduled_for DESC LIMIT $2",
                )
                .bind(template_id)
                .bind(i64::from(limit))
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM task_instances ORDER BY scheduled_for DESC LIMIT $1")
                    .bind(i64::from(limit))
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(instances)
    }

    async fn list_pending_instances(&self, template_id: Uuid, after: DateTime<Utc>) -> Result<Vec<TaskInstance>, CoreError> {
        let instances = sqlx::query_as(
            r#"SELECT * FROM task_instances
               WHERE template_id = $1 AND status = $2 AND scheduled_for > $3
               ORDER BY scheduled_for ASC"#,
        )
        .bind(template_id)
        .bind(TaskStatus::Pending)
        .bind(after)
        .fetch_all(self.pool())
        .await?;
        Ok(instances)
    }

    async fn save_instance(&self, instance: &TaskInstance) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO task_instances (
                   id, template_id, scheduled_for, status, title, description, category,
                   priority, assignee, external_event_id, created_at, updated_at
               ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (id) DO UPDATE SET
                   status = excluded.status,
                   title = excluded.title,
                   description = excluded.description,
                   category = excluded.category,
                   priority = excluded.priority,
                   assignee = excluded.assignee,
                   external_event_id = excluded.external_event_id,
                   updated_at = excluded.updated_at"#,
        )
        .bind(instance.id)
        .bind(instance.template_id)
        .bind(instance.scheduled_for)
        .bind(&instance.status)
        .bind(&instance.title)
        .bind(&instance.description)
        .bind(&instance.category)
        .bind(&instance.priority)
        .bind(&instance.assignee)
        .bind(&instance.external_event_id)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| write_error(e.into()))?;

        Ok(())
    }

    async fn save_instance_with_intent(&self, instance: &TaskInstance, intent: &SyncIntent) -> Result<(TaskInstance, bool), CoreError> {
        let mut tx = self.pool().begin().await.map_err(|e| write_error(e.into()))?;

        let inserted = insert_instance_on(&mut tx, instance).await.map_err(write_error)?;
        if !inserted {
            // Another writer won the slot; hand back what it stored.
            let existing: TaskInstance =
                sqlx::query_as("SELECT * FROM task_instances WHERE template_id = $1 AND scheduled_for = $2")
                    .bind(instance.template_id)
                    .bind(instance.scheduled_for)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok((existing, false));
        }

        enqueue_on(&mut tx, intent).await.map_err(write_error)?;
        tx.commit().await.map_err(|e| write_error(e.into()))?;

        Ok((instance.clone(), true))
    }

    async fn update_instance_with_intent(&self, instance: &TaskInstance, intent: &SyncIntent) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await.map_err(|e| write_error(e.into()))?;

        let result = sqlx::query(
            r#"UPDATE task_instances SET
                   status = $1, title = $2, description = $3, category = $4,
                   priority = $5, assignee = $6, updated_at = $7
               WHERE id = $8"#,
        )
        .bind(&instance.status)
        .bind(&instance.title)
        .bind(&instance.description)
        .bind(&instance.category)
        .bind(&instance.priority)
        .bind(&instance.assignee)
        .bind(instance.updated_at)
        .bind(instance.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Instance {}", instance.id)));
        }

        enqueue_on(&mut tx, intent).await.map_err(write_error)?;
        tx.commit().await.map_err(|e| write_error(e.into()))?;
        Ok(())
    }

    async fn commit_generation(&self, template: &RecurringTemplate, generation: Option<&Generation>) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await.map_err(|e| write_error(e.into()))?;

        if let Some(Generation { instance, intent: Some(intent) }) = generation {
            if insert_instance_on(&mut tx, instance).await.map_err(write_error)? {
                enqueue_on(&mut tx, intent).await.map_err(write_error)?;
            }
        }

        update_template_cursor_on(&mut tx, template).await.map_err(write_error)?;
        tx.commit().await.map_err(|e| write_error(e.into()))?;
        Ok(())
    }
}
