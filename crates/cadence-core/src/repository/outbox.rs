use super::{intents_from_rows, short_id_pattern, write_error, IntentRow, OutboxRepository, SqliteRepository};
use crate::error::CoreError;
use crate::models::{IntentStatus, SyncIntent};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Upserts an intent keyed on its idempotency key.
///
/// A create that already exists is left untouched so replays never reopen a
/// delivered create. A replayed update or cancel is reopened as pending.
pub(crate) async fn enqueue_on(conn: &mut SqliteConnection, intent: &SyncIntent) -> Result<(), CoreError> {
    let payload = intent.payload.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"INSERT INTO sync_outbox (
               id, instance_id, op, external_event_id, idempotency_key, payload,
               status, attempts, last_error, created_at, updated_at
           ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
           ON CONFLICT (idempotency_key) DO UPDATE SET
               external_event_id = excluded.external_event_id,
               payload = excluded.payload,
               status = 'pending',
               attempts = 0,
               last_error = NULL,
               updated_at = excluded.updated_at
           WHERE sync_outbox.op <> 'create'"#,
    )
    .bind(intent.id)
    .bind(intent.instance_id)
    .bind(intent.op)
    .bind(&intent.external_event_id)
    .bind(intent.idempotency_key)
    .bind(payload)
    .bind(intent.status)
    .bind(i64::from(intent.attempts))
    .bind(&intent.last_error)
    .bind(intent.created_at)
    .bind(intent.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl SqliteRepository {
    async fn mark_intent(&self, intent_id: Uuid, status: IntentStatus, attempts: u32, error: &str) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"UPDATE sync_outbox
               SET status = $1, attempts = attempts + $2, last_error = $3, updated_at = $4
               WHERE id = $5"#,
        )
        .bind(status)
        .bind(i64::from(attempts))
        .bind(error)
        .bind(Utc::now())
        .bind(intent_id)
        .execute(self.pool())
        .await
        .map_err(|e| write_error(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Sync intent {}", intent_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqliteRepository {
    async fn enqueue(&self, intent: &SyncIntent) -> Result<(), CoreError> {
        let mut conn = self.pool().acquire().await?;
        enqueue_on(&mut conn, intent).await.map_err(write_error)
    }

    async fn ack(&self, intent_id: Uuid, external_event_id: Option<&str>) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await.map_err(|e| write_error(e.into()))?;

        let result = sqlx::query("UPDATE sync_outbox SET status = $1, last_error = NULL, updated_at = $2 WHERE id = $3")
            .bind(IntentStatus::Acked)
            .bind(now)
            .bind(intent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Sync intent {}", intent_id)));
        }

        if let Some(external_event_id) = external_event_id {
            sqlx::query(
                r#"UPDATE task_instances SET external_event_id = $1, updated_at = $2
                   WHERE id = (SELECT instance_id FROM sync_outbox WHERE id = $3)"#,
            )
            .bind(external_event_id)
            .bind(now)
            .bind(intent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(e.into()))?;
        }

        tx.commit().await.map_err(|e| write_error(e.into()))?;
        Ok(())
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<SyncIntent>, CoreError> {
        let rows: Vec<IntentRow> = sqlx::query_as(
            r#"SELECT * FROM sync_outbox
               WHERE status IN ($1, $2)
               ORDER BY created_at ASC
               LIMIT $3"#,
        )
        .bind(IntentStatus::Pending)
        .bind(IntentStatus::Failed)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        intents_from_rows(rows)
    }

    async fn mark_intent_failed(&self, intent_id: Uuid, attempts: u32, error: &str) -> Result<(), CoreError> {
        self.mark_intent(intent_id, IntentStatus::Failed, attempts, error).await
    }

    async fn mark_intent_dead(&self, intent_id: Uuid, attempts: u32, error: &str) -> Result<(), CoreError> {
        self.mark_intent(intent_id, IntentStatus::Dead, attempts, error).await
    }

    async fn get_intent(&self, id: Uuid) -> Result<Option<SyncIntent>, CoreError> {
        let row: Option<IntentRow> = sqlx::query_as("SELECT * FROM sync_outbox WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(SyncIntent::try_from).transpose()
    }

    async fn list_intents(&self, status: Option<IntentStatus>) -> Result<Vec<SyncIntent>, CoreError> {
        let rows: Vec<IntentRow> = match status {
            Some(status) => {
                sqlx::query_as("SELECT * FROM sync_outbox WHERE status = $1 ORDER BY created_at ASC")
                    .bind(status)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM sync_outbox ORDER BY created_at ASC")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        intents_from_rows(rows)
    }

    async fn find_intents_by_short_id_prefix(&self, short_id: &str) -> Result<Vec<SyncIntent>, CoreError> {
        let rows: Vec<IntentRow> = sqlx::query_as("SELECT * FROM sync_outbox WHERE lower(hex(id)) LIKE $1")
            .bind(short_id_pattern(short_id))
            .fetch_all(self.pool())
            .await?;
        intents_from_rows(rows)
    }

    async fn requeue_intent(&self, intent_id: Uuid) -> Result<SyncIntent, CoreError> {
        let intent = self
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Sync intent {}", intent_id)))?;

        if !matches!(intent.status, IntentStatus::Failed | IntentStatus::Dead) {
            return Err(CoreError::InvalidInput(format!(
                "Intent {} is {}; only failed or dead intents can be requeued",
                intent_id, intent.status
            )));
        }

        sqlx::query("UPDATE sync_outbox SET status = $1, attempts = 0, updated_at = $2 WHERE id = $3")
            .bind(IntentStatus::Pending)
            .bind(Utc::now())
            .bind(intent_id)
            .execute(self.pool())
            .await
            .map_err(|e| write_error(e.into()))?;

        self.get_intent(intent_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Sync intent {}", intent_id)))
    }
}
