use super::{short_id_pattern, templates_from_rows, write_error, SqliteRepository, TemplateRepository, TemplateRow};
use crate::error::CoreError;
use crate::models::RecurringTemplate;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
impl TemplateRepository for SqliteRepository {
    async fn get_active_templates(&self) -> Result<Vec<RecurringTemplate>, CoreError> {
        let rows: Vec<TemplateRow> =
            sqlx::query_as("SELECT * FROM templates WHERE active = 1 ORDER BY next_run_at ASC")
                .fetch_all(self.pool())
                .await?;
        templates_from_rows(rows)
    }

    async fn list_templates(&self, include_inactive: bool) -> Result<Vec<RecurringTemplate>, CoreError> {
        let sql = if include_inactive {
            "SELECT * FROM templates ORDER BY active DESC, next_run_at ASC"
        } else {
            "SELECT * FROM templates WHERE active = 1 ORDER BY next_run_at ASC"
        };
        let rows: Vec<TemplateRow> = sqlx::query_as(sql).fetch_all(self.pool()).await?;
        templates_from_rows(rows)
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<RecurringTemplate>, CoreError> {
        let row: Option<TemplateRow> = sqlx::query_as("SELECT * FROM templates WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(RecurringTemplate::try_from).transpose()
    }

    async fn find_templates_by_short_id_prefix(&self, short_id: &str) -> Result<Vec<RecurringTemplate>, CoreError> {
        let rows: Vec<TemplateRow> = sqlx::query_as("SELECT * FROM templates WHERE lower(hex(id)) LIKE $1")
            .bind(short_id_pattern(short_id))
            .fetch_all(self.pool())
            .await?;
        templates_from_rows(rows)
    }

    async fn save_template(&self, template: &RecurringTemplate) -> Result<(), CoreError> {
        let rule = serde_json::to_string(&template.rule)?;

        sqlx::query(
            r#"INSERT INTO templates (
                   id, rule, title, description, category, priority, assignee,
                   next_run_at, external_calendar_id, active, deactivated_at, created_at, updated_at
               ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               ON CONFLICT (id) DO UPDATE SET
                   rule = excluded.rule,
                   title = excluded.title,
                   description = excluded.description,
                   category = excluded.category,
                   priority = excluded.priority,
                   assignee = excluded.assignee,
                   next_run_at = excluded.next_run_at,
                   external_calendar_id = excluded.external_calendar_id,
                   active = excluded.active,
                   deactivated_at = excluded.deactivated_at,
                   updated_at = excluded.updated_at"#,
        )
        .bind(template.id)
        .bind(rule)
        .bind(&template.payload.title)
        .bind(&template.payload.description)
        .bind(&template.payload.category)
        .bind(&template.payload.priority)
        .bind(&template.payload.assignee)
        .bind(template.next_run_at)
        .bind(&template.external_calendar_id)
        .bind(template.active)
        .bind(template.deactivated_at)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| write_error(e.into()))?;

        Ok(())
    }
}
