use crate::error::CoreError;
use crate::models::{Generation, NewTemplateData, RecurringTemplate, UpdateTemplateData};
use crate::recurrence::{RecurrenceRule, ScheduleEvaluator};
use crate::repository::Store;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// In-memory index of active templates backed by the store.
///
/// The store is the source of truth. Every write reaches the store before the
/// cache reflects it; a failed write leaves the cache as it was.
pub struct TemplateRegistry {
    store: Arc<dyn Store>,
    evaluator: Arc<ScheduleEvaluator>,
    cache: RwLock<HashMap<Uuid, RecurringTemplate>>,
}

impl TemplateRegistry {
    pub fn new(store: Arc<dyn Store>, evaluator: Arc<ScheduleEvaluator>) -> Self {
        Self {
            store,
            evaluator,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn evaluator(&self) -> &Arc<ScheduleEvaluator> {
        &self.evaluator
    }

    /// Refreshes the cache from the store and returns the active templates.
    pub async fn load_active(&self) -> Result<Vec<RecurringTemplate>, CoreError> {
        let templates = self.store.get_active_templates().await?;

        let mut cache = self.cache.write().await;
        cache.clear();
        cache.extend(templates.iter().map(|t| (t.id, t.clone())));

        debug!(count = templates.len(), "Loaded active templates");
        Ok(templates)
    }

    /// Records a new `next_run_at` for the template.
    pub async fn mark_evaluated(&self, template_id: Uuid, next_run_at: DateTime<Utc>) -> Result<RecurringTemplate, CoreError> {
        let mut template = self.current(template_id).await?;
        template.next_run_at = next_run_at;
        template.updated_at = Utc::now();

        self.write_through(template, |store, updated| async move { store.save_template(&updated).await })
            .await
    }

    /// Deactivates the template. Already-inactive templates are returned unchanged.
    pub async fn deactivate(&self, template_id: Uuid) -> Result<RecurringTemplate, CoreError> {
        let mut template = self.current(template_id).await?;
        if !template.active {
            return Ok(template);
        }

        let now = Utc::now();
        template.active = false;
        template.deactivated_at = Some(now);
        template.updated_at = now;

        let template = self
            .write_through(template, |store, updated| async move { store.save_template(&updated).await })
            .await?;
        info!(template_id = %template_id, "Template deactivated");
        Ok(template)
    }

    /// Persists a planned firing and advances the template in one transaction.
    ///
    /// `next_run_at = None` means the series has ended and the template is
    /// deactivated as part of the same commit.
    pub async fn commit_generation(
        &self,
        template_id: Uuid,
        generation: Option<&Generation>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<RecurringTemplate, CoreError> {
        let mut template = self.current(template_id).await?;
        let now = Utc::now();
        match next_run_at {
            Some(next_run_at) => template.next_run_at = next_run_at,
            None => {
                template.active = false;
                template.deactivated_at = Some(now);
            }
        }
        template.updated_at = now;

        let generation = generation.cloned();
        self.write_through(template, |store, updated| async move {
            store.commit_generation(&updated, generation.as_ref()).await
        })
        .await
    }

    /// Validates the rule, computes the first run and persists a new template.
    pub async fn create(&self, data: NewTemplateData) -> Result<RecurringTemplate, CoreError> {
        self.create_at(data, Utc::now()).await
    }

    /// Like [`create`](Self::create) with an explicit creation instant.
    pub async fn create_at(&self, data: NewTemplateData, now: DateTime<Utc>) -> Result<RecurringTemplate, CoreError> {
        if data.payload.title.trim().is_empty() {
            return Err(CoreError::InvalidInput("Template title cannot be empty".to_string()));
        }
        self.evaluator.validate(&data.rule)?;

        let next_run_at = self.initial_run(&data.rule, now)?;
        let template = RecurringTemplate {
            id: Uuid::now_v7(),
            rule: data.rule,
            payload: data.payload,
            next_run_at,
            external_calendar_id: data.external_calendar_id,
            active: true,
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.save_template(&template).await?;
        self.invalidate(template.id).await;

        info!(template_id = %template.id, next_run_at = %template.next_run_at, "Template created");
        Ok(template)
    }

    /// Applies field changes. A replaced rule is validated and `next_run_at` recomputed.
    pub async fn update(&self, template_id: Uuid, data: UpdateTemplateData) -> Result<RecurringTemplate, CoreError> {
        let mut template = self
            .store
            .get_template(template_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Template {}", template_id)))?;

        if data.is_empty() {
            return Ok(template);
        }

        let now = Utc::now();
        if let Some(rule) = data.rule {
            self.evaluator.validate(&rule)?;
            template.next_run_at = self.initial_run(&rule, now)?;
            template.rule = rule;
        }
        if let Some(title) = data.title {
            if title.trim().is_empty() {
                return Err(CoreError::InvalidInput("Template title cannot be empty".to_string()));
            }
            template.payload.title = title;
        }
        if let Some(description) = data.description {
            template.payload.description = description;
        }
        if let Some(category) = data.category {
            template.payload.category = category;
        }
        if let Some(priority) = data.priority {
            template.payload.priority = priority;
        }
        if let Some(assignee) = data.assignee {
            template.payload.assignee = assignee;
        }
        if let Some(calendar) = data.external_calendar_id {
            template.external_calendar_id = calendar;
        }
        template.updated_at = now;

        self.store.save_template(&template).await?;
        self.invalidate(template_id).await;

        info!(template_id = %template_id, "Template updated");
        Ok(template)
    }

    /// Drops the cached entry; the next read goes to the store.
    pub async fn invalidate(&self, template_id: Uuid) {
        self.cache.write().await.remove(&template_id);
    }

    pub async fn get(&self, template_id: Uuid) -> Result<Option<RecurringTemplate>, CoreError> {
        if let Some(template) = self.cache.read().await.get(&template_id) {
            return Ok(Some(template.clone()));
        }
        self.store.get_template(template_id).await
    }

    pub async fn list(&self, include_inactive: bool) -> Result<Vec<RecurringTemplate>, CoreError> {
        self.store.list_templates(include_inactive).await
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn current(&self, template_id: Uuid) -> Result<RecurringTemplate, CoreError> {
        self.get(template_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Template {}", template_id)))
    }

    fn initial_run(&self, rule: &RecurrenceRule, now: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
        self.evaluator
            .first_run(rule, rule.anchor.max(now))?
            .ok_or_else(|| CoreError::InvalidRule("rule has no occurrences after now".to_string()))
    }

    /// Runs `persist` and installs `updated` in the cache once the write has
    /// landed. A failed write leaves the cache untouched. Inactive templates
    /// leave the cache.
    async fn write_through<F, Fut>(&self, updated: RecurringTemplate, persist: F) -> Result<RecurringTemplate, CoreError>
    where
        F: FnOnce(Arc<dyn Store>, RecurringTemplate) -> Fut,
        Fut: std::future::Future<Output = Result<(), CoreError>>,
    {
        persist(Arc::clone(&self.store), updated.clone()).await?;

        let mut cache = self.cache.write().await;
        if updated.active {
            cache.insert(updated.id, updated.clone());
        } else {
            cache.remove(&updated.id);
        }
        Ok(updated)
    }
}
