//! Process-wide scheduling loop.
//!
//! Each tick loads the active templates, generates an instance for every due
//! template, advances its `next_run_at` in the same transaction, and then
//! flushes pending outbox intents to the calendar provider.

use crate::error::CoreError;
use crate::generator::OccurrenceGenerator;
use crate::models::{RecurringTemplate, SchedulerConfig, SyncConfig, TickSummary};
use crate::recurrence::ScheduleEvaluator;
use crate::registry::TemplateRegistry;
use crate::repository::Store;
use crate::sync::{CalendarProvider, CalendarSyncAdapter, SyncOutcome};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum LoopState {
    Stopped,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
}

struct TemplateOutcome {
    created: bool,
    completed: bool,
}

struct SchedulerInner {
    registry: Arc<TemplateRegistry>,
    generator: OccurrenceGenerator,
    adapter: CalendarSyncAdapter,
    config: SchedulerConfig,
    // Serializes ticks from the loop and from direct `tick` calls.
    tick_lock: Mutex<()>,
}

/// Owns the tick loop. `Stopped -> Running -> Stopped`.
pub struct SchedulerLoop {
    inner: Arc<SchedulerInner>,
    state: Mutex<LoopState>,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn CalendarProvider>,
        evaluator: Arc<ScheduleEvaluator>,
        config: SchedulerConfig,
        sync_config: &SyncConfig,
    ) -> Self {
        let registry = Arc::new(TemplateRegistry::new(Arc::clone(&store), evaluator));
        let inner = SchedulerInner {
            registry,
            generator: OccurrenceGenerator::new(Arc::clone(&store)),
            adapter: CalendarSyncAdapter::new(provider, store, sync_config),
            config,
            tick_lock: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
            state: Mutex::new(LoopState::Stopped),
        }
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub async fn is_running(&self) -> bool {
        match &*self.state.lock().await {
            LoopState::Stopped => false,
            LoopState::Running { handle, .. } => !handle.is_finished(),
        }
    }

    /// Spawns the tick loop. The loop also stops when `shutdown` fires.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<(), CoreError> {
        if self.inner.config.tick_interval.is_zero() {
            return Err(CoreError::InvalidInput("scheduler tick_interval must be greater than zero".to_string()));
        }

        let mut state = self.state.lock().await;
        if let LoopState::Running { handle, .. } = &*state {
            if !handle.is_finished() {
                return Err(CoreError::AlreadyRunning);
            }
        }

        let cancel = shutdown.child_token();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run(token).await });

        *state = LoopState::Running { cancel, handle };
        Ok(())
    }

    /// Cancels the loop and waits for the in-flight tick to finish.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, LoopState::Stopped) {
            LoopState::Stopped => Err(CoreError::NotRunning),
            LoopState::Running { cancel, handle } => {
                cancel.cancel();
                if let Err(e) = handle.await {
                    error!(error = %e, "Scheduler task ended abnormally");
                }
                Ok(())
            }
        }
    }

    /// Runs one tick as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        self.inner.tick(now, &CancellationToken::new()).await
    }

    /// Runs one tick whose calendar calls abort when `cancel` fires.
    pub async fn tick_with_cancel(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> TickSummary {
        self.inner.tick(now, cancel).await
    }
}

impl SchedulerInner {
    async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_interval_secs = self.config.tick_interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick(Utc::now(), &cancel).await;
        }

        info!("Scheduler stopped");
    }

    async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> TickSummary {
        let _guard = self.tick_lock.lock().await;
        let started = Instant::now();
        let mut summary = TickSummary::default();

        match self.registry.load_active().await {
            Ok(templates) => {
                let due: Vec<RecurringTemplate> = templates.into_iter().filter(|t| t.is_due(now)).collect();
                summary.templates_evaluated = due.len();

                let outcomes: Vec<(Uuid, Result<TemplateOutcome, CoreError>)> = stream::iter(due)
                    .map(|template| async move { (template.id, self.process_template(template, now).await) })
                    .buffer_unordered(self.config.template_concurrency.max(1))
                    .collect()
                    .await;

                for (template_id, outcome) in outcomes {
                    match outcome {
                        Ok(outcome) => {
                            if outcome.created {
                                summary.instances_created += 1;
                            }
                            if outcome.completed {
                                summary.templates_completed += 1;
                            }
                        }
                        Err(e) => {
                            error!(template_id = %template_id, error = %e, "Failed to process template");
                            summary.templates_with_errors += 1;
                            summary.errors.push(format!("Template {}: {}", template_id, e));
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to load active templates");
                summary.errors.push(format!("Loading templates: {}", e));
            }
        }

        if !cancel.is_cancelled() {
            match self.adapter.flush_pending(self.config.max_flush_batch, cancel).await {
                Ok(results) => {
                    summary.intents_flushed = results.len();
                    for result in &results {
                        match &result.outcome {
                            SyncOutcome::Acked { .. } | SyncOutcome::Skipped => summary.intents_acked += 1,
                            SyncOutcome::Failed { error } => {
                                summary.intents_failed += 1;
                                summary.errors.push(format!("Intent {}: {}", result.intent_id, error));
                            }
                            SyncOutcome::Dead { error } => {
                                summary.intents_dead += 1;
                                summary.errors.push(format!("Intent {}: {}", result.intent_id, error));
                            }
                            SyncOutcome::Cancelled => {}
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to load pending sync intents");
                    summary.errors.push(format!("Loading outbox: {}", e));
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        if summary.templates_evaluated > 0 || summary.intents_flushed > 0 || !summary.errors.is_empty() {
            info!(
                evaluated = summary.templates_evaluated,
                created = summary.instances_created,
                completed = summary.templates_completed,
                flushed = summary.intents_flushed,
                acked = summary.intents_acked,
                failed = summary.intents_failed,
                dead = summary.intents_dead,
                errors = summary.errors.len(),
                duration_ms = summary.duration_ms,
                "Scheduler tick complete"
            );
        } else {
            debug!(duration_ms = summary.duration_ms, "Scheduler tick idle");
        }
        summary
    }

    /// Generates the due firing and advances the template atomically.
    async fn process_template(&self, template: RecurringTemplate, now: DateTime<Utc>) -> Result<TemplateOutcome, CoreError> {
        let firing = template.next_run_at;
        let generation = self.generator.plan(&template, firing).await?;

        // Skipped occurrences would still count toward a rule's max_occurrences.
        let skip_missed = !self.config.enable_catchup && template.rule.max_occurrences.is_none();
        let reference = if skip_missed { firing.max(now) } else { firing };
        let next_run_at = self.registry.evaluator().compute_next_run(&template.rule, reference)?;
        if next_run_at.is_none() {
            debug!(template_id = %template.id, "Series ended; deactivating template");
        } else if skip_missed && now > firing {
            warn!(template_id = %template.id, firing = %firing, "Template was overdue; skipping missed occurrences");
        }

        let created = generation.is_new();
        let updated = self
            .registry
            .commit_generation(template.id, Some(&generation), next_run_at)
            .await?;

        Ok(TemplateOutcome {
            created,
            completed: !updated.active,
        })
    }
}
