use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::recurrence::{RecurrenceRule, DEFAULT_LOOKAHEAD_DAYS};

/// Length of the calendar event created for each instance.
pub const EVENT_DURATION_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid task status: {0}")]
pub struct ParseTaskStatusError(String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(ParseTaskStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid task priority: {0}")]
pub struct ParseTaskPriorityError(String);

impl FromStr for TaskPriority {
    type Err = ParseTaskPriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(TaskPriority::None),
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            _ => Err(ParseTaskPriorityError(s.to_string())),
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Task fields stamped onto every instance a template generates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: TaskPriority,
    pub assignee: Option<String>,
}

/// A persisted description of a repeating task. Not itself a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringTemplate {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    pub rule: RecurrenceRule,
    pub payload: TaskPayload,
    /// Next due evaluation; only the scheduler advances it
    pub next_run_at: DateTime<Utc>,
    /// Weak reference to the linked external calendar
    pub external_calendar_id: Option<String>,
    /// Inactive templates are kept for history but never evaluated
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTemplate {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && now >= self.next_run_at
    }
}

/// Data required to create a new template
#[derive(Debug, Clone)]
pub struct NewTemplateData {
    pub rule: RecurrenceRule,
    pub payload: TaskPayload,
    pub external_calendar_id: Option<String>,
}

/// Data for modifying an existing template
#[derive(Debug, Clone, Default)]
pub struct UpdateTemplateData {
    /// Replacing the rule recomputes `next_run_at`
    pub rule: Option<RecurrenceRule>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub priority: Option<TaskPriority>,
    pub assignee: Option<Option<String>>,
    pub external_calendar_id: Option<Option<String>>,
}

impl UpdateTemplateData {
    pub fn is_empty(&self) -> bool {
        self.rule.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && self.external_calendar_id.is_none()
    }

    /// Whether already-synced instances need their calendar events refreshed.
    pub fn touches_events(&self) -> bool {
        self.title.is_some() || self.description.is_some() || self.external_calendar_id.is_some()
    }
}

// ============================================================================
// Instances
// ============================================================================

/// A concrete task generated from a template for one occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct TaskInstance {
    pub id: Uuid,
    pub template_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: TaskPriority,
    pub assignee: Option<String>,
    /// Set once the calendar confirms the remote event exists
    pub external_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    pub fn from_template(template: &RecurringTemplate, scheduled_for: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            template_id: template.id,
            scheduled_for,
            status: TaskStatus::Pending,
            title: template.payload.title.clone(),
            description: template.payload.description.clone(),
            category: template.payload.category.clone(),
            priority: template.payload.priority.clone(),
            assignee: template.payload.assignee.clone(),
            external_event_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Sync intents (outbox)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Create,
    Update,
    Cancel,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOp::Create => "create",
            SyncOp::Update => "update",
            SyncOp::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for SyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    /// Waiting for its first delivery attempt
    Pending,
    /// Retries exhausted; re-driven on the next tick
    Failed,
    /// Permanently rejected by the provider
    Dead,
    /// Delivered and acknowledged
    Acked,
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentStatus::Pending => write!(f, "pending"),
            IntentStatus::Failed => write!(f, "failed"),
            IntentStatus::Dead => write!(f, "dead"),
            IntentStatus::Acked => write!(f, "acked"),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid intent status: {0}")]
pub struct ParseIntentStatusError(String);

impl FromStr for IntentStatus {
    type Err = ParseIntentStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(IntentStatus::Pending),
            "failed" => Ok(IntentStatus::Failed),
            "dead" => Ok(IntentStatus::Dead),
            "acked" => Ok(IntentStatus::Acked),
            _ => Err(ParseIntentStatusError(s.to_string())),
        }
    }
}

/// Everything the calendar provider needs to create or update an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPayload {
    pub calendar_id: String,
    pub title: String,
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl EventPayload {
    pub fn for_instance(calendar_id: &str, instance: &TaskInstance) -> Self {
        Self {
            calendar_id: calendar_id.to_string(),
            title: instance.title.clone(),
            description: instance.description.clone(),
            starts_at: instance.scheduled_for,
            ends_at: instance.scheduled_for + Duration::minutes(EVENT_DURATION_MINUTES),
        }
    }
}

/// A pending synchronization action, tracked in the outbox until acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncIntent {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub op: SyncOp,
    /// Remote event id as known when the intent was enqueued
    pub external_event_id: Option<String>,
    pub idempotency_key: Uuid,
    /// Absent when the template has no linked calendar
    pub payload: Option<EventPayload>,
    pub status: IntentStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncIntent {
    pub fn new(instance: &TaskInstance, op: SyncOp, payload: Option<EventPayload>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            op,
            external_event_id: instance.external_event_id.clone(),
            idempotency_key: Self::key_for_revision(instance, op),
            payload,
            status: IntentStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic key over `(instance_id, op)`; replays reuse it.
    pub fn idempotency_key_for(instance_id: Uuid, op: SyncOp) -> Uuid {
        Uuid::new_v5(&instance_id, op.as_str().as_bytes())
    }

    /// Updates also fold in the instance revision, so each edit is a new
    /// request while a replay of the stored intent keeps its key.
    fn key_for_revision(instance: &TaskInstance, op: SyncOp) -> Uuid {
        match op {
            SyncOp::Update => {
                let name = format!("{}@{}", op.as_str(), instance.updated_at.timestamp_micros());
                Uuid::new_v5(&instance.id, name.as_bytes())
            }
            SyncOp::Create | SyncOp::Cancel => Self::idempotency_key_for(instance.id, op),
        }
    }
}

/// The outcome of planning one firing of a template.
#[derive(Debug, Clone)]
pub struct Generation {
    pub instance: TaskInstance,
    /// `None` when the instance already existed
    pub intent: Option<SyncIntent>,
}

impl Generation {
    pub fn is_new(&self) -> bool {
        self.intent.is_some()
    }
}

// ============================================================================
// Tick reporting
// ============================================================================

/// Statistics collected during one scheduler tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    /// Number of due templates processed
    pub templates_evaluated: usize,
    /// Instances newly persisted this tick
    pub instances_created: usize,
    /// Templates whose series ended and were deactivated
    pub templates_completed: usize,
    /// Number of templates that had errors
    pub templates_with_errors: usize,
    pub intents_flushed: usize,
    pub intents_acked: usize,
    pub intents_failed: usize,
    pub intents_dead: usize,
    /// Detailed error messages
    pub errors: Vec<String>,
    /// Time taken for the tick
    pub duration_ms: u64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler loop tuning
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: std::time::Duration,
    /// Distinct templates processed concurrently within one tick
    pub template_concurrency: usize,
    /// Outbox intents handed to the adapter per tick
    pub max_flush_batch: u32,
    /// Generate missed past occurrences one by one. When off, an overdue
    /// template jumps to its first occurrence after now, except for
    /// count-limited rules, which never skip.
    pub enable_catchup: bool,
    /// Bound for constrained-rule searches
    pub lookahead_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: std::time::Duration::from_secs(60),
            template_concurrency: 8,
            max_flush_batch: 100,
            enable_catchup: true,
            lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
        }
    }
}

/// Calendar sync retry and timeout policy
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Total provider attempts per intent per flush
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_backoff: std::time::Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: std::time::Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub call_timeout: std::time::Duration,
    pub max_concurrent_calls: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: std::time::Duration::from_millis(500),
            max_backoff: std::time::Duration::from_secs(30),
            call_timeout: std::time::Duration::from_secs(10),
            max_concurrent_calls: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let instance_id = Uuid::now_v7();
        let a = SyncIntent::idempotency_key_for(instance_id, SyncOp::Create);
        let b = SyncIntent::idempotency_key_for(instance_id, SyncOp::Create);
        let c = SyncIntent::idempotency_key_for(instance_id, SyncOp::Cancel);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Failed".parse::<IntentStatus>(), Ok(IntentStatus::Failed));
        assert_eq!("high".parse::<TaskPriority>(), Ok(TaskPriority::High));
        assert!("sometimes".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_config_durations_deserialize() {
        let config: SyncConfig = serde_json::from_value(serde_json::json!({
            "max_attempts": 2,
            "initial_backoff": 10,
            "call_timeout": 250
        }))
        .unwrap();

        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.initial_backoff, std::time::Duration::from_millis(10));
        assert_eq!(config.call_timeout, std::time::Duration::from_millis(250));
        assert_eq!(config.max_backoff, SyncConfig::default().max_backoff);
    }
}
