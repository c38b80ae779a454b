//! # Cadence Core Library
//!
//! A recurring-task scheduling engine: templates describe a repeating
//! schedule, the scheduler expands them into concrete task instances at the
//! right instants, and an outbox keeps an external calendar in step.
//!
//! ## Features
//!
//! - **Pure Schedule Evaluation**: Fixed-interval and constrained rules with
//!   month-end clamping, pluggable day predicates and DST-aware local times
//! - **Crash-Safe Generation**: Instance, sync intent and `next_run_at` are
//!   committed in one SQLite transaction
//! - **Durable Calendar Sync**: At-least-once delivery with deterministic
//!   idempotency keys, exponential backoff and dead-lettering
//! - **Owned Scheduler Loop**: Explicit start/stop driven by a
//!   `CancellationToken`, bounded concurrency across templates
//!
//! ## Core Modules
//!
//! - [`db`]: Database connection and migration management
//! - [`models`]: Core data structures and configuration
//! - [`recurrence`]: Recurrence rules and the schedule evaluator
//! - [`repository`]: Store traits and the SQLite implementation
//! - [`registry`]: Cached index of active templates
//! - [`generator`]: Instance materialization and intent emission
//! - [`sync`]: Calendar providers and the outbox adapter
//! - [`scheduler`]: The tick loop tying everything together
//! - [`timezone`]: Timezone utilities and validation
//! - [`error`]: Error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence_core::{
//!     db,
//!     models::{NewTemplateData, SchedulerConfig, SyncConfig, TaskPayload},
//!     recurrence::{RecurrenceRule, ScheduleEvaluator},
//!     repository::SqliteRepository,
//!     scheduler::SchedulerLoop,
//!     sync::InMemoryCalendarProvider,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = db::establish_connection("cadence.db").await?;
//!     let scheduler = SchedulerLoop::new(
//!         Arc::new(SqliteRepository::new(pool)),
//!         Arc::new(InMemoryCalendarProvider::new()),
//!         Arc::new(ScheduleEvaluator::default()),
//!         SchedulerConfig::default(),
//!         &SyncConfig::default(),
//!     );
//!
//!     let anchor = chrono::Utc::now();
//!     let template = scheduler
//!         .registry()
//!         .create(NewTemplateData {
//!             rule: RecurrenceRule::weekly(anchor, "Europe/Berlin"),
//!             payload: TaskPayload {
//!                 title: "Weekly review".to_string(),
//!                 ..Default::default()
//!             },
//!             external_calendar_id: None,
//!         })
//!         .await?;
//!     println!("Next run: {}", template.next_run_at);
//!
//!     let summary = scheduler.tick(chrono::Utc::now()).await;
//!     println!("Created {} instances", summary.instances_created);
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
pub mod generator;
pub mod models;
pub mod recurrence;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod sync;
pub mod timezone;
