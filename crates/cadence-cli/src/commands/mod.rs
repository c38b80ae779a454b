use cadence_core::generator::OccurrenceGenerator;
use cadence_core::registry::TemplateRegistry;
use cadence_core::repository::SqliteRepository;
use cadence_core::scheduler::SchedulerLoop;
use std::sync::Arc;

pub mod instances;
pub mod outbox;
pub mod run;
pub mod template;

/// Everything a command needs, wired once in `main`.
pub struct App {
    pub repo: Arc<SqliteRepository>,
    pub scheduler: SchedulerLoop,
    pub generator: OccurrenceGenerator,
    pub default_timezone: String,
}

impl App {
    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        self.scheduler.registry()
    }
}
