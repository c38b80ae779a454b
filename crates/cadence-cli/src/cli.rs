use cadence_core::models::{IntentStatus, TaskPriority};
use cadence_core::recurrence::Frequency;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Cadence: recurring tasks that keep your calendar in step
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage recurring templates
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Manage generated task instances
    #[command(subcommand)]
    Instances(InstancesCommand),
    /// Run a single scheduler tick now
    Tick,
    /// Run the scheduler loop until interrupted
    Run,
    /// Inspect and re-drive the calendar sync outbox
    #[command(subcommand)]
    Outbox(OutboxCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum TemplateCommand {
    /// Create a new recurring template
    Add(AddTemplateCommand),
    /// List templates
    List(ListTemplatesCommand),
    /// Show a single template
    Show(TemplateIdArg),
    /// Preview upcoming occurrences of a template
    Preview(PreviewCommand),
    /// Edit a template
    Edit(EditTemplateCommand),
    /// Deactivate a template and cancel its pending instances
    Deactivate(DeactivateCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum InstancesCommand {
    /// List instances generated for a template
    List(ListInstancesCommand),
    /// Mark an instance as completed
    Complete(InstanceIdArg),
}

#[derive(Subcommand, Debug, Clone)]
pub enum OutboxCommand {
    /// List sync intents
    List(ListOutboxCommand),
    /// Put a failed or dead intent back into the queue
    Redrive(IntentIdArg),
}

/// Schedule shape shared by `add` and `edit`.
#[derive(Args, Debug, Clone, Default)]
pub struct ScheduleArgs {
    /// Repeat unit (daily, weekly, monthly, yearly)
    #[arg(long)]
    pub every: Option<Frequency>,
    /// Repeat every N units
    #[arg(long)]
    pub interval: Option<u32>,
    /// Days of week (mon,wed,fri or "weekdays")
    #[arg(long, conflicts_with_all = ["month_day", "last_business_day", "nth"])]
    pub on: Option<String>,
    /// Days of month, negative counts from the end (1,15,-1)
    #[arg(long, allow_hyphen_values = true, conflicts_with_all = ["last_business_day", "nth"])]
    pub month_day: Option<String>,
    /// Fire on the last business day of the month
    #[arg(long)]
    pub last_business_day: bool,
    /// Nth weekday of the month, negative counts from the end (requires --weekday)
    #[arg(long, allow_hyphen_values = true, requires = "weekday")]
    pub nth: Option<i8>,
    /// Weekday used with --nth
    #[arg(long, requires = "nth")]
    pub weekday: Option<String>,
    /// Local time of day (e.g. '09:00', '5:30 PM')
    #[arg(long)]
    pub at: Option<String>,
    /// IANA timezone (e.g. 'Europe/Berlin')
    #[arg(long)]
    pub timezone: Option<String>,
}

impl ScheduleArgs {
    pub fn has_constraint(&self) -> bool {
        self.on.is_some() || self.month_day.is_some() || self.last_business_day || self.nth.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.every.is_none()
            && self.interval.is_none()
            && !self.has_constraint()
            && self.at.is_none()
            && self.timezone.is_none()
    }
}

#[derive(Parser, Debug, Clone)]
pub struct AddTemplateCommand {
    /// Title of the generated tasks
    pub title: String,
    #[command(flatten)]
    pub schedule: ScheduleArgs,
    /// First day the schedule may fire (e.g. 'next monday', '2025-03-01')
    #[arg(long)]
    pub start: Option<String>,
    /// Last day the schedule may fire
    #[arg(long, conflicts_with = "count")]
    pub until: Option<String>,
    /// Maximum number of occurrences
    #[arg(long)]
    pub count: Option<u32>,
    #[arg(short, long)]
    pub description: Option<String>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub priority: Option<TaskPriority>,
    #[arg(long)]
    pub assignee: Option<String>,
    /// External calendar to mirror instances into
    #[arg(long)]
    pub calendar: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct EditTemplateCommand {
    /// The ID of the template to edit
    pub id: String,
    #[command(flatten)]
    pub schedule: ScheduleArgs,
    /// Drop any day constraint from the rule
    #[arg(long, conflicts_with_all = ["on", "month_day", "last_business_day", "nth"])]
    pub constraint_clear: bool,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub description: Option<String>,
    #[arg(long, conflicts_with = "description")]
    pub description_clear: bool,

    #[arg(long)]
    pub category: Option<String>,
    #[arg(long, conflicts_with = "category")]
    pub category_clear: bool,

    #[arg(long)]
    pub priority: Option<TaskPriority>,

    #[arg(long)]
    pub assignee: Option<String>,
    #[arg(long, conflicts_with = "assignee")]
    pub assignee_clear: bool,

    #[arg(long)]
    pub calendar: Option<String>,
    #[arg(long, conflicts_with = "calendar")]
    pub calendar_clear: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ListTemplatesCommand {
    /// Include deactivated templates
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct TemplateIdArg {
    /// The ID (or unique prefix) of the template
    pub id: String,
}

#[derive(Parser, Debug, Clone)]
pub struct PreviewCommand {
    /// The ID (or unique prefix) of the template
    pub id: String,
    /// Number of occurrences to show
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct DeactivateCommand {
    /// The ID (or unique prefix) of the template
    pub id: String,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ListInstancesCommand {
    /// Only show instances of this template
    pub template_id: Option<String>,
    /// Maximum number of rows
    #[arg(short, long, default_value_t = 50)]
    pub limit: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct InstanceIdArg {
    /// The ID (or unique prefix) of the instance
    pub id: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ListOutboxCommand {
    /// Filter by status (pending, failed, dead, acked)
    #[arg(short, long)]
    pub status: Option<IntentStatus>,
}

#[derive(Parser, Debug, Clone)]
pub struct IntentIdArg {
    /// The ID (or unique prefix) of the intent
    pub id: String,
}
