use anyhow::{anyhow, Result};
use cadence_core::error::CoreError;
use cadence_core::models::{NewTemplateData, RecurringTemplate, TaskPayload, UpdateTemplateData};
use cadence_core::recurrence::{DayConstraint, RecurrenceRule};
use cadence_core::repository::TemplateRepository;
use cadence_core::timezone::parse_timezone;
use chrono::{NaiveTime, Utc};
use dialoguer::Confirm;
use owo_colors::{OwoColorize, Style};

use super::App;
use crate::cli::{
    AddTemplateCommand, DeactivateCommand, EditTemplateCommand, ListTemplatesCommand, PreviewCommand, ScheduleArgs,
    TemplateCommand, TemplateIdArg,
};
use crate::parser::{end_of_day, local_instant, parse_date, parse_month_days, parse_time_of_day, parse_weekday, parse_weekdays};
use crate::timezone::normalize_timezone_input;
use crate::util::{resolve_template_id, short_id};
use crate::views::table::{describe_rule, display_preview, display_templates, format_local};

const DEFAULT_TIME: (u32, u32) = (9, 0);

pub async fn template_command(app: &App, command: TemplateCommand) -> Result<()> {
    match command {
        TemplateCommand::Add(command) => add_template(app, command).await,
        TemplateCommand::List(command) => list_templates(app, command).await,
        TemplateCommand::Show(command) => show_template(app, command).await,
        TemplateCommand::Preview(command) => preview_template(app, command).await,
        TemplateCommand::Edit(command) => edit_template(app, command).await,
        TemplateCommand::Deactivate(command) => deactivate_template(app, command).await,
    }
}

fn build_constraint(schedule: &ScheduleArgs) -> Result<Option<DayConstraint>> {
    if let Some(on) = &schedule.on {
        return Ok(Some(DayConstraint::Weekdays { days: parse_weekdays(on)? }));
    }
    if let Some(days) = &schedule.month_day {
        return Ok(Some(DayConstraint::MonthDays { days: parse_month_days(days)? }));
    }
    if schedule.last_business_day {
        return Ok(Some(DayConstraint::LastBusinessDay));
    }
    if let (Some(n), Some(weekday)) = (schedule.nth, &schedule.weekday) {
        return Ok(Some(DayConstraint::NthWeekday { n, weekday: parse_weekday(weekday)? }));
    }
    Ok(None)
}

fn resolve_timezone(input: Option<&str>, fallback: &str) -> Result<String> {
    match input {
        Some(tz) => Ok(normalize_timezone_input(tz)?),
        None => Ok(fallback.to_string()),
    }
}

async fn load_template(app: &App, short: &str) -> Result<RecurringTemplate> {
    let id = resolve_template_id(app.repo.as_ref(), short).await?;
    app.repo
        .get_template(id)
        .await?
        .ok_or_else(|| anyhow!(CoreError::NotFound(format!("Template with ID '{}' not found.", id))))
}

pub async fn add_template(app: &App, command: AddTemplateCommand) -> Result<()> {
    let schedule = &command.schedule;
    let frequency = schedule.every.ok_or_else(|| {
        anyhow!(CoreError::InvalidInput(
            "--every is required (daily, weekly, monthly or yearly)".to_string()
        ))
    })?;

    let timezone = resolve_timezone(schedule.timezone.as_deref(), &app.default_timezone)?;
    let tz = parse_timezone(&timezone)?;
    let now = Utc::now();

    let start = match &command.start {
        Some(start) => parse_date(start, tz, now)?,
        None => now.with_timezone(&tz).date_naive(),
    };
    let time = match &schedule.at {
        Some(at) => parse_time_of_day(at)?,
        None => NaiveTime::from_hms_opt(DEFAULT_TIME.0, DEFAULT_TIME.1, 0).unwrap_or_default(),
    };

    let mut rule = RecurrenceRule::new(frequency, local_instant(tz, start, time), timezone.as_str())
        .every(schedule.interval.unwrap_or(1));
    if let Some(constraint) = build_constraint(schedule)? {
        rule = rule.with_constraint(constraint);
    }
    if let Some(count) = command.count {
        rule = rule.limit(count);
    }
    if let Some(until) = &command.until {
        rule = rule.until(end_of_day(tz, parse_date(until, tz, now)?));
    }

    let template = app
        .registry()
        .create(NewTemplateData {
            rule,
            payload: TaskPayload {
                title: command.title,
                description: command.description,
                category: command.category,
                priority: command.priority.unwrap_or_default(),
                assignee: command.assignee,
            },
            external_calendar_id: command.calendar,
        })
        .await?;

    let success_style = Style::new().green().bold();
    let info_style = Style::new().blue();
    let subtle_style = Style::new().bright_black();

    println!(
        "{} Created template: {}",
        "✓".style(success_style),
        template.payload.title.bright_white().bold()
    );
    println!("  {} Template ID: {}", "→".style(info_style), template.id.to_string().yellow());
    println!("  {} Schedule: {}", "→".style(info_style), describe_rule(&template.rule));
    println!(
        "  {} Next run: {}",
        "→".style(info_style),
        format_local(template.next_run_at, &template.rule.timezone)
    );
    println!(
        "   {} Preview upcoming: cadence template preview {}",
        "•".style(subtle_style),
        short_id(&template.id).yellow()
    );
    Ok(())
}

pub async fn list_templates(app: &App, command: ListTemplatesCommand) -> Result<()> {
    let templates = app.registry().list(command.all).await?;
    display_templates(&templates);
    Ok(())
}

pub async fn show_template(app: &App, command: TemplateIdArg) -> Result<()> {
    let template = load_template(app, &command.id).await?;
    let label = Style::new().bold();

    println!("{} {}", "Template".style(label), template.id.to_string().yellow());
    println!("  {:<12} {}", "Title:", template.payload.title.bright_white().bold());
    if let Some(description) = &template.payload.description {
        println!("  {:<12} {}", "Description:", description);
    }
    println!("  {:<12} {}", "Schedule:", describe_rule(&template.rule));
    if let Some(rrule) = template.rule.to_rrule() {
        println!("  {:<12} {}", "RRULE:", rrule.bright_black());
    }
    println!("  {:<12} {:?}", "Priority:", template.payload.priority);
    println!("  {:<12} {}", "Category:", template.payload.category.as_deref().unwrap_or("None"));
    println!("  {:<12} {}", "Assignee:", template.payload.assignee.as_deref().unwrap_or("None"));
    println!(
        "  {:<12} {}",
        "Calendar:",
        template.external_calendar_id.as_deref().unwrap_or("None")
    );
    if template.active {
        println!(
            "  {:<12} {}",
            "Next run:",
            format_local(template.next_run_at, &template.rule.timezone)
        );
    } else {
        let since = template
            .deactivated_at
            .map(|at| format!(" since {}", at.format("%Y-%m-%d %H:%M UTC")))
            .unwrap_or_default();
        println!("  {:<12} {}{}", "Status:", "Inactive".bright_black(), since);
    }
    Ok(())
}

pub async fn preview_template(app: &App, command: PreviewCommand) -> Result<()> {
    let template = load_template(app, &command.id).await?;
    if !template.active {
        println!("Template '{}' is inactive.", template.payload.title);
        return Ok(());
    }

    let occurrences = app
        .registry()
        .evaluator()
        .preview(&template.rule, template.next_run_at, command.count)?;

    println!("Upcoming runs for {}:", template.payload.title.bright_white().bold());
    display_preview(&occurrences, &template.rule.timezone);
    Ok(())
}

/// Applies the schedule flags on top of the current rule. Returns `None`
/// when no schedule flag was given.
fn edited_rule(current: &RecurrenceRule, command: &EditTemplateCommand) -> Result<Option<RecurrenceRule>> {
    let schedule = &command.schedule;
    if schedule.is_empty() && !command.constraint_clear {
        return Ok(None);
    }

    let mut rule = current.clone();
    if let Some(frequency) = schedule.every {
        rule.frequency = frequency;
    }
    if let Some(interval) = schedule.interval {
        rule.interval = interval;
    }
    if command.constraint_clear {
        rule.constraint = None;
    } else if let Some(constraint) = build_constraint(schedule)? {
        rule.constraint = Some(constraint);
    }

    if schedule.at.is_some() || schedule.timezone.is_some() {
        let old_tz = parse_timezone(&current.timezone)?;
        let local_anchor = current.anchor.with_timezone(&old_tz);

        let timezone = resolve_timezone(schedule.timezone.as_deref(), &current.timezone)?;
        let tz = parse_timezone(&timezone)?;
        let time = match &schedule.at {
            Some(at) => parse_time_of_day(at)?,
            None => local_anchor.time(),
        };
        rule.anchor = local_instant(tz, local_anchor.date_naive(), time);
        rule.timezone = timezone;
    }

    Ok(Some(rule))
}

fn clearable(value: Option<String>, clear: bool) -> Option<Option<String>> {
    if clear {
        Some(None)
    } else {
        value.map(Some)
    }
}

pub async fn edit_template(app: &App, command: EditTemplateCommand) -> Result<()> {
    let template = load_template(app, &command.id).await?;
    if !template.active {
        return Err(anyhow!(CoreError::InvalidInput(format!(
            "Template '{}' is inactive and cannot be edited.",
            template.payload.title
        ))));
    }

    let data = UpdateTemplateData {
        rule: edited_rule(&template.rule, &command)?,
        title: command.title,
        description: clearable(command.description, command.description_clear),
        category: clearable(command.category, command.category_clear),
        priority: command.priority,
        assignee: clearable(command.assignee, command.assignee_clear),
        external_calendar_id: clearable(command.calendar, command.calendar_clear),
    };

    if data.is_empty() {
        println!("No changes specified.");
        return Ok(());
    }
    let touches_events = data.touches_events();

    let updated = app.registry().update(template.id, data).await?;
    let resynced = if touches_events {
        app.generator.resync_pending(&updated, Utc::now()).await?
    } else {
        0
    };

    println!("{} Updated template: {}", "✓".green().bold(), updated.payload.title.bright_white().bold());
    println!(
        "  {} Next run: {}",
        "→".blue(),
        format_local(updated.next_run_at, &updated.rule.timezone)
    );
    if resynced > 0 {
        println!("  {} {} pending instance(s) queued for calendar update", "→".blue(), resynced);
    }
    Ok(())
}

pub async fn deactivate_template(app: &App, command: DeactivateCommand) -> Result<()> {
    let template = load_template(app, &command.id).await?;
    if !template.active {
        println!("Template '{}' is already inactive.", template.payload.title);
        return Ok(());
    }

    if !command.force {
        let confirmation = Confirm::new()
            .with_prompt(format!(
                "Deactivate template '{}' and cancel its pending instances?",
                template.payload.title
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirmation {
            println!("Deactivation cancelled.");
            return Ok(());
        }
    }

    let template = app.registry().deactivate(template.id).await?;
    let cancelled = app.generator.cancel_pending(&template, Utc::now()).await?;

    println!(
        "{} Deactivated template: {}",
        "✓".green().bold(),
        template.payload.title.bright_white().bold()
    );
    if cancelled > 0 {
        println!("  {} {} pending instance(s) cancelled", "→".blue(), cancelled);
    }
    Ok(())
}
