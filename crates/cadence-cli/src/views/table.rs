use cadence_core::models::{IntentStatus, RecurringTemplate, SyncIntent, TaskInstance, TaskPriority, TaskStatus};
use cadence_core::recurrence::{Frequency, RecurrenceRule};
use cadence_core::timezone::format_with_timezone;
use chrono::{DateTime, Utc};
use chrono_humanize::Humanize;
use comfy_table::{Attribute, Cell, Color, Row, Table};

use crate::util::short_id;

/// Human-readable one-line summary of a rule.
pub fn describe_rule(rule: &RecurrenceRule) -> String {
    let unit = match rule.frequency {
        Frequency::Daily => "day",
        Frequency::Weekly => "week",
        Frequency::Monthly => "month",
        Frequency::Yearly => "year",
    };
    let mut text = if rule.interval == 1 {
        format!("every {}", unit)
    } else {
        format!("every {} {}s", rule.interval, unit)
    };

    if let Some(constraint) = &rule.constraint {
        text.push_str(&format!(" {}", constraint));
    }

    let local_time = format_with_timezone(rule.anchor, &rule.timezone, "%H:%M").unwrap_or_else(|_| "??:??".into());
    text.push_str(&format!(" at {} {}", local_time, rule.timezone));

    if let Some(count) = rule.max_occurrences {
        text.push_str(&format!(", {} times", count));
    }
    if let Some(end) = rule.end_date {
        text.push_str(&format!(", until {}", end.format("%Y-%m-%d")));
    }
    text
}

/// `Mon 2025-01-06 09:00 CET (in 3 days)`
pub fn format_local(at: DateTime<Utc>, timezone: &str) -> String {
    let local = format_with_timezone(at, timezone, "%a %Y-%m-%d %H:%M %Z")
        .unwrap_or_else(|_| at.format("%a %Y-%m-%d %H:%M UTC").to_string());
    format!("{} ({})", local, at.humanize())
}

fn priority_color(cell: Cell, priority: &TaskPriority) -> Cell {
    match priority {
        TaskPriority::High => cell.fg(Color::Red).add_attribute(Attribute::Bold),
        TaskPriority::Medium => cell.fg(Color::Yellow),
        TaskPriority::Low => cell.fg(Color::Green),
        TaskPriority::None => cell,
    }
}

pub fn display_templates(templates: &[RecurringTemplate]) {
    if templates.is_empty() {
        println!("No templates found.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Title", "Schedule", "Next Run", "Calendar"]);

    for template in templates {
        let mut row = Row::new();
        row.add_cell(Cell::new(short_id(&template.id)));

        let title = Cell::new(&template.payload.title);
        row.add_cell(if template.active {
            priority_color(title, &template.payload.priority)
        } else {
            title.add_attribute(Attribute::CrossedOut).fg(Color::DarkGrey)
        });

        row.add_cell(Cell::new(describe_rule(&template.rule)));

        let next_run = if template.active {
            let cell = Cell::new(format_local(template.next_run_at, &template.rule.timezone));
            if template.next_run_at < Utc::now() {
                cell.fg(Color::Red)
            } else {
                cell
            }
        } else {
            Cell::new("Inactive").fg(Color::DarkGrey)
        };
        row.add_cell(next_run);

        row.add_cell(Cell::new(template.external_calendar_id.as_deref().unwrap_or("None")));
        table.add_row(row);
    }

    println!("{table}");
}

pub fn display_instances(instances: &[TaskInstance]) {
    if instances.is_empty() {
        println!("No instances found.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Title", "Status", "Scheduled For", "Assignee", "Calendar Event"]);

    for instance in instances {
        let mut row = Row::new();
        row.add_cell(Cell::new(short_id(&instance.id)));

        let title = Cell::new(&instance.title);
        row.add_cell(match instance.status {
            TaskStatus::Completed | TaskStatus::Cancelled => {
                title.add_attribute(Attribute::CrossedOut).fg(Color::DarkGrey)
            }
            TaskStatus::Pending => priority_color(title, &instance.priority),
        });

        let status = Cell::new(format!("{:?}", instance.status));
        row.add_cell(match instance.status {
            TaskStatus::Completed => status.fg(Color::Green),
            TaskStatus::Cancelled => status.fg(Color::DarkGrey),
            TaskStatus::Pending => status,
        });

        let scheduled = Cell::new(format!(
            "{} ({})",
            instance.scheduled_for.format("%Y-%m-%d %H:%M UTC"),
            instance.scheduled_for.humanize()
        ));
        row.add_cell(if instance.status == TaskStatus::Pending && instance.scheduled_for < Utc::now() {
            scheduled.fg(Color::Yellow)
        } else {
            scheduled
        });

        row.add_cell(Cell::new(instance.assignee.as_deref().unwrap_or("None")));
        row.add_cell(Cell::new(instance.external_event_id.as_deref().unwrap_or("-")));
        table.add_row(row);
    }

    println!("{table}");
}

pub fn display_intents(intents: &[SyncIntent]) {
    if intents.is_empty() {
        println!("No sync intents found.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Instance", "Op", "Status", "Attempts", "Updated", "Last Error"]);

    for intent in intents {
        let mut row = Row::new();
        row.add_cell(Cell::new(short_id(&intent.id)));
        row.add_cell(Cell::new(short_id(&intent.instance_id)));
        row.add_cell(Cell::new(intent.op.to_string()));

        let status = Cell::new(intent.status.to_string());
        row.add_cell(match intent.status {
            IntentStatus::Acked => status.fg(Color::Green),
            IntentStatus::Failed => status.fg(Color::Yellow),
            IntentStatus::Dead => status.fg(Color::Red).add_attribute(Attribute::Bold),
            IntentStatus::Pending => status,
        });

        row.add_cell(Cell::new(intent.attempts));
        row.add_cell(Cell::new(intent.updated_at.humanize()));
        row.add_cell(Cell::new(intent.last_error.as_deref().unwrap_or("")));
        table.add_row(row);
    }

    println!("{table}");
}

pub fn display_preview(occurrences: &[DateTime<Utc>], timezone: &str) {
    if occurrences.is_empty() {
        println!("No upcoming occurrences.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["#", "Local Time", "UTC"]);
    for (index, at) in occurrences.iter().enumerate() {
        let mut row = Row::new();
        row.add_cell(Cell::new(index + 1));
        row.add_cell(Cell::new(format_local(*at, timezone)));
        row.add_cell(Cell::new(at.format("%Y-%m-%d %H:%M")));
        table.add_row(row);
    }

    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::recurrence::DayConstraint;
    use chrono::{TimeZone, Weekday};
    use rstest::rstest;

    fn anchor() -> DateTime<Utc> {
        // 09:00 in Berlin
        Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()
    }

    #[rstest]
    #[case(RecurrenceRule::daily(anchor(), "Europe/Berlin"), "every day at 09:00 Europe/Berlin")]
    #[case(RecurrenceRule::weekly(anchor(), "Europe/Berlin").every(2), "every 2 weeks at 09:00 Europe/Berlin")]
    #[case(
        RecurrenceRule::weekly(anchor(), "Europe/Berlin")
            .with_constraint(DayConstraint::Weekdays { days: vec![Weekday::Mon, Weekday::Wed] }),
        "every week on Mon,Wed at 09:00 Europe/Berlin"
    )]
    #[case(
        RecurrenceRule::monthly(anchor(), "Europe/Berlin").with_constraint(DayConstraint::LastBusinessDay).limit(3),
        "every month on the last business day at 09:00 Europe/Berlin, 3 times"
    )]
    fn test_describe_rule(#[case] rule: RecurrenceRule, #[case] expected: &str) {
        assert_eq!(describe_rule(&rule), expected);
    }
}
