//! Black-box tests for the `cadence` binary.

use predicates::prelude::*;

mod helpers;
use helpers::{assertions, CliTestHarness};

#[test]
fn test_cli_help_and_version() {
    let harness = CliTestHarness::new();

    harness
        .run_success(&["--help"])
        .stdout(predicate::str::contains("template"))
        .stdout(predicate::str::contains("outbox"));

    harness.run_success(&["--version"]).stdout(predicate::str::contains("cadence"));

    harness.run_failure(&["invalid-command"]).stderr(predicate::str::contains("error"));
}

#[test]
fn test_add_and_list_templates() {
    let harness = CliTestHarness::new();

    harness
        .run_success(&["template", "add", "Standup", "--every", "daily", "--at", "9:30 AM"])
        .stdout(assertions::template_created_successfully())
        .stdout(predicate::str::contains("every day at 09:30 UTC"));

    harness
        .run_success(&[
            "template", "add", "Review", "--every", "weekly", "--on", "mon,thu", "--at", "14:00", "--timezone",
            "Europe/Berlin", "--priority", "high", "--count", "10",
        ])
        .stdout(assertions::template_created_successfully());

    harness
        .run_success(&["template", "add", "Payroll", "--every", "monthly", "--month-day", "-1", "--calendar", "finance"])
        .stdout(assertions::template_created_successfully());

    harness
        .run_success(&["template", "list"])
        .stdout(assertions::has_template_table_headers())
        .stdout(predicate::str::contains("Standup"))
        .stdout(predicate::str::contains("Review"))
        .stdout(predicate::str::contains("Payroll"))
        .stdout(predicate::str::contains("finance"));
}

#[test]
fn test_add_rejects_bad_input() {
    let harness = CliTestHarness::new();

    harness
        .run_failure(&["template", "add", "No Schedule"])
        .stderr(predicate::str::contains("--every is required"));

    harness
        .run_failure(&["template", "add", "Bad Zone", "--every", "daily", "--timezone", "Mars/Olympus"])
        .stderr(predicate::str::contains("Invalid timezone"));

    harness
        .run_failure(&["template", "add", "Bad Time", "--every", "daily", "--at", "25:99"])
        .stderr(assertions::has_error());

    harness
        .run_failure(&["template", "add", "Bad Priority", "--every", "daily", "--priority", "urgent"])
        .stderr(assertions::has_error());

    harness
        .run_failure(&["template", "add", "Bad Interval", "--every", "weekly", "--interval", "0"])
        .stderr(predicate::str::contains("Invalid schedule"));

    harness
        .run_failure(&["template", "add", "Both Bounds", "--every", "daily", "--count", "3", "--until", "2030-01-01"])
        .stderr(assertions::has_error());

    harness.run_success(&["template", "list"]).stdout(predicate::str::contains("No templates found."));
}

#[test]
fn test_show_and_preview() {
    let harness = CliTestHarness::new();
    let id = harness.add_template(&["Weekly sync", "--every", "weekly", "--on", "tue", "--at", "10:00"]);

    harness
        .run_success(&["template", "show", &id[..8]])
        .stdout(predicate::str::contains("Weekly sync"))
        .stdout(predicate::str::contains("FREQ=WEEKLY"))
        .stdout(predicate::str::contains("BYDAY=TU"));

    harness
        .run_success(&["template", "preview", &id, "-n", "3"])
        .stdout(predicate::str::contains("Upcoming runs"))
        .stdout(predicate::str::contains("Tue"))
        .stdout(predicate::str::contains("10:00"));
}

#[test]
fn test_edit_template() {
    let harness = CliTestHarness::new();
    let id = harness.add_template(&["Old title", "--every", "daily", "--description", "first"]);

    harness
        .run_success(&["template", "edit", &id, "--title", "New title", "--description-clear", "--at", "07:15"])
        .stdout(predicate::str::contains("Updated template"));

    harness
        .run_success(&["template", "show", &id])
        .stdout(predicate::str::contains("New title"))
        .stdout(predicate::str::contains("07:15"))
        .stdout(predicate::str::contains("first").not());

    harness
        .run_success(&["template", "edit", &id])
        .stdout(predicate::str::contains("No changes specified."));

    harness
        .run_failure(&["template", "edit", &id, "--title", "   "])
        .stderr(predicate::str::contains("title cannot be empty"));
}

#[test]
fn test_deactivate_template() {
    let harness = CliTestHarness::new();
    let id = harness.add_template(&["Temporary", "--every", "daily"]);

    harness
        .run_success(&["template", "deactivate", &id, "--force"])
        .stdout(predicate::str::contains("Deactivated template"));

    harness.run_success(&["template", "list"]).stdout(predicate::str::contains("No templates found."));
    harness
        .run_success(&["template", "list", "--all"])
        .stdout(predicate::str::contains("Temporary"))
        .stdout(predicate::str::contains("Inactive"));

    harness
        .run_success(&["template", "deactivate", &id, "--force"])
        .stdout(predicate::str::contains("already inactive"));
}

#[test]
fn test_id_resolution_errors() {
    let harness = CliTestHarness::new();
    harness.add_template(&["Something", "--every", "daily"]);

    harness
        .run_failure(&["template", "show", "a"])
        .stderr(predicate::str::contains("at least 2 characters"));

    harness
        .run_failure(&["template", "show", "zzzz"])
        .stderr(predicate::str::contains("No template found with ID prefix 'zzzz'"));

    harness
        .run_failure(&["outbox", "redrive", "zzzz"])
        .stderr(predicate::str::contains("No sync intent found"));

    harness
        .run_failure(&["instances", "complete", "zzzz"])
        .stderr(predicate::str::contains("No instance found"));
}

#[test]
fn test_tick_and_empty_views() {
    let harness = CliTestHarness::new();
    harness.add_template(&["Future only", "--every", "weekly", "--start", "2099-01-05"]);

    harness
        .run_success(&["tick"])
        .stdout(predicate::str::contains("Tick complete"))
        .stdout(predicate::str::contains("Templates due:       0"));

    harness.run_success(&["instances", "list"]).stdout(predicate::str::contains("No instances found."));
    harness.run_success(&["outbox", "list"]).stdout(predicate::str::contains("No sync intents found."));
    harness
        .run_success(&["outbox", "list", "--status", "dead"])
        .stdout(predicate::str::contains("No sync intents found."));
    harness.run_failure(&["outbox", "list", "--status", "lost"]).stderr(assertions::has_error());
}

#[test]
fn test_config_file_sets_default_timezone() {
    let harness = CliTestHarness::new();
    harness.write_config("default_timezone = \"Asia/Tokyo\"\n");

    harness
        .command()
        .env_remove("CADENCE_DEFAULT_TIMEZONE")
        .args(["template", "add", "Tokyo standup", "--every", "daily", "--at", "09:00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Asia/Tokyo"));
}

#[test]
fn test_invalid_config_is_reported() {
    let harness = CliTestHarness::new();
    let path = harness.write_config("[scheduler]\ntick_interval = \"soon\"\n");

    harness
        .command()
        .arg("--config")
        .arg(&path)
        .args(["template", "list"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_run_rejects_zero_tick_interval() {
    let harness = CliTestHarness::new();
    let path = harness.write_config("[scheduler]\ntick_interval = 0\n");

    harness
        .command()
        .arg("--config")
        .arg(&path)
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("tick_interval must be greater than zero"))
        .stdout(predicate::str::contains("Scheduler running").not());
}
