#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

/// Test harness for running CLI commands against a temporary database
pub struct CliTestHarness {
    temp_dir: TempDir,
    db_path: PathBuf,
}

impl CliTestHarness {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");

        Self { temp_dir, db_path }
    }

    /// A command running inside the temp directory, so no stray
    /// `config.toml` is picked up.
    pub fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("cadence").expect("Failed to find cadence binary");
        cmd.current_dir(self.temp_dir.path())
            .env("CADENCE_DATABASE_PATH", &self.db_path)
            .env("CADENCE_DEFAULT_TIMEZONE", "UTC")
            .env_remove("CADENCE_CALENDAR__BASE_URL")
            .env_remove("RUST_LOG");
        cmd
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn write_config(&self, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join("config.toml");
        std::fs::write(&path, contents).expect("Failed to write config");
        path
    }

    pub fn run_success(&self, args: &[&str]) -> assert_cmd::assert::Assert {
        self.command().args(args).assert().success()
    }

    pub fn run_failure(&self, args: &[&str]) -> assert_cmd::assert::Assert {
        self.command().args(args).assert().failure()
    }

    /// Runs `template add` and returns the new template's full ID.
    pub fn add_template(&self, args: &[&str]) -> String {
        let mut argv = vec!["template", "add"];
        argv.extend_from_slice(args);
        let output = self.run_success(&argv).get_output().stdout.clone();
        let stdout = String::from_utf8_lossy(&output);
        extract_uuid(&stdout).expect("template add did not print an ID")
    }
}

/// First UUID in `text`, ignoring any ANSI styling around it.
pub fn extract_uuid(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    (0..bytes.len().saturating_sub(35)).find_map(|start| {
        let candidate = text.get(start..start + 36)?;
        Uuid::parse_str(candidate).ok().map(|id| id.to_string())
    })
}

pub mod assertions {
    use predicates::prelude::*;

    pub fn has_template_table_headers() -> impl Predicate<str> {
        predicate::str::contains("ID")
            .and(predicate::str::contains("Title"))
            .and(predicate::str::contains("Schedule"))
            .and(predicate::str::contains("Next Run"))
    }

    pub fn template_created_successfully() -> impl Predicate<str> {
        predicate::str::contains("✓").and(predicate::str::contains("Created template"))
    }

    pub fn has_error() -> impl Predicate<str> {
        predicate::str::contains("Error").or(predicate::str::contains("error"))
    }
}
