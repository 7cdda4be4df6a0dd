//! Thin wrapper around the `goose` migration binary.
//!
//! Schema changes live as plain SQL files; this crate only shells out to
//! `goose -dir <dir> <driver> <dsn> <command>` and turns a non-zero exit into
//! an error carrying goose's own output.

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Runs goose against one database
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    goose_binary_path: String,
    migrations_dir: String,
    /// goose driver name, e.g. `postgres`
    driver: String,
    dsn: String,
}

impl MigrationRunner {
    pub fn new(
        goose_binary_path: impl Into<String>,
        migrations_dir: impl Into<String>,
        driver: impl Into<String>,
        dsn: impl Into<String>,
    ) -> Self {
        Self {
            goose_binary_path: goose_binary_path.into(),
            migrations_dir: migrations_dir.into(),
            driver: driver.into(),
            dsn: dsn.into(),
        }
    }

    /// Apply every pending migration
    pub async fn run_migrations(&self) -> Result<()> {
        info!(migrations_dir = %self.migrations_dir, driver = %self.driver, "applying migrations");
        let stdout = self.goose("up").await?;
        debug!("goose up output:\n{}", stdout);
        Ok(())
    }

    /// Roll back the most recent migration
    pub async fn rollback_migration(&self) -> Result<()> {
        let stdout = self.goose("down").await?;
        debug!("goose down output:\n{}", stdout);
        Ok(())
    }

    /// goose's status table as printed
    pub async fn migration_status(&self) -> Result<String> {
        self.goose("status").await
    }

    fn command_args<'a>(&'a self, command: &'a str) -> [&'a str; 5] {
        ["-dir", &self.migrations_dir, &self.driver, &self.dsn, command]
    }

    async fn goose(&self, command: &str) -> Result<String> {
        let output = Command::new(&self.goose_binary_path)
            .args(self.command_args(command))
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.goose_binary_path))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("goose {} failed.\nstdout: {}\nstderr: {}", command, stdout, stderr);
        }

        // goose reports progress on stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(if stdout.is_empty() { stderr.to_string() } else { stdout })
    }
}
