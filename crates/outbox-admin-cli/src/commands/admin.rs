//! Schema and configuration commands.

use anyhow::Result;
use outbox_engine::OutboxConfig;
use outbox_sqlite_persist::CURRENT_VERSION;

use super::open_database;
use crate::output::{self, OutputFormat};
use crate::paths::Paths;

/// Create the database if needed and bring its schema up to date.
pub async fn migrate(paths: &Paths, format: &OutputFormat) -> Result<()> {
    open_database(paths).await?;
    output::print_success(
        &format!(
            "{} is at schema version {}",
            paths.database_file().display(),
            CURRENT_VERSION
        ),
        format,
    );
    Ok(())
}

/// Print the configuration the engine would run with: file, then
/// environment overrides, then validation.
pub fn show_config(paths: &Paths, format: &OutputFormat) -> Result<()> {
    let config = OutboxConfig::load(paths.config_file())?;
    match format {
        OutputFormat::Json => output::print_json(&config)?,
        OutputFormat::Text => {
            output::print_row("Config file", &paths.config_file().display().to_string());
            output::print_row("Attempt frequency", &format!("{} ms", config.attempt_frequency_ms));
            output::print_row("Flush batch size", &config.flush_batch_size.to_string());
            output::print_row(
                "Blacklist after",
                &format!("{} attempts", config.blacklist_after_attempts),
            );
            output::print_row("Retention", &format!("{} ms", config.retention_threshold_ms));
            output::print_row("Flush interval", &format!("{} ms", config.flush_interval_ms));
            output::print_row("Serialize MDC", &config.serialize_mdc.to_string());
            output::print_row("Backoff", &serde_json::to_string(&config.backoff)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn migrate_creates_database() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("nested").join("outbox.db");
        let paths = Paths::resolve(Some(db.clone()), Some(dir.path().join("config.json"))).unwrap();

        migrate(&paths, &OutputFormat::Json).await.unwrap();
        assert!(db.exists());
    }

    #[test]
    fn show_config_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, r#"{"flush_batch_size": 0}"#).unwrap();
        let paths = Paths::resolve(Some(PathBuf::from("unused.db")), Some(config)).unwrap();

        assert!(show_config(&paths, &OutputFormat::Text).is_err());
    }
}
