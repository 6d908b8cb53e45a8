//! File system paths for outboxctl.

use std::path::{Path, PathBuf};

/// Default directory under the user's home.
const BASE_DIR_NAME: &str = ".outbox";

/// Resolved database and configuration paths.
#[derive(Debug, Clone)]
pub struct Paths {
    database_file: PathBuf,
    config_file: PathBuf,
}

impl Paths {
    /// Use the given paths, falling back to `~/.outbox/outbox.db` and
    /// `~/.outbox/config.json`.
    pub fn resolve(database: Option<PathBuf>, config: Option<PathBuf>) -> anyhow::Result<Self> {
        let (database_file, config_file) = match (database, config) {
            (Some(database), Some(config)) => (database, config),
            (database, config) => {
                let base = default_base_dir()?;
                (
                    database.unwrap_or_else(|| base.join("outbox.db")),
                    config.unwrap_or_else(|| base.join("config.json")),
                )
            }
        };
        Ok(Self {
            database_file,
            config_file,
        })
    }

    pub fn database_file(&self) -> &Path {
        &self.database_file
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}

fn default_base_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(BASE_DIR_NAME))
}
