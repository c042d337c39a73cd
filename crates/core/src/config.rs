use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "mediasort.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root under which confirmed categories become directories.
    pub root: String,
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub copy_then_delete: bool,
    /// rename|skip|overwrite
    #[serde(default = "default_conflict")]
    pub conflict: String,
}

fn default_conflict() -> String {
    "rename".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: "/library".to_string(),
            watch: Vec::new(),
            exclude: Vec::new(),
            copy_then_delete: false,
            conflict: default_conflict(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_step_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Linear backoff: `attempt × step`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms * attempt as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub retention_days: i64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("MEDIASORT")
            .separator("__")
            .try_parsing(true),
    );
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}
