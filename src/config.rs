use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "darc.toml";
const MAX_CONCURRENT_LIMIT: usize = 8;

/// Immutable configuration snapshot for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub archive_root: PathBuf,
    pub state_db: PathBuf,
    pub min_size_mb: u64,
    /// Only archive files last modified before this date.
    pub modified_before: Option<NaiveDate>,
    /// Native documents report size 0; include them regardless of the minimum.
    pub include_native_docs: bool,
    pub dry_run: bool,
    pub trash_after: bool,
    pub max_concurrent: usize,
    pub call_timeout_secs: u64,
    pub retry: RetryConfig,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub drive: DriveConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// OAuth bearer token obtained outside this tool.
    pub access_token: Option<String>,
    pub api_base: String,
    pub page_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            archive_root: PathBuf::from("archive"),
            state_db: PathBuf::from("darc_state.db"),
            min_size_mb: 200,
            modified_before: None,
            include_native_docs: false,
            dry_run: true,
            trash_after: true,
            max_concurrent: 3,
            call_timeout_secs: 60,
            retry: RetryConfig::default(),
            simulation: false,
            verbose: false,
            json_logs: false,
            drive: DriveConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            page_size: 100,
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then the TOML file, then `DARC_*` environment
    /// variables (`__` separates nested keys), then CLI overrides.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = match config_file {
            Some(path) => path.to_path_buf(),
            None => std::env::var_os("DARC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed("DARC_").split("__").ignore(&["config"]));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration (file: {})", file.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive_root.as_os_str().is_empty() {
            bail!("archive_root must not be empty");
        }
        if self.max_concurrent == 0 || self.max_concurrent > MAX_CONCURRENT_LIMIT {
            bail!(
                "max_concurrent must be between 1 and {} (got {})",
                MAX_CONCURRENT_LIMIT,
                self.max_concurrent
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.call_timeout_secs == 0 {
            bail!("call_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn min_size_bytes(&self) -> u64 {
        self.min_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Write the defaults as a starting config file.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        let content = toml::to_string_pretty(&AppConfig::default())
            .context("Failed to serialize default config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
