// Batch execution configuration
//
// Layered the same way as the rest of Ralph's config:
// overrides -> environment -> project file -> global file -> defaults

pub mod merger;
pub mod secrets;

pub use merger::{ConfigMerger, PartialBatchConfig};
pub use secrets::{credentials_from_env, parse_credential_list};

use crate::credentials::MAX_BACKOFF_WINDOW;
use crate::parallel::{CredentialPolicy, ReservationPolicy, DEFAULT_MAX_WORKERS};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default environment variable holding the credential list
pub const DEFAULT_CREDENTIALS_ENV: &str = "RALPH_BATCH_CREDENTIALS";

/// File name used for both the global and the project-level config
pub const CONFIG_FILE_NAME: &str = "batch.toml";

/// Fully resolved batch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrent workers (clamped to 10 by the coordinator)
    pub max_workers: usize,
    /// How long a rate-limited credential stays out of rotation
    pub backoff_window_secs: u64,
    /// Reservation attempts per item before giving up
    pub reservation_attempts: u32,
    /// Delay between reservation attempts
    pub reservation_delay_ms: u64,
    /// What to do when no credential could be reserved
    pub credential_policy: CredentialPolicy,
    /// Environment variable holding the credential list
    pub credentials_env: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let reservation = ReservationPolicy::default();
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            backoff_window_secs: 60,
            reservation_attempts: reservation.max_attempts,
            reservation_delay_ms: reservation.retry_delay.as_millis() as u64,
            credential_policy: reservation.on_exhausted,
            credentials_env: DEFAULT_CREDENTIALS_ENV.to_string(),
        }
    }
}

impl BatchConfig {
    /// Load the merged configuration.
    ///
    /// `project_dir` is searched for `.ralph-ui/batch.toml`; missing files are
    /// skipped, unparseable ones are an error.
    pub fn load(project_dir: Option<&Path>, overrides: PartialBatchConfig) -> Result<Self> {
        let global = match global_config_path() {
            Some(path) => load_partial(&path)?,
            None => None,
        };
        let project = match project_dir {
            Some(dir) => load_partial(&project_config_path(dir))?,
            None => None,
        };
        let env = PartialBatchConfig::from_env()?;

        let config = ConfigMerger::new()
            .with_global(global)
            .with_project(project)
            .with_env(Some(env))
            .with_overrides(Some(overrides))
            .merge();

        config.validate()?;
        Ok(config)
    }

    /// Reject values no run could make progress with
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be at least 1"));
        }
        if self.backoff_window_secs > MAX_BACKOFF_WINDOW.as_secs() {
            return Err(anyhow!(
                "backoff_window_secs must be at most {} (got {})",
                MAX_BACKOFF_WINDOW.as_secs(),
                self.backoff_window_secs
            ));
        }
        if self.reservation_attempts == 0 {
            return Err(anyhow!("reservation_attempts must be at least 1"));
        }
        if self.credentials_env.trim().is_empty() {
            return Err(anyhow!("credentials_env must not be empty"));
        }
        Ok(())
    }

    pub fn backoff_window(&self) -> Duration {
        Duration::from_secs(self.backoff_window_secs)
    }

    pub fn reservation_policy(&self) -> ReservationPolicy {
        ReservationPolicy {
            max_attempts: self.reservation_attempts,
            retry_delay: Duration::from_millis(self.reservation_delay_ms),
            on_exhausted: self.credential_policy,
        }
    }
}

/// Global config path (~/.ralph-ui/batch.toml)
pub fn global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".ralph-ui").join(CONFIG_FILE_NAME))
}

/// Project config path ({project}/.ralph-ui/batch.toml)
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".ralph-ui").join(CONFIG_FILE_NAME)
}

/// Read a partial config file; `Ok(None)` if it does not exist
pub fn load_partial(path: &Path) -> Result<Option<PartialBatchConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

    let partial: PartialBatchConfig = toml::from_str(&contents)
        .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

    log::debug!("Loaded batch config from: {}", path.display());
    Ok(Some(partial))
}
