// Configuration merging with priority

use super::BatchConfig;
use crate::parallel::CredentialPolicy;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Partial configuration for merging
/// Uses Option<T> for all fields to support partial overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PartialBatchConfig {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub backoff_window_secs: Option<u64>,
    #[serde(default)]
    pub reservation_attempts: Option<u32>,
    #[serde(default)]
    pub reservation_delay_ms: Option<u64>,
    #[serde(default)]
    pub credential_policy: Option<CredentialPolicy>,
    #[serde(default)]
    pub credentials_env: Option<String>,
}

impl PartialBatchConfig {
    /// Overrides from `RALPH_BATCH_MAX_WORKERS` and `RALPH_BATCH_BACKOFF_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
                None => Ok(None),
            }
        };

        Ok(Self {
            max_workers: parse("RALPH_BATCH_MAX_WORKERS")?.map(|v| v as usize),
            backoff_window_secs: parse("RALPH_BATCH_BACKOFF_SECS")?,
            ..Default::default()
        })
    }
}

/// Configuration merger
/// Priority order: overrides -> environment -> project -> global -> defaults
pub struct ConfigMerger {
    defaults: BatchConfig,
    global: Option<PartialBatchConfig>,
    project: Option<PartialBatchConfig>,
    env: Option<PartialBatchConfig>,
    overrides: Option<PartialBatchConfig>,
}

impl ConfigMerger {
    pub fn new() -> Self {
        Self {
            defaults: BatchConfig::default(),
            global: None,
            project: None,
            env: None,
            overrides: None,
        }
    }

    pub fn with_global(mut self, config: Option<PartialBatchConfig>) -> Self {
        self.global = config;
        self
    }

    pub fn with_project(mut self, config: Option<PartialBatchConfig>) -> Self {
        self.project = config;
        self
    }

    pub fn with_env(mut self, config: Option<PartialBatchConfig>) -> Self {
        self.env = config;
        self
    }

    /// Explicit overrides (e.g. command-line flags), highest priority
    pub fn with_overrides(mut self, config: Option<PartialBatchConfig>) -> Self {
        self.overrides = config;
        self
    }

    pub fn merge(&self) -> BatchConfig {
        [&self.global, &self.project, &self.env, &self.overrides]
            .into_iter()
            .flatten()
            .fold(self.defaults.clone(), |base, partial| {
                Self::merge_partial(&base, partial)
            })
    }

    fn merge_partial(base: &BatchConfig, partial: &PartialBatchConfig) -> BatchConfig {
        BatchConfig {
            max_workers: partial.max_workers.unwrap_or(base.max_workers),
            backoff_window_secs: partial
                .backoff_window_secs
                .unwrap_or(base.backoff_window_secs),
            reservation_attempts: partial
                .reservation_attempts
                .unwrap_or(base.reservation_attempts),
            reservation_delay_ms: partial
                .reservation_delay_ms
                .unwrap_or(base.reservation_delay_ms),
            credential_policy: partial.credential_policy.unwrap_or(base.credential_policy),
            credentials_env: partial
                .credentials_env
                .clone()
                .unwrap_or_else(|| base.credentials_env.clone()),
        }
    }
}

impl Default for ConfigMerger {
    fn default() -> Self {
        Self::new()
    }
}
