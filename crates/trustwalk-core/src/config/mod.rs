//! Configuration parsing and management.
//!
//! An optional TOML file supplies defaults for a verification run; command
//! line flags override individual fields afterwards. Unknown keys are
//! rejected so that a misspelled option never silently falls back to a
//! default.

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::{GitCliOptions, MergeStrategy};
use crate::walker::{DEFAULT_MAX_STEPS, WalkOptions};

/// Environment variable naming the git executable.
pub const GIT_ENV: &str = "GIT";

/// Settings for one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifierConfig {
    /// Directory holding the trust roots, allow-lists and trusted keys.
    #[serde(default)]
    pub trust_dir: Option<PathBuf>,

    /// git executable. Falls back to `$GIT`, then `git`.
    #[serde(default)]
    pub git_binary: Option<PathBuf>,

    /// `gpg.program` override for signature checks.
    #[serde(default)]
    pub gpg_program: Option<PathBuf>,

    /// Only re-derive merges newer than this many days. Unset checks all.
    #[serde(default)]
    pub clean_merge_days: Option<f64>,

    /// Upper bound on commits visited.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Hashing worker threads per tree digest.
    #[serde(default = "default_digest_workers")]
    pub digest_workers: usize,

    /// How trial merges are performed.
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

const fn default_max_steps() -> u64 {
    DEFAULT_MAX_STEPS
}

const fn default_digest_workers() -> usize {
    1
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            trust_dir: None,
            git_binary: None,
            gpg_program: None,
            clean_merge_days: None,
            max_steps: default_max_steps(),
            digest_workers: default_digest_workers(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

impl VerifierConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, contains unknown keys, or
    /// fails [`VerifierConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for zero workers, a zero step
    /// bound, or a negative or NaN lookback.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.digest_workers == 0 {
            return Err(ConfigError::Validation(
                "digest_workers must be at least 1".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Validation(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if let Some(days) = self.clean_merge_days {
            if days.is_nan() || days < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "clean_merge_days must be a non-negative number, got {days}"
                )));
            }
        }
        Ok(())
    }

    /// git executable: the configured one, else `git_env`, else `git`.
    pub fn git_program(&self, git_env: Option<OsString>) -> PathBuf {
        self.git_binary
            .clone()
            .or_else(|| git_env.filter(|value| !value.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("git"))
    }

    /// Options for opening the repository, resolving the git executable from
    /// the process environment.
    pub fn git_options(&self) -> GitCliOptions {
        GitCliOptions {
            program: self.git_program(std::env::var_os(GIT_ENV)),
            gpg_program: self.gpg_program.clone(),
            merge_strategy: self.merge_strategy,
        }
    }

    /// Walk options with the lookback window anchored at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when the config is out of range.
    pub fn walk_options(
        &self,
        now: DateTime<Utc>,
        check_digest: bool,
    ) -> Result<WalkOptions, ConfigError> {
        self.validate()?;
        let digest_workers = NonZeroUsize::new(self.digest_workers).ok_or_else(|| {
            ConfigError::Validation("digest_workers must be at least 1".to_string())
        })?;
        Ok(WalkOptions {
            lookback_days: self.clean_merge_days,
            check_digest,
            max_steps: self.max_steps,
            digest_workers,
            now,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
