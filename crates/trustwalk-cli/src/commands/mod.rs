//! Command implementations and shared option handling.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Verification or configuration failure
//! - 2: Usage error (reported by clap)

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use trustwalk_core::config::{ConfigError, VerifierConfig};

pub mod tree_digest;
pub mod verify;

/// Exit codes for trustwalk commands.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// Verification or configuration failure.
    pub const FAILURE: u8 = 1;
}

/// Options shared by every command.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Repository to verify
    #[arg(short = 'C', long, default_value = ".", global = true)]
    pub repo: PathBuf,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Worker threads used to hash tree contents
    #[arg(long, value_name = "N", global = true)]
    pub digest_workers: Option<usize>,
}

impl GlobalArgs {
    /// Loads the config file (if any) and applies shared overrides.
    pub fn load_config(&self) -> Result<VerifierConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => VerifierConfig::from_file(path)?,
            None => VerifierConfig::default(),
        };
        if let Some(workers) = self.digest_workers {
            config.digest_workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Error response for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse<'a> {
    /// Error code.
    pub code: &'a str,
    /// Error message.
    pub message: String,
}

/// Output an error in the appropriate format.
pub fn output_error(json_output: bool, code: &str, message: &str) -> u8 {
    if json_output {
        let error = ErrorResponse {
            code,
            message: message.to_string(),
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&error).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        eprintln!("Error: {message}");
    }
    exit_codes::FAILURE
}
