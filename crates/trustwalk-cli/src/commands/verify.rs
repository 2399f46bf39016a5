//! Default command: verify the path from a commit to the signed root.
//!
//! Text mode prints progress on stdout and diagnostics on stderr. With
//! `--json` the walk outcome is printed as a single JSON document (success
//! on stdout, failure on stderr).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use trustwalk_core::VerifierConfig;
use trustwalk_core::git::{CommitId, GitCli, MergeStrategy};
use trustwalk_core::trust::TrustStore;
use trustwalk_core::walker::{
    CommitGraphWalker, VerifyError, WalkFailure, WalkOptions, WalkProgress, WalkReport, WalkState,
};

use super::{GlobalArgs, exit_codes, output_error};

/// Trust directory used when neither flag nor config names one, relative to
/// the repository.
const DEFAULT_TRUST_DIR: &str = "contrib/verify-commits";

/// Trial merge strategy.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MergeStrategyArg {
    /// `merge-tree` when git supports it, otherwise `worktree`.
    Auto,
    /// `git merge-tree --write-tree` (no checkout).
    MergeTree,
    /// `git merge` in a scratch worktree.
    Worktree,
}

impl From<MergeStrategyArg> for MergeStrategy {
    fn from(arg: MergeStrategyArg) -> Self {
        match arg {
            MergeStrategyArg::Auto => Self::Auto,
            MergeStrategyArg::MergeTree => Self::MergeTree,
            MergeStrategyArg::Worktree => Self::Worktree,
        }
    }
}

/// Arguments for verification.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Commit to start from (default: HEAD)
    #[arg(value_name = "COMMIT")]
    pub commit: Option<String>,

    /// Disable the SHA-512 tree check (weakens trust)
    #[arg(long)]
    pub disable_tree_check: bool,

    /// Only check merge cleanliness for merges newer than DAYS days
    #[arg(long, value_name = "DAYS")]
    pub clean_merge: Option<f64>,

    /// Directory holding trust roots, allow-lists and trusted keys
    #[arg(long, value_name = "DIR")]
    pub trust_dir: Option<PathBuf>,

    /// How trial merges are performed
    #[arg(long, value_enum)]
    pub merge_strategy: Option<MergeStrategyArg>,

    /// Maximum number of commits to visit
    #[arg(long, value_name = "N")]
    pub max_steps: Option<u64>,
}

// ============================================================================
// Response Types for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
struct SuccessResponse<'a> {
    status: &'static str,
    reference: &'a str,
    trust_dir: &'a Path,
    #[serde(flatten)]
    report: &'a WalkReport,
}

#[derive(Debug, Serialize)]
struct FailureResponse<'a> {
    status: &'static str,
    code: &'static str,
    message: String,
    commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    child: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff_stat: Option<&'a str>,
    progress: &'a WalkProgress,
}

// ============================================================================
// Command execution
// ============================================================================

/// Applies command-line overrides on top of the loaded configuration.
fn apply_overrides(mut config: VerifierConfig, args: &VerifyArgs) -> Result<VerifierConfig> {
    if let Some(dir) = &args.trust_dir {
        config.trust_dir = Some(dir.clone());
    }
    if let Some(days) = args.clean_merge {
        config.clean_merge_days = Some(days);
    }
    if let Some(strategy) = args.merge_strategy {
        config.merge_strategy = strategy.into();
    }
    if let Some(steps) = args.max_steps {
        config.max_steps = steps;
    }
    config.validate().context("invalid command-line options")?;
    Ok(config)
}

fn trust_dir(config: &VerifierConfig, repo: &Path) -> PathBuf {
    config
        .trust_dir
        .clone()
        .unwrap_or_else(|| repo.join(DEFAULT_TRUST_DIR))
}

/// Runs verification, returning an exit code.
pub fn run_verify(global: &GlobalArgs, args: &VerifyArgs) -> u8 {
    let json_output = global.json;
    let reference = args.commit.as_deref().unwrap_or("HEAD");

    let config = match global
        .load_config()
        .context("failed to load configuration")
        .and_then(|config| apply_overrides(config, args))
    {
        Ok(config) => config,
        Err(e) => return output_error(json_output, "config", &format!("{e:#}")),
    };
    let walk_options = match config.walk_options(chrono::Utc::now(), !args.disable_tree_check) {
        Ok(options) => options,
        Err(e) => return output_error(json_output, "config", &e.to_string()),
    };

    tracing::debug!(?config, "effective configuration");

    let trust_dir = trust_dir(&config, &global.repo);
    if !json_output {
        println!("Using verify-commits data from {}", trust_dir.display());
    }
    let trust = match TrustStore::load(&trust_dir) {
        Ok(trust) => trust,
        Err(e) => {
            let failure = WalkFailure {
                error: VerifyError::from(e),
                progress: WalkProgress {
                    state: WalkState::Failed,
                    ..WalkProgress::default()
                },
            };
            return report_failure(json_output, &failure);
        },
    };

    let repo = match GitCli::open(&global.repo, config.git_options())
        .with_context(|| format!("failed to open repository at {}", global.repo.display()))
    {
        Ok(repo) => repo,
        Err(e) => return output_error(json_output, "repository", &format!("{e:#}")),
    };

    verify_with(&repo, &trust, walk_options, reference, json_output)
}

fn verify_with(
    repo: &GitCli,
    trust: &TrustStore,
    options: WalkOptions,
    reference: &str,
    json_output: bool,
) -> u8 {
    let walker = CommitGraphWalker::new(repo, trust, options);
    match walker.walk_from_reference(reference) {
        Ok(report) => {
            if json_output {
                let response = SuccessResponse {
                    status: "ok",
                    reference,
                    trust_dir: &trust.source_dir,
                    report: &report,
                };
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
                );
            } else {
                print_digest_notice(report.digests_matched_up_to.as_ref());
                println!(
                    "There is a valid path from \"{reference}\" to {} where all commits are signed!",
                    report.signed_root
                );
            }
            exit_codes::SUCCESS
        },
        Err(failure) => report_failure(json_output, &failure),
    }
}

fn print_digest_notice(digest_root: Option<&CommitId>) {
    if let Some(root) = digest_root {
        eprintln!("All Tree-SHA512s matched up to {root}");
    }
}

fn report_failure(json_output: bool, failure: &WalkFailure) -> u8 {
    let error = &failure.error;
    if json_output {
        let (child, parents, diff_stat) = match error {
            VerifyError::UnsignedCommit { child, parents, .. } => {
                (Some(child.to_string()), parents.clone(), None)
            },
            VerifyError::DirtyMerge { diff_stat, .. } => (None, Vec::new(), Some(diff_stat.as_str())),
            _ => (None, Vec::new(), None),
        };
        let response = FailureResponse {
            status: "failed",
            code: error.kind(),
            message: error.to_string(),
            commit: error.commit().map(ToString::to_string),
            child,
            parents,
            diff_stat,
            progress: &failure.progress,
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
        );
        return exit_codes::FAILURE;
    }

    print_digest_notice(failure.progress.digests_matched_up_to.as_ref());
    eprintln!("{error}");
    match error {
        VerifyError::UnsignedCommit { parents, .. } => {
            eprintln!("Parents are:");
            for parent in parents {
                eprintln!("  {parent}");
            }
        },
        VerifyError::DirtyMerge {
            recreated_tree,
            diff_stat,
            ..
        } => match recreated_tree {
            Some(tree) => {
                eprintln!("Recreated merge tree {tree} differs from the recorded tree:");
                eprint!("{diff_stat}");
            },
            None => eprintln!("The parents do not merge without conflicts."),
        },
        _ => {},
    }
    let progress = &failure.progress;
    match &progress.last_trusted {
        Some(last) => eprintln!(
            "Verified {} commit(s); last trusted commit: {last}",
            progress.verified
        ),
        None => eprintln!("No commits were verified."),
    }
    exit_codes::FAILURE
}
