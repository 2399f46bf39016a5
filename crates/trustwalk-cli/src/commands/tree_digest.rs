//! `trustwalk tree-digest`: print the `Tree-SHA512:` line for a commit.

use std::num::NonZeroUsize;

use clap::Args;
use serde::Serialize;
use trustwalk_core::TreeDigestComputer;
use trustwalk_core::git::{GitCli, Repository};

use super::{GlobalArgs, exit_codes, output_error};

/// Arguments for `trustwalk tree-digest`.
#[derive(Debug, Args)]
pub struct TreeDigestArgs {
    /// Commit to hash (default: HEAD)
    #[arg(value_name = "COMMIT", default_value = "HEAD")]
    pub commit: String,
}

#[derive(Debug, Serialize)]
struct TreeDigestResponse {
    commit: String,
    tree_sha512: String,
}

/// Runs the tree-digest command, returning an exit code.
pub fn run_tree_digest(global: &GlobalArgs, args: &TreeDigestArgs) -> u8 {
    let json_output = global.json;

    let config = match global.load_config() {
        Ok(config) => config,
        Err(e) => return output_error(json_output, "config", &e.to_string()),
    };
    let workers = NonZeroUsize::new(config.digest_workers).unwrap_or(NonZeroUsize::MIN);

    let repo = match GitCli::open(&global.repo, config.git_options()) {
        Ok(repo) => repo,
        Err(e) => return output_error(json_output, "repository", &e.to_string()),
    };
    let commit = match repo.resolve_commit(&args.commit) {
        Ok(commit) => commit,
        Err(e) => return output_error(json_output, "malformed_input", &e.to_string()),
    };
    let digest = match TreeDigestComputer::new(&repo).with_workers(workers).compute(&commit) {
        Ok(digest) => digest,
        Err(e) => return output_error(json_output, "integrity", &e.to_string()),
    };

    if json_output {
        let response = TreeDigestResponse {
            commit: commit.to_string(),
            tree_sha512: digest.to_hex(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        println!("{}", digest.message_line());
    }
    exit_codes::SUCCESS
}
