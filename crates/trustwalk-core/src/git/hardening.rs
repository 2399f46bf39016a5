//! Git safety hardening for scratch merge worktrees.
//!
//! A worktree trial merge runs `git merge` against repository content the
//! verifier does not yet trust. This module makes sure that merge cannot
//! execute code or reuse recorded conflict resolutions.
//!
//! # Hardening Steps
//!
//! 1. **Disable hooks**: `core.hooksPath` is overridden (per invocation, via
//!    `-c`) to an empty directory created with mode 0o700 inside the scratch
//!    area. Repository-shipped hooks never run.
//! 2. **Refuse unsafe configs**: the repository-local config is scanned for
//!    `filter.*.{clean,smudge,process}`, `merge.*.driver`, `core.fsmonitor`
//!    and similar command-execution vectors. Any finding rejects the scratch
//!    area before the merge starts.
//! 3. **Pin merge behaviour**: `rerere.enabled=false` so a recorded
//!    resolution cannot turn a conflicted merge into a clean one, plus a
//!    fixed identity and `commit.gpgSign=false` so the merge commit can be
//!    created non-interactively.
//!
//! Overrides are passed on the command line only. The repository's own
//! configuration is never written.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use thiserror::Error;

/// Maximum number of unsafe config keys to report.
const MAX_UNSAFE_CONFIG_KEYS: usize = 64;

/// Maximum length of a single config key string in findings.
const MAX_CONFIG_KEY_LENGTH: usize = 512;

/// Git config keys that can execute external commands.
const UNSAFE_CONFIG_PATTERNS: &[&str] = &[
    "filter.", // filter.<driver>.clean, filter.<driver>.smudge, filter.<driver>.process
    "core.fsmonitor",
    "core.sshcommand",
    "diff.external",
    "diff.",  // diff.<driver>.command
    "merge.", // merge.<driver>.driver
];

/// Config key suffixes that are command-execution vectors under the broad
/// prefixes.
const UNSAFE_SUFFIX_PATTERNS: &[&str] = &[
    ".clean",
    ".smudge",
    ".process",
    ".command",
    ".driver",
    ".textconv",
];

/// Identity used for trial merge commits.
const MERGE_IDENTITY_NAME: &str = "trustwalk";
const MERGE_IDENTITY_EMAIL: &str = "trustwalk@localhost";

/// Errors from scratch-area hardening.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HardeningError {
    /// Failed to create the empty hooks directory.
    #[error("failed to create hooks directory at {path}: {reason}")]
    HooksDirCreationFailed {
        /// Path where the directory was to be created.
        path: String,
        /// Why creation failed.
        reason: String,
    },

    /// The repository config contains command-execution entries.
    #[error("repository config contains {count} unsafe entries: {keys:?}")]
    UnsafeConfigDetected {
        /// Number of unsafe entries found.
        count: usize,
        /// The offending config keys (bounded).
        keys: Vec<String>,
    },

    /// The config could not be listed.
    #[error("failed to scan repository config: {reason}")]
    ConfigScanFailed {
        /// Why the scan failed.
        reason: String,
    },
}

/// Result of hardening a scratch area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScratchHardening {
    /// Empty directory used as `core.hooksPath`.
    pub hooks_path: PathBuf,
}

impl ScratchHardening {
    /// `key=value` pairs to pass as `git -c` for every command in the
    /// scratch area.
    pub fn config_overrides(&self) -> Vec<String> {
        vec![
            format!("core.hooksPath={}", self.hooks_path.display()),
            "core.fsmonitor=false".to_string(),
            "rerere.enabled=false".to_string(),
            "commit.gpgSign=false".to_string(),
            "gc.auto=0".to_string(),
            format!("user.name={MERGE_IDENTITY_NAME}"),
            format!("user.email={MERGE_IDENTITY_EMAIL}"),
        ]
    }
}

/// Hardens the scratch area used for trial merges in `repo`.
///
/// `hooks_parent` must be a directory owned by this process and outside any
/// worktree; the empty hooks directory is created inside it.
///
/// # Errors
///
/// Returns [`HardeningError`] if the hooks directory cannot be created, the
/// config cannot be scanned, or unsafe config entries are present.
pub fn harden_scratch_area(
    program: &Path,
    repo: &Path,
    hooks_parent: &Path,
) -> Result<ScratchHardening, HardeningError> {
    let hooks_path = create_empty_hooks_dir(hooks_parent)?;

    let unsafe_keys = scan_unsafe_configs(program, repo)?;
    if !unsafe_keys.is_empty() {
        return Err(HardeningError::UnsafeConfigDetected {
            count: unsafe_keys.len(),
            keys: unsafe_keys,
        });
    }

    Ok(ScratchHardening { hooks_path })
}

/// Create an empty directory for hooks under `parent`.
///
/// The directory is created with mode 0o700 on Unix. An existing directory
/// is reused as-is.
fn create_empty_hooks_dir(parent: &Path) -> Result<PathBuf, HardeningError> {
    let hooks_dir = parent.join("empty_hooks");

    if hooks_dir.exists() {
        if !hooks_dir.is_dir() {
            return Err(HardeningError::HooksDirCreationFailed {
                path: hooks_dir.display().to_string(),
                reason: "path exists but is not a directory".to_string(),
            });
        }
        return Ok(hooks_dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&hooks_dir)
            .map_err(|e| HardeningError::HooksDirCreationFailed {
                path: hooks_dir.display().to_string(),
                reason: e.to_string(),
            })?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(&hooks_dir).map_err(|e| {
            HardeningError::HooksDirCreationFailed {
                path: hooks_dir.display().to_string(),
                reason: e.to_string(),
            }
        })?;
    }

    Ok(hooks_dir)
}

/// Scan the repository-local config for unsafe entries.
fn scan_unsafe_configs(program: &Path, repo: &Path) -> Result<Vec<String>, HardeningError> {
    let output = Command::new(program)
        .arg("-C")
        .arg(repo)
        .args(["config", "--local", "--list"])
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .map_err(|e| HardeningError::ConfigScanFailed {
            reason: format!("failed to spawn git: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(HardeningError::ConfigScanFailed {
            reason: if stderr.is_empty() {
                "git config --list failed with no output".to_string()
            } else {
                stderr
            },
        });
    }

    let config_text = String::from_utf8_lossy(&output.stdout);
    Ok(collect_unsafe_keys(&config_text))
}

/// Extracts unsafe keys from `git config --list` output, bounded.
fn collect_unsafe_keys(config_text: &str) -> Vec<String> {
    let mut unsafe_keys = Vec::new();
    for line in config_text.lines() {
        let key = line.split_once('=').map_or(line, |(k, _)| k);
        if !is_unsafe_config_key(&key.to_ascii_lowercase()) {
            continue;
        }
        let truncated = if key.len() > MAX_CONFIG_KEY_LENGTH {
            let mut end = MAX_CONFIG_KEY_LENGTH;
            while !key.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &key[..end])
        } else {
            key.to_string()
        };
        unsafe_keys.push(truncated);
        if unsafe_keys.len() >= MAX_UNSAFE_CONFIG_KEYS {
            break;
        }
    }
    unsafe_keys
}

/// Check if a config key (lowercase) matches any unsafe pattern.
fn is_unsafe_config_key(key: &str) -> bool {
    for pattern in UNSAFE_CONFIG_PATTERNS {
        if !key.starts_with(pattern) {
            continue;
        }
        // Broad prefixes are only unsafe with a command-valued suffix.
        if matches!(*pattern, "filter." | "diff." | "merge.") {
            if UNSAFE_SUFFIX_PATTERNS.iter().any(|suffix| key.ends_with(suffix)) {
                return true;
            }
        } else {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::process::Command;

    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn init_repo(path: &Path) {
        fs::create_dir_all(path).expect("create repo dir");
        let init = Command::new("git")
            .arg("init")
            .arg("--quiet")
            .arg(path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .output()
            .expect("git init");
        assert!(init.status.success(), "git init failed");
    }

    fn set_local_config(path: &Path, key: &str, value: &str) {
        let cfg = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["config", "--local", key, value])
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .output()
            .expect("git config");
        assert!(cfg.status.success());
    }

    #[test]
    fn clean_repo_is_hardened() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        init_repo(&repo);

        let hardening =
            harden_scratch_area(Path::new("git"), &repo, temp.path()).expect("hardening");
        assert!(hardening.hooks_path.is_dir());
        assert!(hardening.hooks_path.ends_with("empty_hooks"));
        let overrides = hardening.config_overrides();
        assert!(overrides.iter().any(|o| o.starts_with("core.hooksPath=")));
        assert!(overrides.contains(&"rerere.enabled=false".to_string()));
    }

    #[test]
    fn custom_merge_driver_is_rejected() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        init_repo(&repo);
        set_local_config(&repo, "merge.ours.driver", "true");

        match harden_scratch_area(Path::new("git"), &repo, temp.path()) {
            Err(HardeningError::UnsafeConfigDetected { count, keys }) => {
                assert_eq!(count, 1);
                assert_eq!(keys, vec!["merge.ours.driver".to_string()]);
            },
            other => panic!("expected UnsafeConfigDetected, got: {other:?}"),
        }
    }

    #[test]
    fn smudge_filter_and_fsmonitor_are_all_reported() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        init_repo(&repo);
        for (key, val) in [
            ("filter.lfs.smudge", "git-lfs smudge -- %f"),
            ("filter.lfs.clean", "git-lfs clean -- %f"),
            ("core.fsmonitor", "/usr/bin/watchman"),
        ] {
            set_local_config(&repo, key, val);
        }

        match harden_scratch_area(Path::new("git"), &repo, temp.path()) {
            Err(HardeningError::UnsafeConfigDetected { count, .. }) => assert_eq!(count, 3),
            other => panic!("expected UnsafeConfigDetected, got: {other:?}"),
        }
    }

    #[test]
    fn empty_hooks_dir_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir1 = create_empty_hooks_dir(temp.path()).expect("first create");
        let dir2 = create_empty_hooks_dir(temp.path()).expect("second create");
        assert_eq!(dir1, dir2);
        assert!(dir1.is_dir());
    }

    #[test]
    fn hooks_path_that_is_a_file_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("empty_hooks"), b"not a dir").expect("write");
        assert!(matches!(
            create_empty_hooks_dir(temp.path()),
            Err(HardeningError::HooksDirCreationFailed { .. })
        ));
    }

    #[test]
    #[cfg(unix)]
    fn hooks_dir_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let hooks_dir = create_empty_hooks_dir(temp.path()).expect("create hooks dir");
        let perms = fs::metadata(&hooks_dir).expect("metadata").permissions();
        assert_eq!(perms.mode() & 0o777, 0o700);
    }

    #[test]
    fn is_unsafe_config_key_detects_known_patterns() {
        assert!(is_unsafe_config_key("filter.lfs.smudge"));
        assert!(is_unsafe_config_key("filter.evil.clean"));
        assert!(is_unsafe_config_key("filter.foo.process"));
        assert!(is_unsafe_config_key("core.fsmonitor"));
        assert!(is_unsafe_config_key("core.sshcommand"));
        assert!(is_unsafe_config_key("diff.external"));
        assert!(is_unsafe_config_key("diff.foo.textconv"));
        assert!(is_unsafe_config_key("merge.foo.driver"));

        assert!(!is_unsafe_config_key("merge.conflictstyle"));
        assert!(!is_unsafe_config_key("diff.renames"));
        assert!(!is_unsafe_config_key("user.name"));
        assert!(!is_unsafe_config_key("core.autocrlf"));
        assert!(!is_unsafe_config_key("remote.origin.url"));
    }

    #[test]
    fn collected_keys_are_bounded() {
        let listing: String = (0..200)
            .map(|i| format!("filter.f{i}.smudge=cat\n"))
            .collect();
        assert_eq!(collect_unsafe_keys(&listing).len(), MAX_UNSAFE_CONFIG_KEYS);

        let long_key = format!("filter.{}.clean=cat", "x".repeat(1000));
        let keys = collect_unsafe_keys(&long_key);
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("..."));
    }
}
