//! Scratch worktree used for `git merge` based trial merges.
//!
//! The critical section is serialized by an exclusive file lock in the git
//! directory. While a scratch worktree exists, a marker file records its path
//! so that a later run can clean up after a crash. Cleanup only ever removes
//! a path this module could have created: a directory named `worktree`
//! directly inside a temp directory whose name starts with
//! [`SCRATCH_PREFIX`].

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::TempDir;

use super::cli::GitCli;
use super::hardening::harden_scratch_area;
use super::{CommitId, GitError, MergeOutcome, ObjectId};

/// Lock file serializing trial merges, relative to the git directory.
pub(crate) const LOCK_FILE: &str = "trustwalk-merge.lock";

/// Crash-recovery marker, relative to the git directory.
pub(crate) const MARKER_FILE: &str = "trustwalk-merge.marker";

/// Name prefix of scratch temp directories.
pub(crate) const SCRATCH_PREFIX: &str = "trustwalk-merge-";

const WORKTREE_DIR: &str = "worktree";

/// A detached scratch worktree checked out at the first merge parent.
///
/// Dropping the guard removes the worktree, prunes its administrative
/// entry, deletes the marker and finally releases the lock.
pub(crate) struct ScratchWorktree<'a> {
    git: &'a GitCli,
    worktree: PathBuf,
    marker: PathBuf,
    overrides: Vec<String>,
    // Field order matters: the temp dir is deleted before the lock is freed.
    _scratch: TempDir,
    _lock: File,
}

impl<'a> ScratchWorktree<'a> {
    /// Takes the merge lock, recovers from any stale scratch area and checks
    /// out `first` in a fresh detached worktree.
    pub(crate) fn acquire(git: &'a GitCli, first: &CommitId) -> Result<Self, GitError> {
        let lock_path = git.git_dir().join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| GitError::io(format!("opening {}", lock_path.display()), e))?;
        FileExt::lock_exclusive(&lock)
            .map_err(|e| GitError::io(format!("locking {}", lock_path.display()), e))?;

        let marker = git.git_dir().join(MARKER_FILE);
        recover_stale(git, &marker);

        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir()
            .map_err(|e| GitError::io("creating scratch directory", e))?;
        let overrides =
            harden_scratch_area(git.program(), git.repo_path(), scratch.path())?.config_overrides();

        let worktree = scratch.path().join(WORKTREE_DIR);
        fs::write(&marker, worktree.to_string_lossy().as_bytes())
            .map_err(|e| GitError::io(format!("writing {}", marker.display()), e))?;
        let guard = Self {
            git,
            worktree,
            marker,
            overrides,
            _scratch: scratch,
            _lock: lock,
        };

        let mut command = git.command();
        for pair in &guard.overrides {
            command.arg("-c").arg(pair);
        }
        command
            .args(["worktree", "add", "--detach", "--quiet"])
            .arg(&guard.worktree)
            .arg(first.as_str());
        git.run(&mut command, "worktree add")?;

        tracing::debug!(path = %guard.worktree.display(), %first, "scratch worktree ready");
        Ok(guard)
    }

    /// Merges `second` into the checked-out first parent.
    ///
    /// Any non-zero exit from `git merge` is reported as a conflict.
    pub(crate) fn merge(&self, second: &CommitId) -> Result<MergeOutcome, GitError> {
        let mut command = self.command();
        command
            .args(["merge", "--no-ff", "--no-edit", "--quiet"])
            .arg(second.as_str());
        let output = self.git.output(&mut command)?;
        if !output.status.success() {
            tracing::debug!(
                %second,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "trial merge did not complete"
            );
            return Ok(MergeOutcome::Conflicted);
        }

        let mut command = self.command();
        command.args(["rev-parse", "HEAD^{tree}"]);
        let tree = self.git.run(&mut command, "rev-parse")?;
        Ok(MergeOutcome::Merged {
            tree: ObjectId::parse(String::from_utf8_lossy(&tree).trim())?,
        })
    }

    fn command(&self) -> std::process::Command {
        let mut command = self.git.command_in(&self.worktree);
        for pair in &self.overrides {
            command.arg("-c").arg(pair);
        }
        command
    }
}

impl Drop for ScratchWorktree<'_> {
    fn drop(&mut self) {
        remove_worktree(self.git, &self.worktree);
        if let Err(e) = fs::remove_file(&self.marker) {
            tracing::warn!(path = %self.marker.display(), error = %e, "failed to remove merge marker");
        }
    }
}

/// Whether `path` has the exact shape of a scratch worktree path.
fn is_scratch_worktree_path(path: &Path) -> bool {
    let named_worktree = path.file_name().is_some_and(|name| name == WORKTREE_DIR);
    let in_scratch_dir = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
    path.is_absolute() && named_worktree && in_scratch_dir
}

/// Cleans up after a run that died while holding a scratch worktree.
fn recover_stale(git: &GitCli, marker: &Path) {
    let Ok(recorded) = fs::read_to_string(marker) else {
        return;
    };
    let stale = PathBuf::from(recorded.trim());
    if is_scratch_worktree_path(&stale) {
        tracing::warn!(path = %stale.display(), "removing stale scratch worktree");
        remove_worktree(git, &stale);
        if let Some(parent) = stale.parent() {
            if parent.exists() {
                if let Err(e) = fs::remove_dir_all(parent) {
                    tracing::warn!(path = %parent.display(), error = %e, "failed to remove stale scratch directory");
                }
            }
        }
    } else {
        tracing::warn!(
            path = %stale.display(),
            "merge marker names an unexpected path; leaving it untouched"
        );
    }
    if let Err(e) = fs::remove_file(marker) {
        tracing::warn!(path = %marker.display(), error = %e, "failed to remove stale merge marker");
    }
}

fn remove_worktree(git: &GitCli, path: &Path) {
    let mut remove = git.command();
    remove
        .args(["worktree", "remove", "--force", "--force"])
        .arg(path);
    if let Err(e) = git.run(&mut remove, "worktree remove") {
        tracing::debug!(path = %path.display(), error = %e, "worktree remove failed");
    }
    let mut prune = git.command();
    prune.args(["worktree", "prune"]);
    if let Err(e) = git.run(&mut prune, "worktree prune") {
        tracing::warn!(error = %e, "worktree prune failed");
    }
}
