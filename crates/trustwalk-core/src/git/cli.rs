//! [`Repository`] implementation driving the `git` executable.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::cat_file::CatFileBatch;
use super::staging::ScratchWorktree;
use super::{
    BlobReader, Commit, CommitId, GitError, MergeOutcome, ObjectId, Repository, SignatureContext,
    TreeEntry, validate_reference,
};
use crate::gpg_status;
use crate::signature::SignatureVerdict;

/// First git release with `merge-tree --write-tree`.
const MERGE_TREE_MIN_VERSION: (u32, u32) = (2, 38);

/// `--format` used to read commit metadata; fields are NUL separated.
const COMMIT_FORMAT: &str = "format:%H%x00%T%x00%P%x00%ct%x00%an <%ae>%x00%B";

/// How trial merges are performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// `merge-tree` when git supports it, otherwise `worktree`.
    #[default]
    Auto,
    /// In-object-store merge via `git merge-tree --write-tree`.
    MergeTree,
    /// `git merge` inside a hardened, detached scratch worktree.
    Worktree,
}

/// Options for [`GitCli::open`].
#[derive(Debug, Clone)]
pub struct GitCliOptions {
    /// git executable.
    pub program: PathBuf,
    /// Optional `gpg.program` override for signature checks.
    pub gpg_program: Option<PathBuf>,
    /// Trial merge strategy.
    pub merge_strategy: MergeStrategy,
}

impl Default for GitCliOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
            gpg_program: None,
            merge_strategy: MergeStrategy::Auto,
        }
    }
}

/// A repository accessed through the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    repo: PathBuf,
    git_dir: PathBuf,
    gpg_program: Option<PathBuf>,
    merge_strategy: MergeStrategy,
}

impl GitCli {
    /// Opens the repository containing `repo`.
    ///
    /// Resolves the common git directory (used for the merge lock) and picks
    /// a concrete merge strategy when `Auto` is requested.
    pub fn open(repo: &Path, options: GitCliOptions) -> Result<Self, GitError> {
        let mut cli = Self {
            program: options.program,
            repo: repo.to_path_buf(),
            git_dir: PathBuf::new(),
            gpg_program: options.gpg_program,
            merge_strategy: options.merge_strategy,
        };

        let out = cli.run(cli.command().args(["rev-parse", "--git-common-dir"]), "rev-parse")?;
        let git_dir = PathBuf::from(String::from_utf8_lossy(&out).trim());
        cli.git_dir = if git_dir.is_absolute() {
            git_dir
        } else {
            repo.join(git_dir)
        };

        if cli.merge_strategy == MergeStrategy::Auto {
            let version = cli.version()?;
            cli.merge_strategy = if version >= MERGE_TREE_MIN_VERSION {
                MergeStrategy::MergeTree
            } else {
                MergeStrategy::Worktree
            };
            tracing::debug!(
                ?version,
                strategy = ?cli.merge_strategy,
                "selected trial merge strategy"
            );
        }
        Ok(cli)
    }

    /// The concrete trial merge strategy in use (never `Auto`).
    pub const fn merge_strategy(&self) -> MergeStrategy {
        self.merge_strategy
    }

    /// Path the repository was opened at.
    pub fn repo_path(&self) -> &Path {
        &self.repo
    }

    pub(crate) fn program(&self) -> &Path {
        &self.program
    }

    pub(crate) fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// `(major, minor)` of the git executable.
    pub fn version(&self) -> Result<(u32, u32), GitError> {
        let out = self.run(self.command().arg("--version"), "--version")?;
        let text = String::from_utf8_lossy(&out);
        parse_version(&text).ok_or_else(|| GitError::MalformedOutput {
            command: "--version".to_string(),
            detail: text.trim().to_string(),
        })
    }

    /// A git command rooted at the repository.
    pub(crate) fn command(&self) -> Command {
        self.command_in(&self.repo)
    }

    /// A git command rooted at `dir` (e.g. a scratch worktree).
    pub(crate) fn command_in(&self, dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-C")
            .arg(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C");
        command
    }

    /// Runs `command`, returning stdout on success.
    pub(crate) fn run(&self, command: &mut Command, name: &str) -> Result<Vec<u8>, GitError> {
        let output = self.output(command)?;
        if !output.status.success() {
            return Err(command_failed(name, &output));
        }
        Ok(output.stdout)
    }

    /// Runs `command` and returns its raw output regardless of status.
    pub(crate) fn output(&self, command: &mut Command) -> Result<Output, GitError> {
        command.output().map_err(|source| GitError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }

    fn merge_tree(&self, first: &CommitId, second: &CommitId) -> Result<MergeOutcome, GitError> {
        let output = self.output(self.command().args([
            "merge-tree",
            "--write-tree",
            "--no-messages",
            first.as_str(),
            second.as_str(),
        ]))?;
        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let tree = stdout.lines().next().unwrap_or_default();
                Ok(MergeOutcome::Merged {
                    tree: ObjectId::parse(tree.trim())?,
                })
            },
            Some(1) => Ok(MergeOutcome::Conflicted),
            // `git merge` refuses the same parents, so the worktree strategy
            // reports them as conflicted too.
            _ if refuses_unrelated_histories(&output.stderr) => Ok(MergeOutcome::Conflicted),
            _ => Err(command_failed("merge-tree", &output)),
        }
    }
}

pub(crate) fn command_failed(name: &str, output: &Output) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    GitError::CommandFailed {
        command: name.to_string(),
        stderr: if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        },
    }
}

/// Whether git declined a merge because the parents share no history.
fn refuses_unrelated_histories(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("refusing to merge unrelated histories")
}

/// Parses `git version 2.39.2 (Apple Git-143)` into `(2, 39)`.
fn parse_version(text: &str) -> Option<(u32, u32)> {
    let version = text.trim().strip_prefix("git version ")?;
    let mut parts = version.split(|c: char| c == '.' || c.is_whitespace());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Parses one NUL-separated commit record produced with [`COMMIT_FORMAT`].
fn parse_commit_record(raw: &str) -> Result<Commit, GitError> {
    let malformed = |detail: &str| GitError::MalformedOutput {
        command: "show".to_string(),
        detail: detail.to_string(),
    };
    let mut fields = raw.splitn(6, '\0');
    let mut next = |name: &str| {
        fields
            .next()
            .ok_or_else(|| malformed(&format!("missing {name} field")))
    };
    let id = ObjectId::parse(next("id")?)?;
    let tree = ObjectId::parse(next("tree")?)?;
    let parents = next("parents")?
        .split_whitespace()
        .map(ObjectId::parse)
        .collect::<Result<Vec<_>, _>>()?;
    let seconds: i64 = next("timestamp")?
        .trim()
        .parse()
        .map_err(|_| malformed("invalid commit timestamp"))?;
    let timestamp =
        DateTime::from_timestamp(seconds, 0).ok_or_else(|| malformed("timestamp out of range"))?;
    let author = next("author")?.to_string();
    let message = next("message")?.to_string();
    Ok(Commit {
        id,
        tree,
        parents,
        timestamp,
        author,
        message,
    })
}

/// Parses `ls-tree -r -z` output into blob entries.
fn parse_ls_tree(raw: &[u8]) -> Result<Vec<TreeEntry>, GitError> {
    let malformed = |detail: String| GitError::MalformedOutput {
        command: "ls-tree".to_string(),
        detail,
    };
    raw.split(|b| *b == 0)
        .filter(|record| !record.is_empty())
        .map(|record| {
            let tab = record
                .iter()
                .position(|b| *b == b'\t')
                .ok_or_else(|| malformed("record without path separator".to_string()))?;
            let (meta, path) = (&record[..tab], &record[tab + 1..]);
            let meta = std::str::from_utf8(meta)
                .map_err(|_| malformed("non-UTF-8 entry metadata".to_string()))?;
            let [_mode, kind, object] = meta.split(' ').collect::<Vec<_>>()[..] else {
                return Err(malformed(format!("unexpected entry metadata `{meta}`")));
            };
            if kind != "blob" {
                return Err(GitError::UnsupportedTreeEntry {
                    path: String::from_utf8_lossy(path).into_owned(),
                    kind: kind.to_string(),
                });
            }
            Ok(TreeEntry {
                path: path.to_vec(),
                blob: ObjectId::parse(object)?,
            })
        })
        .collect()
}

impl Repository for GitCli {
    fn resolve_commit(&self, reference: &str) -> Result<CommitId, GitError> {
        validate_reference(reference)?;
        let spec = format!("{reference}^{{commit}}");
        let output = self.output(
            self.command()
                .args(["rev-parse", "--verify", "--quiet", "--end-of-options"])
                .arg(&spec),
        )?;
        if !output.status.success() {
            return Err(GitError::UnknownRevision {
                reference: reference.to_string(),
            });
        }
        ObjectId::parse(String::from_utf8_lossy(&output.stdout).trim())
    }

    fn read_commit(&self, id: &CommitId) -> Result<Commit, GitError> {
        let out = self.run(
            self.command()
                .args(["show", "-s", "--no-show-signature", "--no-color"])
                .arg(format!("--format={COMMIT_FORMAT}"))
                .arg(id.as_str()),
            "show",
        )?;
        parse_commit_record(&String::from_utf8_lossy(&out))
    }

    fn list_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>, GitError> {
        let out = self.run(
            self.command()
                .args(["ls-tree", "--full-tree", "-r", "-z"])
                .arg(commit.as_str()),
            "ls-tree",
        )?;
        parse_ls_tree(&out)
    }

    fn open_blob_reader(&self) -> Result<Box<dyn BlobReader + '_>, GitError> {
        let mut command = self.command();
        command.args(["cat-file", "--batch"]);
        Ok(Box::new(CatFileBatch::spawn(command)?))
    }

    fn verify_signature(
        &self,
        commit: &CommitId,
        context: SignatureContext<'_>,
    ) -> Result<SignatureVerdict, GitError> {
        let mut command = self.command();
        if let Some(gpg) = &self.gpg_program {
            command
                .arg("-c")
                .arg(concat_os("gpg.program=", gpg.as_os_str()));
        }
        command.args(["verify-commit", "--raw", commit.as_str()]);
        let output = self.output(&mut command)?;

        let status = String::from_utf8_lossy(&output.stderr);
        let report = gpg_status::parse_status(&status);
        Ok(gpg_status::evaluate(
            &report,
            output.status.success(),
            context,
        ))
    }

    fn trial_merge(&self, first: &CommitId, second: &CommitId) -> Result<MergeOutcome, GitError> {
        match self.merge_strategy {
            MergeStrategy::MergeTree => self.merge_tree(first, second),
            MergeStrategy::Worktree | MergeStrategy::Auto => {
                let scratch = ScratchWorktree::acquire(self, first)?;
                scratch.merge(second)
            },
        }
    }

    fn diff_stat(&self, from_tree: &ObjectId, to_commit: &CommitId) -> Result<String, GitError> {
        let out = self.run(
            self.command()
                .args(["diff", "--stat", "--no-color", "--no-ext-diff"])
                .arg(from_tree.as_str())
                .arg(to_commit.as_str()),
            "diff",
        )?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

fn concat_os(prefix: &str, value: &OsStr) -> std::ffi::OsString {
    let mut joined = std::ffi::OsString::from(prefix);
    joined.push(value);
    joined
}
