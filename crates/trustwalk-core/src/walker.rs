//! First-parent history walk from a start commit down to the signed root.
//!
//! For each commit `c` the walker applies, in order:
//!
//! 1. `c` is the signed root: the walk succeeds.
//! 2. `c` is the digest root: the [`VerificationPolicy`] relaxes (no digest
//!    checks, SHA-1 signatures accepted) for the rest of the walk.
//! 3. The signature must be trusted under the current policy.
//! 4. With digest checks on and `c` not exempt, `c`'s message must carry the
//!    exact `Tree-SHA512:` line of its tree. The start commit is held to this
//!    regardless of the policy.
//! 5. More than two parents is always fatal.
//! 6. Two-parent commits inside the lookback window must be clean merges
//!    unless exempt.
//! 7. Continue at the first parent. Running out of parents is fatal.
//!
//! The walk is sequential and halts on the first failure. The failure
//! carries how far the walk got.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::digest::{self, DigestError, TreeDigestComputer};
use crate::git::{Commit, CommitId, GitError, ObjectId, Repository};
use crate::merge_check::{MergeCleanlinessChecker, MergeVerdict};
use crate::policy::VerificationPolicy;
use crate::signature::{SignatureVerdict, SignatureVerifier};
use crate::trust::{TrustConfigError, TrustStore};

/// Default upper bound on commits visited by one walk.
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;

const SECONDS_PER_DAY: f64 = 86_400.0;

// ─────────────────────────────────────────────────────────────────────────────
// Options and state
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for one walk.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkOptions {
    /// Only merges newer than this many days (fractional) before `now` are
    /// re-derived. `None` checks every merge.
    pub lookback_days: Option<f64>,
    /// Start with digest checks enabled. Disabling them weakens trust.
    pub check_digest: bool,
    /// Fail once more than this many commits would be visited.
    pub max_steps: u64,
    /// Worker threads for tree hashing.
    pub digest_workers: NonZeroUsize,
    /// Reference instant for the lookback window.
    pub now: DateTime<Utc>,
}

impl WalkOptions {
    /// Defaults with the lookback window anchored at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            lookback_days: None,
            check_digest: true,
            max_steps: DEFAULT_MAX_STEPS,
            digest_workers: NonZeroUsize::MIN,
            now,
        }
    }

    /// Whether a merge committed at `timestamp` falls inside the lookback
    /// window.
    #[allow(clippy::cast_precision_loss)]
    pub fn in_lookback_window(&self, timestamp: DateTime<Utc>) -> bool {
        match self.lookback_days {
            None => true,
            Some(days) => {
                let cutoff = self.now.timestamp() as f64 - days * SECONDS_PER_DAY;
                timestamp.timestamp() as f64 > cutoff
            },
        }
    }
}

/// Walker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkState {
    /// Below the digest root, full checks.
    Walking,
    /// At or beyond the digest root; digest checks off.
    ReachedDigestRoot,
    /// Terminal success.
    ReachedSignedRoot,
    /// Terminal failure.
    Failed,
}

/// How far a walk got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkProgress {
    /// Commits that passed every applicable check.
    pub verified: u64,
    /// The last commit that passed every applicable check.
    pub last_trusted: Option<CommitId>,
    /// Digest root crossed while digest checks were still on. Every commit
    /// visited before it had a matching `Tree-SHA512:` line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digests_matched_up_to: Option<CommitId>,
    /// State when the walk stopped.
    pub state: WalkState,
}

impl Default for WalkProgress {
    fn default() -> Self {
        Self {
            verified: 0,
            last_trusted: None,
            digests_matched_up_to: None,
            state: WalkState::Walking,
        }
    }
}

/// Successful walk summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    /// Start commit.
    pub start: CommitId,
    /// Signed root the walk reached.
    pub signed_root: CommitId,
    /// Digest root from the trust store.
    pub digest_root: CommitId,
    /// Whether the digest root was crossed on the way.
    pub digest_root_reached: bool,
    /// Set when every commit above the digest root had a matching digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digests_matched_up_to: Option<CommitId>,
    /// Commits verified before reaching the signed root.
    pub verified: u64,
    /// Merges whose cleanliness was re-derived.
    pub merges_checked: u64,
    /// Merges skipped by the allow-list or the lookback window.
    pub merges_skipped: u64,
    /// Final state; always [`WalkState::ReachedSignedRoot`].
    pub state: WalkState,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Why a walk failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// A commit on the path is not signed by a trusted key.
    #[error("{}", unsigned_message(.commit, .child, .reason))]
    UnsignedCommit {
        /// The commit whose signature was rejected.
        commit: CommitId,
        /// The already-verified commit whose first parent `commit` is, or
        /// `commit` itself when it is the start of the walk.
        child: CommitId,
        /// One-line summaries of `child`'s parents.
        parents: Vec<String>,
        /// Rejection reason from signature evaluation.
        reason: String,
    },

    /// A recorded tree digest does not match, or the tree could not be read
    /// in full.
    #[error("Tree-SHA512 did not match for commit {commit}: {detail}")]
    Integrity {
        /// The offending commit.
        commit: CommitId,
        /// What went wrong.
        detail: String,
    },

    /// A merge commit's tree differs from the recreated merge.
    #[error("merge commit {commit} is not clean")]
    DirtyMerge {
        /// The merge commit.
        commit: CommitId,
        /// Tree of the recreated merge, when the parents merged at all.
        recreated_tree: Option<ObjectId>,
        /// `--stat` difference between recreated and recorded trees.
        diff_stat: String,
    },

    /// A commit has more than two parents.
    #[error("commit {commit} is an octopus merge with {parents} parents")]
    OctopusMerge {
        /// The offending commit.
        commit: CommitId,
        /// Parent count.
        parents: usize,
    },

    /// Trust material could not be loaded.
    #[error(transparent)]
    Config(#[from] TrustConfigError),

    /// Bad input: an unresolvable start reference, an unsupported tree
    /// entry, or history that ends before the signed root.
    #[error("malformed input: {detail}")]
    MalformedInput {
        /// The commit being processed, if any.
        commit: Option<CommitId>,
        /// What was wrong.
        detail: String,
    },

    /// The walk visited more commits than allowed.
    #[error("walk exceeded {limit} steps without reaching the signed root")]
    StepLimitExceeded {
        /// Configured bound.
        limit: u64,
    },

    /// The repository delegate malfunctioned.
    #[error("repository access failed: {0}")]
    Repository(#[source] GitError),
}

fn unsigned_message(commit: &CommitId, child: &CommitId, reason: &str) -> String {
    if commit == child {
        format!("{commit} was not signed with a trusted key: {reason}")
    } else {
        format!("No parent of {child} was signed with a trusted key ({commit}: {reason})")
    }
}

impl VerifyError {
    /// Stable snake_case name of the error kind, for machine output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsignedCommit { .. } => "unsigned_commit",
            Self::Integrity { .. } => "integrity",
            Self::DirtyMerge { .. } => "dirty_merge",
            Self::OctopusMerge { .. } => "octopus_merge",
            Self::Config(_) => "config",
            Self::MalformedInput { .. } => "malformed_input",
            Self::StepLimitExceeded { .. } => "step_limit_exceeded",
            Self::Repository(_) => "repository",
        }
    }

    /// The commit the failure is about, when there is one.
    pub fn commit(&self) -> Option<&CommitId> {
        match self {
            Self::UnsignedCommit { commit, .. }
            | Self::Integrity { commit, .. }
            | Self::DirtyMerge { commit, .. }
            | Self::OctopusMerge { commit, .. } => Some(commit),
            Self::MalformedInput { commit, .. } => commit.as_ref(),
            Self::Config(_) | Self::StepLimitExceeded { .. } | Self::Repository(_) => None,
        }
    }

    /// Classifies a delegate error raised while processing `commit`.
    fn from_git(commit: Option<&CommitId>, err: GitError) -> Self {
        if err.is_blob_integrity_failure() {
            match commit {
                Some(commit) => Self::Integrity {
                    commit: commit.clone(),
                    detail: err.to_string(),
                },
                None => Self::Repository(err),
            }
        } else if err.is_malformed_input() {
            Self::MalformedInput {
                commit: commit.cloned(),
                detail: err.to_string(),
            }
        } else {
            Self::Repository(err)
        }
    }
}

/// A failed walk: the error plus partial progress.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct WalkFailure {
    /// What stopped the walk.
    #[source]
    pub error: VerifyError,
    /// How far it got.
    pub progress: WalkProgress,
}

// ─────────────────────────────────────────────────────────────────────────────
// Walker
// ─────────────────────────────────────────────────────────────────────────────

/// Drives the verification walk.
pub struct CommitGraphWalker<'a, R: ?Sized> {
    repo: &'a R,
    trust: &'a TrustStore,
    options: WalkOptions,
}

struct Walk {
    progress: WalkProgress,
    policy: VerificationPolicy,
    digest_root_reached: bool,
    merges_checked: u64,
    merges_skipped: u64,
}

impl Walk {
    fn fail(mut self, error: VerifyError) -> WalkFailure {
        self.progress.state = WalkState::Failed;
        tracing::debug!(
            kind = error.kind(),
            verified = self.progress.verified,
            "walk failed"
        );
        WalkFailure {
            error,
            progress: self.progress,
        }
    }
}

impl<'a, R: Repository + ?Sized> CommitGraphWalker<'a, R> {
    /// Creates a walker over `repo` governed by `trust`.
    pub fn new(repo: &'a R, trust: &'a TrustStore, options: WalkOptions) -> Self {
        if !options.check_digest {
            tracing::warn!("tree digest checks disabled below the start commit; history contents are not verified");
        }
        Self {
            repo,
            trust,
            options,
        }
    }

    /// Resolves `reference` and walks from it.
    pub fn walk_from_reference(&self, reference: &str) -> Result<WalkReport, WalkFailure> {
        match self.repo.resolve_commit(reference) {
            Ok(start) => self.walk(&start),
            Err(err) => Err(WalkFailure {
                error: VerifyError::from_git(None, err),
                progress: WalkProgress {
                    state: WalkState::Failed,
                    ..WalkProgress::default()
                },
            }),
        }
    }

    /// Walks first-parent history from `start` to the signed root.
    pub fn walk(&self, start: &CommitId) -> Result<WalkReport, WalkFailure> {
        let roots = &self.trust.roots;
        let mut walk = Walk {
            progress: WalkProgress::default(),
            policy: if self.options.check_digest {
                VerificationPolicy::strict()
            } else {
                VerificationPolicy::without_digest_checks()
            },
            digest_root_reached: false,
            merges_checked: 0,
            merges_skipped: 0,
        };
        let mut current = start.clone();
        let mut child: Option<Commit> = None;
        let mut steps: u64 = 0;

        tracing::info!(start = %start, signed_root = %roots.signed_root, "starting walk");

        loop {
            if current == roots.signed_root {
                walk.progress.state = WalkState::ReachedSignedRoot;
                tracing::info!(
                    verified = walk.progress.verified,
                    signed_root = %roots.signed_root,
                    "reached signed root"
                );
                return Ok(WalkReport {
                    start: start.clone(),
                    signed_root: roots.signed_root.clone(),
                    digest_root: roots.digest_root.clone(),
                    digest_root_reached: walk.digest_root_reached,
                    digests_matched_up_to: walk.progress.digests_matched_up_to,
                    verified: walk.progress.verified,
                    merges_checked: walk.merges_checked,
                    merges_skipped: walk.merges_skipped,
                    state: walk.progress.state,
                });
            }

            if steps >= self.options.max_steps {
                let limit = self.options.max_steps;
                return Err(walk.fail(VerifyError::StepLimitExceeded { limit }));
            }
            steps += 1;

            if current == roots.digest_root {
                if walk.policy.enter_legacy_history() {
                    tracing::info!("All Tree-SHA512s matched up to {}", roots.digest_root);
                    walk.progress.digests_matched_up_to = Some(current.clone());
                }
                walk.progress.state = WalkState::ReachedDigestRoot;
                walk.digest_root_reached = true;
            }

            let commit = match self.step(&current, child.as_ref(), &mut walk) {
                Ok(commit) => commit,
                Err(error) => return Err(walk.fail(error)),
            };

            walk.progress.verified += 1;
            walk.progress.last_trusted = Some(current.clone());

            let Some(parent) = commit.first_parent().cloned() else {
                let error = VerifyError::MalformedInput {
                    commit: Some(current),
                    detail: format!(
                        "reached a root commit without meeting the signed root {}",
                        roots.signed_root
                    ),
                };
                return Err(walk.fail(error));
            };
            child = Some(commit);
            current = parent;
        }
    }

    /// Applies signature, digest and merge rules to one commit.
    fn step(
        &self,
        id: &CommitId,
        child: Option<&Commit>,
        walk: &mut Walk,
    ) -> Result<Commit, VerifyError> {
        let commit = self
            .repo
            .read_commit(id)
            .map_err(|err| VerifyError::from_git(Some(id), err))?;
        tracing::debug!(commit = %id, parents = commit.parents.len(), policy = ?walk.policy, "checking commit");

        let verifier = SignatureVerifier::new(self.repo, self.trust);
        let verdict = verifier
            .verify(id, walk.policy)
            .map_err(|err| VerifyError::from_git(Some(id), err))?;
        if let SignatureVerdict::Untrusted { reason } = verdict {
            return Err(self.unsigned(&commit, child, reason));
        }

        // The start commit is always bound to its tree.
        let is_start = child.is_none();
        if (walk.policy.check_digest || is_start)
            && !self.trust.allow_lists.incorrect_digest.contains(id)
        {
            self.check_digest(&commit)?;
        }

        match commit.parents.len() {
            n if n > 2 => {
                return Err(VerifyError::OctopusMerge {
                    commit: id.clone(),
                    parents: n,
                });
            },
            2 => self.check_merge(&commit, walk)?,
            _ => {},
        }
        Ok(commit)
    }

    fn unsigned(&self, commit: &Commit, child: Option<&Commit>, reason: String) -> VerifyError {
        let child = child.unwrap_or(commit);
        let parents = child
            .parents
            .iter()
            .map(|parent| {
                if *parent == commit.id {
                    return commit.summary_line();
                }
                match self.repo.read_commit(parent) {
                    Ok(parent) => parent.summary_line(),
                    Err(err) => {
                        tracing::warn!(parent = %parent, error = %err, "cannot summarize parent");
                        parent.to_string()
                    },
                }
            })
            .collect();
        VerifyError::UnsignedCommit {
            commit: commit.id.clone(),
            child: child.id.clone(),
            parents,
            reason,
        }
    }

    fn check_digest(&self, commit: &Commit) -> Result<(), VerifyError> {
        let workers = self.options.digest_workers;
        let computed = TreeDigestComputer::new(self.repo)
            .with_workers(workers)
            .compute(&commit.id)
            .map_err(|err| match err {
                DigestError::Git(err) => VerifyError::from_git(Some(&commit.id), err),
                other => VerifyError::Integrity {
                    commit: commit.id.clone(),
                    detail: other.to_string(),
                },
            })?;
        if digest::message_declares(&commit.message, &computed) {
            return Ok(());
        }
        let recorded = digest::recorded_digests(&commit.message);
        let detail = if recorded.is_empty() {
            format!("no Tree-SHA512 line recorded; computed {computed}")
        } else {
            format!("recorded {}; computed {computed}", recorded.join(", "))
        };
        Err(VerifyError::Integrity {
            commit: commit.id.clone(),
            detail,
        })
    }

    fn check_merge(&self, commit: &Commit, walk: &mut Walk) -> Result<(), VerifyError> {
        if self.trust.allow_lists.unclean_merge.contains(&commit.id) {
            tracing::debug!(commit = %commit.id, "merge exempt from cleanliness check");
            walk.merges_skipped += 1;
            return Ok(());
        }
        if !self.options.in_lookback_window(commit.timestamp) {
            tracing::debug!(commit = %commit.id, "merge outside lookback window");
            walk.merges_skipped += 1;
            return Ok(());
        }

        walk.merges_checked += 1;
        match MergeCleanlinessChecker::new(self.repo)
            .is_clean(commit)
            .map_err(|err| VerifyError::from_git(Some(&commit.id), err))?
        {
            MergeVerdict::Clean => Ok(()),
            MergeVerdict::Dirty {
                recreated_tree,
                diff_stat,
            } => Err(VerifyError::DirtyMerge {
                commit: commit.id.clone(),
                recreated_tree,
                diff_stat,
            }),
        }
    }
}
