//! Merge cleanliness: a two-parent merge must carry exactly the tree a
//! conflict-free mechanical merge of its parents produces.

use serde::Serialize;

use crate::git::{Commit, GitError, MergeOutcome, ObjectId, Repository};

/// Outcome of re-deriving a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MergeVerdict {
    /// The recorded tree equals the recreated merge.
    Clean,
    /// The recorded tree differs, or the parents do not merge cleanly.
    Dirty {
        /// Tree of the recreated merge; `None` when the merge conflicted.
        recreated_tree: Option<ObjectId>,
        /// `--stat` diff from the recreated tree to the recorded commit.
        /// Empty when the merge conflicted.
        diff_stat: String,
    },
}

impl MergeVerdict {
    /// Whether the verdict is [`MergeVerdict::Clean`].
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Re-derives two-parent merges through [`Repository::trial_merge`].
pub struct MergeCleanlinessChecker<'a, R: ?Sized> {
    repo: &'a R,
}

impl<'a, R: Repository + ?Sized> MergeCleanlinessChecker<'a, R> {
    /// Creates a checker over `repo`.
    pub fn new(repo: &'a R) -> Self {
        Self { repo }
    }

    /// Checks a two-parent merge commit.
    ///
    /// Callers must only pass commits with exactly two parents; anything
    /// else is reported as dirty.
    pub fn is_clean(&self, commit: &Commit) -> Result<MergeVerdict, GitError> {
        let [first, second] = commit.parents.as_slice() else {
            return Ok(MergeVerdict::Dirty {
                recreated_tree: None,
                diff_stat: String::new(),
            });
        };

        match self.repo.trial_merge(first, second)? {
            MergeOutcome::Merged { tree } if tree == commit.tree => {
                tracing::debug!(commit = %commit.id, "merge recreated cleanly");
                Ok(MergeVerdict::Clean)
            },
            MergeOutcome::Merged { tree } => {
                let diff_stat = self.repo.diff_stat(&tree, &commit.id)?;
                tracing::debug!(commit = %commit.id, recreated = %tree, "merge tree differs");
                Ok(MergeVerdict::Dirty {
                    recreated_tree: Some(tree),
                    diff_stat,
                })
            },
            MergeOutcome::Conflicted => {
                tracing::debug!(commit = %commit.id, "trial merge conflicted");
                Ok(MergeVerdict::Dirty {
                    recreated_tree: None,
                    diff_stat: String::new(),
                })
            },
        }
    }
}
