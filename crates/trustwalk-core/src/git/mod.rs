//! Repository capability surface used by the verifier.
//!
//! The verifier never talks to git directly. Everything it needs from the
//! version-control store (commit metadata, tree listings, blob bytes,
//! signature checks and trial merges) goes through the [`Repository`] trait.
//! [`GitCli`] implements it by driving the `git` executable.
//!
//! # Invariants
//!
//! - [`ObjectId`] values are always full-length lowercase hex (SHA-1 or
//!   SHA-256 object format). Abbreviated or symbolic references are resolved
//!   once, through [`Repository::resolve_commit`], and never stored.
//! - Trial merges never mutate the caller's working tree.

mod cat_file;
mod cli;
pub mod hardening;
mod staging;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::cli::{GitCli, GitCliOptions, MergeStrategy};
pub use self::hardening::HardeningError;
use crate::signature::SignatureVerdict;

// ─────────────────────────────────────────────────────────────────────────────
// Object identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Hex length of a SHA-1 object id.
pub const SHA1_HEX_LEN: usize = 40;

/// Hex length of a SHA-256 object id.
pub const SHA256_HEX_LEN: usize = 64;

/// A full, lowercase hex git object id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

/// Commits are addressed by plain object ids.
pub type CommitId = ObjectId;

impl ObjectId {
    /// Parses a full-length object id.
    ///
    /// Uppercase hex is accepted and normalized to lowercase; anything that
    /// is not exactly 40 or 64 hex characters is rejected.
    pub fn parse(value: &str) -> Result<Self, GitError> {
        let len = value.len();
        if (len != SHA1_HEX_LEN && len != SHA256_HEX_LEN)
            || !value.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(GitError::InvalidObjectId {
                value: value.to_string(),
            });
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an abbreviated form for log output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = GitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read-only repository data
// ─────────────────────────────────────────────────────────────────────────────

/// Commit metadata as recorded by git.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// The commit's own id.
    pub id: CommitId,
    /// The tree snapshot the commit points at.
    pub tree: ObjectId,
    /// Parent ids in recorded order; the first entry is the first parent.
    pub parents: Vec<CommitId>,
    /// Committer timestamp.
    pub timestamp: DateTime<Utc>,
    /// `Name <email>` of the author, for operator diagnostics only.
    pub author: String,
    /// Raw message body.
    pub message: String,
}

impl Commit {
    /// First parent, if any.
    pub fn first_parent(&self) -> Option<&CommitId> {
        self.parents.first()
    }

    /// First line of the message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    /// One-line description used when listing parents for triage.
    pub fn summary_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.author,
            self.subject()
        )
    }
}

/// One file in a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Raw path bytes relative to the tree root.
    pub path: Vec<u8>,
    /// Blob holding the file contents.
    pub blob: ObjectId,
}

/// Result of a non-interactive two-way trial merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge completed and produced this tree.
    Merged {
        /// Tree id of the merge result.
        tree: ObjectId,
    },
    /// The merge stopped on conflicts (or refused to run).
    Conflicted,
}

/// Per-commit signature verification context.
///
/// Built fresh for every commit from the current `VerificationPolicy` and
/// the allow-lists; never read from process environment.
#[derive(Debug, Clone, Copy)]
pub struct SignatureContext<'a> {
    /// Signatures using SHA-1 digests are acceptable.
    pub allow_sha1: bool,
    /// Signatures by revoked or expired keys are acceptable.
    pub allow_revoked: bool,
    /// Primary-key fingerprints (uppercase hex) authorized to sign.
    pub trusted_keys: &'a BTreeSet<String>,
}

/// Streams blob contents. One reader amortizes a single connection across
/// many blobs.
pub trait BlobReader {
    /// Streams the bytes of `blob` into `sink`, chunk by chunk.
    ///
    /// Returns the total number of bytes delivered.
    fn stream_blob(
        &mut self,
        blob: &ObjectId,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<u64, GitError>;
}

/// Narrow capability interface over the version-control store.
pub trait Repository: Sync {
    /// Resolves a user-supplied reference (`HEAD`, branch, id) to a commit.
    fn resolve_commit(&self, reference: &str) -> Result<CommitId, GitError>;

    /// Reads a commit's metadata.
    fn read_commit(&self, id: &CommitId) -> Result<Commit, GitError>;

    /// Lists every file of the commit's tree, recursively, in storage order.
    fn list_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>, GitError>;

    /// Opens a streaming blob reader.
    fn open_blob_reader(&self) -> Result<Box<dyn BlobReader + '_>, GitError>;

    /// Verifies the commit's signature under `context`.
    ///
    /// A bad or missing signature is a [`SignatureVerdict::Untrusted`], not
    /// an error.
    fn verify_signature(
        &self,
        commit: &CommitId,
        context: SignatureContext<'_>,
    ) -> Result<SignatureVerdict, GitError>;

    /// Merges `second` into `first` without touching the caller's working
    /// tree.
    fn trial_merge(&self, first: &CommitId, second: &CommitId) -> Result<MergeOutcome, GitError>;

    /// Human-readable `--stat` style diff between a tree and a commit.
    fn diff_stat(&self, from_tree: &ObjectId, to_commit: &CommitId) -> Result<String, GitError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by repository access.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GitError {
    /// The git executable could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A git command exited unsuccessfully.
    #[error("git {command} failed: {stderr}")]
    CommandFailed {
        /// Subcommand that failed.
        command: String,
        /// Trimmed stderr of the command.
        stderr: String,
    },

    /// A reference does not name a commit.
    #[error("unknown commit reference `{reference}`")]
    UnknownRevision {
        /// The reference as given.
        reference: String,
    },

    /// A reference is syntactically unacceptable.
    #[error("invalid commit reference `{reference}`: {reason}")]
    InvalidReference {
        /// The reference as given.
        reference: String,
        /// Why it was refused.
        reason: &'static str,
    },

    /// A value is not a full-length hex object id.
    #[error("invalid object id `{value}`")]
    InvalidObjectId {
        /// The offending value.
        value: String,
    },

    /// git produced output that could not be parsed.
    #[error("malformed output from git {command}: {detail}")]
    MalformedOutput {
        /// Subcommand that produced the output.
        command: String,
        /// What was wrong with it.
        detail: String,
    },

    /// A tree entry is not a plain blob (e.g. a submodule gitlink).
    #[error("unsupported {kind} entry at `{path}` in tree listing")]
    UnsupportedTreeEntry {
        /// Lossy rendering of the entry path.
        path: String,
        /// Object type reported by git.
        kind: String,
    },

    /// A blob requested from the object store does not exist.
    #[error("blob {blob} is missing from the object store")]
    MissingBlob {
        /// The requested blob.
        blob: ObjectId,
    },

    /// A blob stream ended before its announced size.
    #[error("blob {blob} truncated: expected {expected} bytes, got {actual}")]
    TruncatedBlob {
        /// The blob being read.
        blob: ObjectId,
        /// Size announced in the header.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// I/O failure on a git pipe or scratch area.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable context.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The scratch merge area could not be hardened.
    #[error(transparent)]
    Hardening(#[from] HardeningError),
}

impl GitError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error means blob contents could not be read in full.
    pub fn is_blob_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingBlob { .. } | Self::TruncatedBlob { .. }
        )
    }

    /// Whether the error stems from bad user or repository input rather than
    /// a malfunctioning delegate.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Self::UnknownRevision { .. }
                | Self::InvalidReference { .. }
                | Self::InvalidObjectId { .. }
                | Self::UnsupportedTreeEntry { .. }
        )
    }
}

/// Rejects references that could be mistaken for options or that contain
/// whitespace.
pub fn validate_reference(reference: &str) -> Result<(), GitError> {
    let reason = if reference.is_empty() {
        Some("reference is empty")
    } else if reference.starts_with('-') {
        Some("reference must not start with '-'")
    } else if reference.chars().any(char::is_whitespace) {
        Some("reference must not contain whitespace")
    } else if reference.chars().any(char::is_control) {
        Some("reference must not contain control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(GitError::InvalidReference {
            reference: reference.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn object_id_accepts_sha1_and_sha256_lengths() {
        assert!(ObjectId::parse(SHA1).is_ok());
        let sha256 = "ab".repeat(32);
        assert!(ObjectId::parse(&sha256).is_ok());
    }

    #[test]
    fn object_id_normalizes_case() {
        let id = ObjectId::parse(&SHA1.to_ascii_uppercase()).expect("uppercase parses");
        assert_eq!(id.as_str(), SHA1);
    }

    #[test]
    fn object_id_rejects_abbreviations_and_non_hex() {
        let bad_values = [
            String::new(),
            "0123456".to_string(),
            "HEAD".to_string(),
            SHA1.replace('a', "g"),
            format!("{SHA1}0"),
        ];
        for bad in &bad_values {
            assert!(
                matches!(ObjectId::parse(bad), Err(GitError::InvalidObjectId { .. })),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn validate_reference_rejects_options_and_whitespace() {
        assert!(validate_reference("HEAD").is_ok());
        assert!(validate_reference("origin/master~3").is_ok());
        assert!(validate_reference("--upload-pack=x").is_err());
        assert!(validate_reference("HEAD master").is_err());
        assert!(validate_reference("").is_err());
    }

    #[test]
    fn validate_reference_rejects_control_characters() {
        for reference in ["HEAD\0", "ma\u{1b}[2Jster", "v1.0\u{7f}"] {
            match validate_reference(reference) {
                Err(GitError::InvalidReference { reason, .. }) => {
                    assert!(reason.contains("control"), "{reference:?}: {reason}");
                },
                other => panic!("{reference:?}: expected rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn summary_line_uses_subject_only() {
        let commit = Commit {
            id: ObjectId::parse(SHA1).expect("id"),
            tree: ObjectId::parse(SHA1).expect("tree"),
            parents: Vec::new(),
            timestamp: DateTime::from_timestamp(0, 0).expect("epoch"),
            author: "A U Thor <a@example.org>".to_string(),
            message: "Subject line\n\nBody text\n".to_string(),
        };
        let line = commit.summary_line();
        assert!(line.starts_with(SHA1));
        assert!(line.ends_with("Subject line"));
        assert!(!line.contains("Body"));
    }
}
