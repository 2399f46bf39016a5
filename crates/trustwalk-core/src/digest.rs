//! Canonical SHA-512 tree digests.
//!
//! The digest of a commit binds its entire file listing and contents:
//!
//! ```text
//! SHA512( for each file, sorted by raw path bytes:
//!           hex(SHA512(contents)) || "  " || path || "\n" )
//! ```
//!
//! This is the `sha512sum`-style manifest of the tree, hashed once more.
//! Merge tooling records it in the merge commit message as a
//! `Tree-SHA512: <hex>` line, which [`message_declares`] looks for.
//!
//! # Invariants
//!
//! - The digest depends only on (path, contents) pairs. Entries are sorted
//!   before folding, so storage or enumeration order never matters.
//! - Blob bytes are streamed in bounded chunks; chunk boundaries never
//!   affect the result.
//! - With more than one worker, files are hashed in parallel shards but the
//!   fold still consumes results in canonical order.

use std::fmt;
use std::num::NonZeroUsize;

use sha2::{Digest as _, Sha512};
use thiserror::Error;

use crate::git::{BlobReader, CommitId, GitError, ObjectId, Repository, TreeEntry};

/// Prefix of the message line carrying a recorded tree digest.
pub const TREE_DIGEST_PREFIX: &str = "Tree-SHA512: ";

/// Size of a SHA-512 output in bytes.
pub const DIGEST_SIZE: usize = 64;

/// Minimum number of files per worker before parallel hashing pays off.
const MIN_FILES_PER_WORKER: usize = 64;

/// Errors computing a tree digest.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DigestError {
    /// Listing the tree or reading a blob failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// A hashing worker thread panicked.
    #[error("tree digest worker panicked")]
    WorkerPanicked,
}

/// A SHA-512 tree digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeDigest([u8; DIGEST_SIZE]);

impl TreeDigest {
    /// Raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The exact message line that records this digest.
    pub fn message_line(&self) -> String {
        format!("{TREE_DIGEST_PREFIX}{}", self.to_hex())
    }
}

impl fmt::Display for TreeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeDigest({})", self.to_hex())
    }
}

/// Whether `message` contains the exact `Tree-SHA512:` line for `digest`.
pub fn message_declares(message: &str, digest: &TreeDigest) -> bool {
    let expected = digest.message_line();
    message.lines().any(|line| line == expected)
}

/// Digest values recorded in `message`, for diagnostics.
pub fn recorded_digests(message: &str) -> Vec<&str> {
    message
        .lines()
        .filter_map(|line| line.strip_prefix(TREE_DIGEST_PREFIX))
        .collect()
}

/// Sorts entries into canonical (raw byte) path order.
pub fn sort_canonical(entries: &mut [TreeEntry]) {
    entries.sort_unstable_by(|a, b| a.path.cmp(&b.path));
}

/// Folds per-file hashes into the tree digest.
///
/// `files` must already be in canonical order.
pub fn fold<'a>(files: impl IntoIterator<Item = (&'a [u8], &'a [u8; DIGEST_SIZE])>) -> TreeDigest {
    let mut overall = Sha512::new();
    for (path, file_hash) in files {
        overall.update(hex::encode(file_hash).as_bytes());
        overall.update(b"  ");
        overall.update(path);
        overall.update(b"\n");
    }
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&overall.finalize());
    TreeDigest(out)
}

/// Hashes one blob by streaming it through `reader`.
pub fn hash_blob(
    reader: &mut dyn BlobReader,
    blob: &ObjectId,
) -> Result<[u8; DIGEST_SIZE], GitError> {
    let mut hasher = Sha512::new();
    reader.stream_blob(blob, &mut |chunk| hasher.update(chunk))?;
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Computes tree digests over a [`Repository`].
pub struct TreeDigestComputer<'a, R: ?Sized> {
    repo: &'a R,
    workers: NonZeroUsize,
}

impl<'a, R: Repository + ?Sized> TreeDigestComputer<'a, R> {
    /// Sequential computer: one blob connection, one thread.
    pub fn new(repo: &'a R) -> Self {
        Self {
            repo,
            workers: NonZeroUsize::MIN,
        }
    }

    /// Sets the maximum number of hashing workers.
    #[must_use]
    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    /// Computes the tree digest of `commit`.
    pub fn compute(&self, commit: &CommitId) -> Result<TreeDigest, DigestError> {
        let mut entries = self.repo.list_tree(commit)?;
        sort_canonical(&mut entries);
        let hashes = self.hash_files(&entries)?;
        tracing::debug!(commit = %commit, files = entries.len(), "tree digest computed");
        Ok(fold(
            entries
                .iter()
                .map(|entry| entry.path.as_slice())
                .zip(hashes.iter()),
        ))
    }

    fn hash_files(&self, entries: &[TreeEntry]) -> Result<Vec<[u8; DIGEST_SIZE]>, DigestError> {
        let workers = self
            .workers
            .get()
            .min(entries.len() / MIN_FILES_PER_WORKER)
            .max(1);
        if workers == 1 {
            return Ok(self.hash_shard(entries)?);
        }

        let shard_len = entries.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = entries
                .chunks(shard_len)
                .map(|shard| scope.spawn(move || self.hash_shard(shard)))
                .collect();

            let mut hashes = Vec::with_capacity(entries.len());
            for handle in handles {
                let shard = handle.join().map_err(|_| DigestError::WorkerPanicked)??;
                hashes.extend(shard);
            }
            Ok(hashes)
        })
    }

    fn hash_shard(&self, shard: &[TreeEntry]) -> Result<Vec<[u8; DIGEST_SIZE]>, GitError> {
        let mut reader = self.repo.open_blob_reader()?;
        shard
            .iter()
            .map(|entry| hash_blob(reader.as_mut(), &entry.blob))
            .collect()
    }
}
