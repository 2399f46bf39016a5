//! In-memory [`Repository`] for unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha512};

use super::{
    BlobReader, Commit, CommitId, GitError, MergeOutcome, ObjectId, Repository, SignatureContext,
    TreeEntry,
};
use crate::digest::TreeDigestComputer;
use crate::signature::SignatureVerdict;

/// Fingerprint the fake treats as the trusted signer.
pub(crate) const TRUSTED_KEY: &str = "FA4EFA4EFA4EFA4EFA4EFA4EFA4EFA4EFA4EFA4E";

/// Epoch second used as the first fake commit time.
const BASE_TIME: i64 = 1_700_000_000;

/// Deterministic commit id for test fixtures.
pub(crate) fn commit_id(n: u64) -> CommitId {
    ObjectId::parse(&format!("{n:040x}")).expect("fixture id is valid hex")
}

/// Content-derived object id, so identical contents share ids.
fn content_id(bytes: &[u8]) -> ObjectId {
    let digest = Sha512::digest(bytes);
    ObjectId::parse(&hex::encode(&digest[..20])).expect("hex digest is a valid id")
}

fn tree_id(files: &[(&[u8], &[u8])]) -> ObjectId {
    let mut sorted = files.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut listing = Vec::new();
    for (path, contents) in sorted {
        listing.extend_from_slice(path);
        listing.push(0);
        listing.extend_from_slice(content_id(contents).as_str().as_bytes());
    }
    content_id(&listing)
}

/// How a fake commit is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeSignature {
    /// Good signature by the trusted key with a modern digest.
    Good,
    /// Good signature by the trusted key, SHA-1 digest.
    Sha1,
    /// Signature by the trusted key after it was revoked.
    Revoked,
    /// Good signature by a key that is not trusted.
    ForeignKey,
    /// No signature.
    Unsigned,
}

/// One recorded `verify_signature` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignatureCheck {
    pub(crate) commit: CommitId,
    pub(crate) allow_sha1: bool,
    pub(crate) allow_revoked: bool,
}

#[derive(Default)]
pub(crate) struct FakeRepo {
    head: Option<CommitId>,
    commits: BTreeMap<CommitId, Commit>,
    trees: BTreeMap<ObjectId, Vec<TreeEntry>>,
    blobs: BTreeMap<ObjectId, Vec<u8>>,
    signatures: BTreeMap<CommitId, FakeSignature>,
    merges: BTreeMap<(CommitId, CommitId), MergeOutcome>,
    truncate_blobs: bool,
    readers_opened: AtomicUsize,
    signature_checks: Mutex<Vec<SignatureCheck>>,
    trial_merges: AtomicUsize,
}

impl FakeRepo {
    /// Stores `files` as the tree of `commit` (creating a bare commit record
    /// if none exists yet) and returns the tree id.
    pub(crate) fn set_tree(&mut self, commit: &CommitId, files: &[(&[u8], &[u8])]) -> ObjectId {
        let tree = self.store_tree(files);
        let next_time = self.next_time();
        self.commits
            .entry(commit.clone())
            .or_insert_with(|| Commit {
                id: commit.clone(),
                tree: tree.clone(),
                parents: Vec::new(),
                timestamp: next_time,
                author: "Fixture <fixture@example.org>".to_string(),
                message: String::new(),
            })
            .tree = tree.clone();
        tree
    }

    fn store_tree(&mut self, files: &[(&[u8], &[u8])]) -> ObjectId {
        let tree = tree_id(files);
        let entries = files
            .iter()
            .map(|(path, contents)| {
                let blob = content_id(contents);
                self.blobs.insert(blob.clone(), contents.to_vec());
                TreeEntry {
                    path: path.to_vec(),
                    blob,
                }
            })
            .collect();
        self.trees.insert(tree.clone(), entries);
        tree
    }

    fn next_time(&self) -> DateTime<Utc> {
        let offset = i64::try_from(self.commits.len()).unwrap_or(i64::MAX / 2) * 60;
        DateTime::from_timestamp(BASE_TIME + offset, 0).expect("fixture time in range")
    }

    /// Adds a signed commit whose message records the correct tree digest.
    pub(crate) fn add_commit(
        &mut self,
        id: &CommitId,
        parents: &[CommitId],
        files: &[(&[u8], &[u8])],
    ) {
        self.set_tree(id, files);
        let digest = TreeDigestComputer::new(&*self)
            .compute(id)
            .expect("fixture tree digests");
        let commit = self.commits.get_mut(id).expect("commit just inserted");
        commit.parents = parents.to_vec();
        commit.message = format!("Commit {}\n\n{}\n", id.short(), digest.message_line());
        self.signatures.insert(id.clone(), FakeSignature::Good);
        self.head = Some(id.clone());
    }

    /// Replaces the message of an existing commit.
    pub(crate) fn set_message(&mut self, id: &CommitId, message: &str) {
        self.commit_mut(id).message = message.to_string();
    }

    /// Replaces the timestamp of an existing commit.
    pub(crate) fn set_timestamp(&mut self, id: &CommitId, timestamp: DateTime<Utc>) {
        self.commit_mut(id).timestamp = timestamp;
    }

    /// Sets how a commit is signed.
    pub(crate) fn set_signature(&mut self, id: &CommitId, signature: FakeSignature) {
        self.signatures.insert(id.clone(), signature);
    }

    /// Marks `id` as signed by the trusted key after revocation.
    pub(crate) fn sign_with_revoked_key(&mut self, id: &CommitId) {
        self.set_signature(id, FakeSignature::Revoked);
    }

    /// Records what a mechanical merge of `second` into `first` yields.
    pub(crate) fn set_merge_result(
        &mut self,
        first: &CommitId,
        second: &CommitId,
        files: Option<&[(&[u8], &[u8])]>,
    ) {
        let outcome = match files {
            Some(files) => MergeOutcome::Merged {
                tree: self.store_tree(files),
            },
            None => MergeOutcome::Conflicted,
        };
        self.merges
            .insert((first.clone(), second.clone()), outcome);
    }

    /// Makes every blob stream end early.
    pub(crate) fn truncate_blobs(&mut self) {
        self.truncate_blobs = true;
    }

    pub(crate) fn blob_readers_opened(&self) -> usize {
        self.readers_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn trial_merges(&self) -> usize {
        self.trial_merges.load(Ordering::SeqCst)
    }

    pub(crate) fn signature_checks(&self) -> Vec<SignatureCheck> {
        self.signature_checks
            .lock()
            .map(|checks| checks.clone())
            .unwrap_or_default()
    }

    fn commit_mut(&mut self, id: &CommitId) -> &mut Commit {
        self.commits.get_mut(id).expect("fixture commit exists")
    }
}

struct FakeBlobReader<'a> {
    repo: &'a FakeRepo,
}

impl BlobReader for FakeBlobReader<'_> {
    fn stream_blob(
        &mut self,
        blob: &ObjectId,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<u64, GitError> {
        let bytes = self
            .repo
            .blobs
            .get(blob)
            .ok_or_else(|| GitError::MissingBlob { blob: blob.clone() })?;
        if self.repo.truncate_blobs {
            let half = bytes.len() / 2;
            sink(&bytes[..half]);
            return Err(GitError::TruncatedBlob {
                blob: blob.clone(),
                expected: bytes.len() as u64,
                actual: half as u64,
            });
        }
        // Odd chunk size so chunk boundaries land mid-content.
        for chunk in bytes.chunks(7) {
            sink(chunk);
        }
        Ok(bytes.len() as u64)
    }
}

impl Repository for FakeRepo {
    fn resolve_commit(&self, reference: &str) -> Result<CommitId, GitError> {
        super::validate_reference(reference)?;
        let unknown = || GitError::UnknownRevision {
            reference: reference.to_string(),
        };
        if reference == "HEAD" {
            return self.head.clone().ok_or_else(unknown);
        }
        let id = ObjectId::parse(reference).map_err(|_| unknown())?;
        if self.commits.contains_key(&id) {
            Ok(id)
        } else {
            Err(unknown())
        }
    }

    fn read_commit(&self, id: &CommitId) -> Result<Commit, GitError> {
        self.commits
            .get(id)
            .cloned()
            .ok_or_else(|| GitError::UnknownRevision {
                reference: id.to_string(),
            })
    }

    fn list_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>, GitError> {
        let commit = self.read_commit(commit)?;
        Ok(self.trees.get(&commit.tree).cloned().unwrap_or_default())
    }

    fn open_blob_reader(&self) -> Result<Box<dyn BlobReader + '_>, GitError> {
        self.readers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBlobReader { repo: self }))
    }

    fn verify_signature(
        &self,
        commit: &CommitId,
        context: SignatureContext<'_>,
    ) -> Result<SignatureVerdict, GitError> {
        if let Ok(mut checks) = self.signature_checks.lock() {
            checks.push(SignatureCheck {
                commit: commit.clone(),
                allow_sha1: context.allow_sha1,
                allow_revoked: context.allow_revoked,
            });
        }
        let key_trusted = context.trusted_keys.contains(TRUSTED_KEY);
        let signature = self
            .signatures
            .get(commit)
            .copied()
            .unwrap_or(FakeSignature::Unsigned);
        let verdict = match signature {
            FakeSignature::Good if key_trusted => SignatureVerdict::Trusted {
                fingerprint: TRUSTED_KEY.to_string(),
            },
            FakeSignature::Sha1 if key_trusted && context.allow_sha1 => SignatureVerdict::Trusted {
                fingerprint: TRUSTED_KEY.to_string(),
            },
            FakeSignature::Revoked if key_trusted && context.allow_revoked => {
                SignatureVerdict::Trusted {
                    fingerprint: TRUSTED_KEY.to_string(),
                }
            },
            FakeSignature::Unsigned => SignatureVerdict::untrusted("no valid signature"),
            _ => SignatureVerdict::untrusted("signature rejected by policy"),
        };
        Ok(verdict)
    }

    fn trial_merge(&self, first: &CommitId, second: &CommitId) -> Result<MergeOutcome, GitError> {
        self.trial_merges.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .merges
            .get(&(first.clone(), second.clone()))
            .cloned()
            .unwrap_or(MergeOutcome::Conflicted))
    }

    fn diff_stat(&self, from_tree: &ObjectId, to_commit: &CommitId) -> Result<String, GitError> {
        Ok(format!(" {} -> {} | 1 file changed\n", from_tree.short(), to_commit.short()))
    }
}
