//! Commit signature verification under the current walk policy.

use serde::Serialize;

use crate::git::{CommitId, GitError, Repository, SignatureContext};
use crate::policy::VerificationPolicy;
use crate::trust::TrustStore;

/// Outcome of a signature check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SignatureVerdict {
    /// Signed by an authorized key under the current policy.
    Trusted {
        /// Primary-key fingerprint of the signer.
        fingerprint: String,
    },
    /// Missing, bad, or policy-rejected signature.
    Untrusted {
        /// Why the signature was rejected.
        reason: String,
    },
}

impl SignatureVerdict {
    pub(crate) fn untrusted(reason: impl Into<String>) -> Self {
        Self::Untrusted {
            reason: reason.into(),
        }
    }

    /// Whether the verdict is [`SignatureVerdict::Trusted`].
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted { .. })
    }
}

/// Verifies commit signatures against the trusted key set.
pub struct SignatureVerifier<'a, R: ?Sized> {
    repo: &'a R,
    trust: &'a TrustStore,
}

impl<'a, R: Repository + ?Sized> SignatureVerifier<'a, R> {
    /// Creates a verifier over `repo` using keys and exemptions from `trust`.
    pub fn new(repo: &'a R, trust: &'a TrustStore) -> Self {
        Self { repo, trust }
    }

    /// Builds the per-commit verification context.
    ///
    /// Revoked or expired keys are tolerated only for commits on the revsig
    /// allow-list.
    pub fn context_for(&self, commit: &CommitId, policy: VerificationPolicy) -> SignatureContext<'a> {
        SignatureContext {
            allow_sha1: policy.allow_sha1,
            allow_revoked: self.trust.allow_lists.revsig.contains(commit),
            trusted_keys: &self.trust.trusted_keys,
        }
    }

    /// Verifies `commit`'s signature.
    ///
    /// Returns `Ok(Untrusted)` for any verification failure; `Err` only when
    /// the repository itself could not be queried.
    pub fn verify(
        &self,
        commit: &CommitId,
        policy: VerificationPolicy,
    ) -> Result<SignatureVerdict, GitError> {
        let context = self.context_for(commit, policy);
        let verdict = self.repo.verify_signature(commit, context)?;
        tracing::debug!(
            commit = %commit,
            allow_sha1 = context.allow_sha1,
            allow_revoked = context.allow_revoked,
            ?verdict,
            "signature checked"
        );
        Ok(verdict)
    }
}
