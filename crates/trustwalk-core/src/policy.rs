//! Per-step verification policy.
//!
//! The policy is walk state, not configuration: it starts strict and relaxes
//! exactly once, when the walk reaches the digest root. It is threaded
//! explicitly through every check.

use serde::Serialize;

/// Flags governing the checks applied to the current commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerificationPolicy {
    /// Compare the recorded `Tree-SHA512` against the computed tree digest.
    pub check_digest: bool,
    /// Accept signatures made with SHA-1 digests.
    pub allow_sha1: bool,
}

impl VerificationPolicy {
    /// Policy for history below the digest root.
    pub const fn strict() -> Self {
        Self {
            check_digest: true,
            allow_sha1: false,
        }
    }

    /// Strict policy with digest checking switched off from the start.
    ///
    /// Weakens trust: tree contents are no longer bound to signatures.
    pub const fn without_digest_checks() -> Self {
        Self {
            check_digest: false,
            allow_sha1: false,
        }
    }

    /// Relaxes the policy for legacy history at and beyond the digest root.
    ///
    /// Returns whether digest checks were active before the transition.
    pub fn enter_legacy_history(&mut self) -> bool {
        let was_checking = self.check_digest;
        self.check_digest = false;
        self.allow_sha1 = true;
        was_checking
    }
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self::strict()
    }
}
