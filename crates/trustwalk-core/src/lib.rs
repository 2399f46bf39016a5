//! Chain-of-trust verification for signed git history.
//!
//! Starting from a commit, [`walker::CommitGraphWalker`] follows first-parent
//! history down to a trusted root and requires, for every commit on the way:
//!
//! - a signature by an authorized key ([`signature`], [`gpg_status`]);
//! - a `Tree-SHA512:` line in the message matching the commit's tree
//!   ([`digest`]), until the digest root is reached;
//! - for two-parent merges, a tree identical to the mechanical merge of the
//!   parents ([`merge_check`]).
//!
//! All access to the repository goes through the [`git::Repository`]
//! trait. [`git::GitCli`] implements it with the `git` executable.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use trustwalk_core::git::{GitCli, GitCliOptions};
//! use trustwalk_core::trust::TrustStore;
//! use trustwalk_core::walker::{CommitGraphWalker, WalkOptions};
//!
//! let repo = GitCli::open(Path::new("."), GitCliOptions::default())?;
//! let trust = TrustStore::load(Path::new("contrib/verify-commits"))?;
//! let walker = CommitGraphWalker::new(&repo, &trust, WalkOptions::new(chrono::Utc::now()));
//! let report = walker.walk_from_reference("HEAD")?;
//! println!("verified {} commits", report.verified);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod digest;
pub mod git;
pub mod gpg_status;
pub mod merge_check;
pub mod policy;
pub mod signature;
pub mod trust;
pub mod walker;

pub use config::{ConfigError, VerifierConfig};
pub use digest::{TreeDigest, TreeDigestComputer};
pub use policy::VerificationPolicy;
pub use walker::{CommitGraphWalker, VerifyError, WalkFailure, WalkOptions, WalkReport};
