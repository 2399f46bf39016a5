//! Trust roots, allow-lists and authorized keys.
//!
//! All trust material lives in one directory of plain text files:
//!
//! | file                              | contents                              |
//! |-----------------------------------|---------------------------------------|
//! | `trusted-git-root`                | signed root commit (first line)       |
//! | `trusted-sha512-root-commit`      | digest root commit (first line)       |
//! | `allow-revsig-commits`            | commits allowed revoked/expired keys  |
//! | `allow-unclean-merge-commits`     | merges exempt from cleanliness checks |
//! | `allow-incorrect-sha512-commits`  | commits exempt from digest checks     |
//! | `trusted-keys`                    | authorized primary-key fingerprints   |
//!
//! Lists are newline delimited. Blank lines and `#` comments are skipped.
//! Every file is required; an empty list file is an empty set. Membership
//! is exact id match.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::git::{CommitId, ObjectId};
use crate::gpg_status::is_fingerprint;

/// File naming the signed root.
pub const SIGNED_ROOT_FILE: &str = "trusted-git-root";
/// File naming the digest root.
pub const DIGEST_ROOT_FILE: &str = "trusted-sha512-root-commit";
/// Commits whose signatures may use revoked or expired keys.
pub const ALLOW_REVSIG_FILE: &str = "allow-revsig-commits";
/// Merge commits exempt from the cleanliness check.
pub const ALLOW_UNCLEAN_MERGE_FILE: &str = "allow-unclean-merge-commits";
/// Commits exempt from the tree digest check.
pub const ALLOW_INCORRECT_DIGEST_FILE: &str = "allow-incorrect-sha512-commits";
/// Authorized signing key fingerprints.
pub const TRUSTED_KEYS_FILE: &str = "trusted-keys";

/// Maximum size of any single trust file (4 MiB).
const MAX_TRUST_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Errors loading trust material.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrustConfigError {
    /// A required file is absent.
    #[error("required trust file is missing: {}", path.display())]
    Missing {
        /// Expected location.
        path: PathBuf,
    },

    /// A file could not be read.
    #[error("failed to read trust file {}: {source}", path.display())]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A file exceeds the size bound.
    #[error("trust file {} too large: {size} > {max}", path.display())]
    TooLarge {
        /// File being read.
        path: PathBuf,
        /// Actual size.
        size: u64,
        /// Maximum allowed.
        max: u64,
    },

    /// A root file has no identifier on its first line.
    #[error("trust root file {} is empty", path.display())]
    EmptyRoot {
        /// File being read.
        path: PathBuf,
    },

    /// An entry is not a commit id or key fingerprint.
    #[error("invalid entry `{value}` at {}:{line}", path.display())]
    InvalidEntry {
        /// File being read.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// The offending text.
        value: String,
    },
}

/// The two distinguished commits bounding the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustRoots {
    /// Walk ends successfully here.
    pub signed_root: CommitId,
    /// Digest checks and legacy-signature restrictions end here.
    pub digest_root: CommitId,
}

/// Exemption sets, each disabling one check for listed commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllowLists {
    /// Signature by a revoked or expired key is tolerated.
    pub revsig: BTreeSet<CommitId>,
    /// Merge cleanliness is not checked.
    pub unclean_merge: BTreeSet<CommitId>,
    /// Tree digest is not checked.
    pub incorrect_digest: BTreeSet<CommitId>,
}

/// Everything loaded from a trust directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustStore {
    /// Directory the material was loaded from.
    pub source_dir: PathBuf,
    /// Signed and digest roots.
    pub roots: TrustRoots,
    /// Per-check exemptions.
    pub allow_lists: AllowLists,
    /// Uppercase primary-key fingerprints.
    pub trusted_keys: BTreeSet<String>,
}

impl TrustStore {
    /// Loads all trust material from `dir`.
    pub fn load(dir: &Path) -> Result<Self, TrustConfigError> {
        let roots = TrustRoots {
            signed_root: read_root(&dir.join(SIGNED_ROOT_FILE))?,
            digest_root: read_root(&dir.join(DIGEST_ROOT_FILE))?,
        };
        let allow_lists = AllowLists {
            revsig: read_commit_list(&dir.join(ALLOW_REVSIG_FILE))?,
            unclean_merge: read_commit_list(&dir.join(ALLOW_UNCLEAN_MERGE_FILE))?,
            incorrect_digest: read_commit_list(&dir.join(ALLOW_INCORRECT_DIGEST_FILE))?,
        };
        let trusted_keys = read_key_list(&dir.join(TRUSTED_KEYS_FILE))?;

        tracing::debug!(
            dir = %dir.display(),
            signed_root = %roots.signed_root,
            digest_root = %roots.digest_root,
            revsig = allow_lists.revsig.len(),
            unclean_merge = allow_lists.unclean_merge.len(),
            incorrect_digest = allow_lists.incorrect_digest.len(),
            trusted_keys = trusted_keys.len(),
            "loaded trust material"
        );

        Ok(Self {
            source_dir: dir.to_path_buf(),
            roots,
            allow_lists,
            trusted_keys,
        })
    }
}

fn read_bounded(path: &Path) -> Result<String, TrustConfigError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TrustConfigError::Missing {
                path: path.to_path_buf(),
            });
        },
        Err(source) => {
            return Err(TrustConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        },
    };
    if metadata.len() > MAX_TRUST_FILE_SIZE {
        return Err(TrustConfigError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max: MAX_TRUST_FILE_SIZE,
        });
    }
    std::fs::read_to_string(path).map_err(|source| TrustConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Yields `(line_number, trimmed_entry)` for non-blank, non-comment lines.
fn entries(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn read_root(path: &Path) -> Result<CommitId, TrustConfigError> {
    let content = read_bounded(path)?;
    let first = content.lines().next().map(str::trim).unwrap_or_default();
    if first.is_empty() {
        return Err(TrustConfigError::EmptyRoot {
            path: path.to_path_buf(),
        });
    }
    ObjectId::parse(first).map_err(|_| TrustConfigError::InvalidEntry {
        path: path.to_path_buf(),
        line: 1,
        value: first.to_string(),
    })
}

fn read_commit_list(path: &Path) -> Result<BTreeSet<CommitId>, TrustConfigError> {
    let content = read_bounded(path)?;
    entries(&content)
        .map(|(line, value)| {
            ObjectId::parse(value).map_err(|_| TrustConfigError::InvalidEntry {
                path: path.to_path_buf(),
                line,
                value: value.to_string(),
            })
        })
        .collect()
}

fn read_key_list(path: &Path) -> Result<BTreeSet<String>, TrustConfigError> {
    let content = read_bounded(path)?;
    entries(&content)
        .map(|(line, value)| {
            if is_fingerprint(value) {
                Ok(value.to_ascii_uppercase())
            } else {
                Err(TrustConfigError::InvalidEntry {
                    path: path.to_path_buf(),
                    line,
                    value: value.to_string(),
                })
            }
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const ROOT_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ROOT_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const KEY: &str = "0123456789abcdef0123456789abcdef01234567";

    fn write_complete_dir(dir: &Path) {
        fs::write(dir.join(SIGNED_ROOT_FILE), format!("{ROOT_A}\nignored\n")).expect("write");
        fs::write(dir.join(DIGEST_ROOT_FILE), format!("{ROOT_B}\n")).expect("write");
        fs::write(
            dir.join(ALLOW_REVSIG_FILE),
            format!("# revoked key, see audit log\n{ROOT_A}\n\n"),
        )
        .expect("write");
        fs::write(dir.join(ALLOW_UNCLEAN_MERGE_FILE), "").expect("write");
        fs::write(
            dir.join(ALLOW_INCORRECT_DIGEST_FILE),
            format!("  {ROOT_B}  \n{ROOT_A}\n"),
        )
        .expect("write");
        fs::write(dir.join(TRUSTED_KEYS_FILE), format!("{KEY}\n")).expect("write");
    }

    #[test]
    fn loads_complete_trust_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_complete_dir(temp.path());

        let store = TrustStore::load(temp.path()).expect("load");
        assert_eq!(store.roots.signed_root.as_str(), ROOT_A);
        assert_eq!(store.roots.digest_root.as_str(), ROOT_B);
        assert_eq!(store.allow_lists.revsig.len(), 1);
        assert!(store.allow_lists.unclean_merge.is_empty());
        assert_eq!(store.allow_lists.incorrect_digest.len(), 2);
        assert!(store.trusted_keys.contains(&KEY.to_ascii_uppercase()));
    }

    #[test]
    fn missing_file_is_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_complete_dir(temp.path());
        fs::remove_file(temp.path().join(ALLOW_UNCLEAN_MERGE_FILE)).expect("remove");

        let err = TrustStore::load(temp.path()).expect_err("must fail");
        match err {
            TrustConfigError::Missing { path } => {
                assert!(path.ends_with(ALLOW_UNCLEAN_MERGE_FILE));
            },
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn empty_root_file_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_complete_dir(temp.path());
        fs::write(temp.path().join(SIGNED_ROOT_FILE), "\n").expect("write");

        assert!(matches!(
            TrustStore::load(temp.path()),
            Err(TrustConfigError::EmptyRoot { .. })
        ));
    }

    #[test]
    fn invalid_list_entry_reports_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_complete_dir(temp.path());
        fs::write(
            temp.path().join(ALLOW_REVSIG_FILE),
            format!("{ROOT_A}\nnot-a-commit\n"),
        )
        .expect("write");

        match TrustStore::load(temp.path()) {
            Err(TrustConfigError::InvalidEntry { line, value, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(value, "not-a-commit");
            },
            other => panic!("expected InvalidEntry, got {other:?}"),
        }
    }

    #[test]
    fn invalid_key_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_complete_dir(temp.path());
        fs::write(temp.path().join(TRUSTED_KEYS_FILE), "DEADBEEF\n").expect("write");

        assert!(matches!(
            TrustStore::load(temp.path()),
            Err(TrustConfigError::InvalidEntry { .. })
        ));
    }
}
