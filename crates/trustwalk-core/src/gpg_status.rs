//! Evaluation of GnuPG machine-readable status output.
//!
//! `git verify-commit --raw` forwards the `[GNUPG:]` status lines produced by
//! the signing backend. This module decides, from those lines alone, whether
//! a commit signature is acceptable under a [`SignatureContext`]:
//!
//! - a `VALIDSIG` line must name a primary key listed in the trusted keys;
//! - `BADSIG` and `ERRSIG` are always fatal;
//! - `REVKEYSIG` / `EXPKEYSIG` are accepted only when the context allows
//!   revoked keys, and otherwise a `GOODSIG` is required;
//! - SHA-1 signature digests (OpenPGP hash algorithm 2) are accepted only
//!   when the context allows SHA-1.

use crate::git::SignatureContext;
use crate::signature::SignatureVerdict;

/// Prefix of every GnuPG status line.
const STATUS_PREFIX: &str = "[GNUPG:] ";

/// OpenPGP hash algorithm id for SHA-1 (RFC 4880 §9.4).
pub const HASH_ALGO_SHA1: u8 = 2;

/// A `VALIDSIG` status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidSignature {
    /// Fingerprint of the (sub)key that made the signature.
    pub signing_fingerprint: String,
    /// Fingerprint of the primary key. Equal to the signing key when the
    /// status line omits it.
    pub primary_fingerprint: String,
    /// OpenPGP hash algorithm id used by the signature.
    pub hash_algo: u8,
}

/// Facts extracted from a block of status output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Every well-formed `VALIDSIG` record, in output order.
    pub valid_signatures: Vec<ValidSignature>,
    /// A `GOODSIG` line was seen.
    pub good: bool,
    /// A `REVKEYSIG` or `EXPKEYSIG` line was seen.
    pub revoked_or_expired: bool,
    /// A `BADSIG` line was seen.
    pub bad: bool,
    /// An `ERRSIG` line was seen.
    pub errored: bool,
}

/// Parses status lines, ignoring anything that is not a `[GNUPG:]` record.
pub fn parse_status(raw: &str) -> StatusReport {
    let mut report = StatusReport::default();
    for line in raw.lines() {
        let Some(record) = line.trim_end().strip_prefix(STATUS_PREFIX) else {
            continue;
        };
        let mut fields = record.split(' ');
        match fields.next() {
            Some("GOODSIG") => report.good = true,
            Some("REVKEYSIG" | "EXPKEYSIG") => report.revoked_or_expired = true,
            Some("BADSIG") => report.bad = true,
            Some("ERRSIG") => report.errored = true,
            Some("VALIDSIG") => {
                let rest: Vec<&str> = fields.collect();
                if let Some(valid) = parse_validsig(&rest) {
                    report.valid_signatures.push(valid);
                }
            },
            _ => {},
        }
    }
    report
}

/// `VALIDSIG <fpr> <date> <ts> <expire> <ver> <reserved> <pk-algo>
/// <hash-algo> <class> [<primary-fpr>]`
fn parse_validsig(fields: &[&str]) -> Option<ValidSignature> {
    let signing = fields.first().filter(|f| is_fingerprint(f))?;
    let hash_algo = fields.get(7)?.parse::<u8>().ok()?;
    let primary = fields
        .get(9)
        .filter(|f| is_fingerprint(f))
        .unwrap_or(signing);
    Some(ValidSignature {
        signing_fingerprint: signing.to_ascii_uppercase(),
        primary_fingerprint: primary.to_ascii_uppercase(),
        hash_algo,
    })
}

/// Whether `value` looks like a v4 (40 hex) or v5 (64 hex) key fingerprint.
pub fn is_fingerprint(value: &str) -> bool {
    matches!(value.len(), 40 | 64) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Applies signature policy to parsed status output.
///
/// `backend_accepted` is whether `git verify-commit` itself exited
/// successfully. git rejects revoked-key signatures on its own, so a
/// revoked-key signature allowed by the context is accepted even when git
/// reported failure.
pub fn evaluate(
    report: &StatusReport,
    backend_accepted: bool,
    context: SignatureContext<'_>,
) -> SignatureVerdict {
    if report.bad {
        return SignatureVerdict::untrusted("bad signature");
    }
    if report.errored {
        return SignatureVerdict::untrusted("signature could not be checked");
    }
    if report.valid_signatures.is_empty() {
        return SignatureVerdict::untrusted("no valid signature");
    }

    let revoked_allowed = report.revoked_or_expired && context.allow_revoked;
    if report.revoked_or_expired && !context.allow_revoked {
        return SignatureVerdict::untrusted("signed with a revoked or expired key");
    }
    if !report.good && !revoked_allowed {
        return SignatureVerdict::untrusted("no good signature");
    }
    if !backend_accepted && !revoked_allowed {
        return SignatureVerdict::untrusted("git verify-commit rejected the signature");
    }

    let mut last_reason = String::new();
    for valid in &report.valid_signatures {
        if !context.trusted_keys.contains(&valid.primary_fingerprint) {
            last_reason = format!("key {} is not trusted", valid.primary_fingerprint);
            continue;
        }
        if valid.hash_algo == HASH_ALGO_SHA1 && !context.allow_sha1 {
            last_reason = format!(
                "key {} signed with a SHA-1 digest",
                valid.primary_fingerprint
            );
            continue;
        }
        return SignatureVerdict::Trusted {
            fingerprint: valid.primary_fingerprint.clone(),
        };
    }
    SignatureVerdict::Untrusted {
        reason: last_reason,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    const SUBKEY: &str = "1111111111111111111111111111111111111111";
    const PRIMARY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    fn validsig(hash_algo: u8) -> String {
        format!(
            "[GNUPG:] VALIDSIG {SUBKEY} 2024-01-02 1704153600 0 4 0 1 {hash_algo} 00 {PRIMARY}"
        )
    }

    fn good_output(hash_algo: u8) -> String {
        format!(
            "[GNUPG:] NEWSIG\n[GNUPG:] GOODSIG 1111111111111111 Alice <alice@example.org>\n{}\n[GNUPG:] TRUST_UNDEFINED 0 pgp\n",
            validsig(hash_algo)
        )
    }

    fn trusted() -> BTreeSet<String> {
        BTreeSet::from([PRIMARY.to_string()])
    }

    fn context(keys: &BTreeSet<String>, allow_sha1: bool, allow_revoked: bool) -> SignatureContext<'_> {
        SignatureContext {
            allow_sha1,
            allow_revoked,
            trusted_keys: keys,
        }
    }

    #[test]
    fn parses_validsig_with_primary_fingerprint() {
        let report = parse_status(&good_output(10));
        assert!(report.good);
        assert_eq!(report.valid_signatures.len(), 1);
        let valid = &report.valid_signatures[0];
        assert_eq!(valid.signing_fingerprint, SUBKEY);
        assert_eq!(valid.primary_fingerprint, PRIMARY);
        assert_eq!(valid.hash_algo, 10);
    }

    #[test]
    fn primary_defaults_to_signing_key_when_absent() {
        let report = parse_status(&format!(
            "[GNUPG:] VALIDSIG {PRIMARY} 2024-01-02 1704153600 0 4 0 1 8 00"
        ));
        assert_eq!(report.valid_signatures[0].primary_fingerprint, PRIMARY);
    }

    #[test]
    fn ignores_human_readable_noise() {
        let report = parse_status("gpg: Signature made Tue Jan  2\ngpg: Good signature\n");
        assert_eq!(report, StatusReport::default());
    }

    #[test]
    fn trusted_key_with_modern_digest_is_trusted() {
        let keys = trusted();
        let verdict = evaluate(&parse_status(&good_output(10)), true, context(&keys, false, false));
        assert_eq!(
            verdict,
            SignatureVerdict::Trusted {
                fingerprint: PRIMARY.to_string()
            }
        );
    }

    #[test]
    fn untrusted_key_is_rejected() {
        let keys = BTreeSet::from(["B".repeat(40)]);
        let verdict = evaluate(&parse_status(&good_output(10)), true, context(&keys, true, true));
        assert!(!verdict.is_trusted());
    }

    #[test]
    fn sha1_digest_requires_allowance() {
        let keys = trusted();
        let report = parse_status(&good_output(HASH_ALGO_SHA1));
        assert!(!evaluate(&report, true, context(&keys, false, false)).is_trusted());
        assert!(evaluate(&report, true, context(&keys, true, false)).is_trusted());
    }

    #[test]
    fn revoked_key_requires_allowance_even_if_git_fails() {
        let keys = trusted();
        let output = format!(
            "[GNUPG:] REVKEYSIG 1111111111111111 Alice <alice@example.org>\n{}\n",
            validsig(10)
        );
        let report = parse_status(&output);
        assert!(!evaluate(&report, false, context(&keys, false, false)).is_trusted());
        assert!(evaluate(&report, false, context(&keys, false, true)).is_trusted());
    }

    #[test]
    fn bad_and_error_signatures_are_never_trusted() {
        let keys = trusted();
        for marker in ["BADSIG 1111111111111111 Mallory", "ERRSIG 1111111111111111 1 10 00 0 9"] {
            let output = format!("{}\n[GNUPG:] {marker}\n", good_output(10));
            let verdict = evaluate(&parse_status(&output), true, context(&keys, true, true));
            assert!(!verdict.is_trusted(), "{marker} must not be trusted");
        }
    }

    #[test]
    fn git_rejection_without_revocation_is_untrusted() {
        let keys = trusted();
        let verdict = evaluate(&parse_status(&good_output(10)), false, context(&keys, true, true));
        assert!(!verdict.is_trusted());
    }

    #[test]
    fn unsigned_commit_has_no_valid_signature() {
        let keys = trusted();
        let verdict = evaluate(&parse_status(""), false, context(&keys, true, true));
        assert_eq!(verdict, SignatureVerdict::untrusted("no valid signature"));
    }
}
