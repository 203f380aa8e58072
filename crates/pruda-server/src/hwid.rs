//! Hardware identifier handling.
//!
//! An HWID is an opaque, case-sensitive string; the server never interprets
//! it beyond trimming surrounding whitespace and comparing byte-equal.

use sha2::{Digest, Sha256};

/// Longest HWID the server will store.
pub const MAX_HWID_LEN: usize = 128;

/// Outcome of comparing a presented HWID against the bound one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwidCheck {
    /// Byte-equal after trimming.
    Match,
    /// Different device, but the policy admits it; the stored HWID stays.
    Compatible,
    Mismatch,
}

/// Trims surrounding whitespace. Case is preserved.
pub fn normalize(raw: &str) -> &str {
    raw.trim()
}

/// Applies the binding policy to a presented HWID.
///
/// A mismatch under `strict` always fails. A lenient mismatch is admitted
/// only when multiple devices are allowed, and never rebinds the stored
/// HWID.
pub fn check(stored: &str, presented: &str, strict: bool, allow_multiple: bool) -> HwidCheck {
    if normalize(stored) == normalize(presented) {
        return HwidCheck::Match;
    }
    if !strict && allow_multiple {
        HwidCheck::Compatible
    } else {
        HwidCheck::Mismatch
    }
}

/// Reference client fingerprint derivation, kept here for test vectors.
///
/// SHA-256 over `screen|tz|lang|platform|userAgent`, first 8 hex chars,
/// uppercased and grouped by 2 (e.g. `A3-7F-10-22`). Production clients are
/// free to derive HWIDs however they like; the server treats them as opaque.
pub fn derive_fingerprint(
    screen: &str,
    timezone: &str,
    language: &str,
    platform: &str,
    user_agent: &str,
) -> String {
    let raw = [screen, timezone, language, platform, user_agent].join("|");
    let digest = Sha256::digest(raw.as_bytes());
    let hex8 = hex::encode(&digest[..4]).to_uppercase();

    let chars: Vec<char> = hex8.chars().collect();
    chars
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
