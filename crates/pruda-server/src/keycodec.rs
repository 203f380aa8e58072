//! License key formatting, validation, and generation.
//!
//! A canonical key is `{PREFIX}-{G1}-{G2}-…-{Gk}`: the configured prefix
//! followed by `length` random characters from the 36-symbol alphabet
//! `A–Z0–9`, split into 4-character groups. The defaults render keys like
//! `PRUDA-XXXX-XXXX-XXXX-XXXX`.

use rand::rngs::OsRng;
use rand::RngCore;

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Group size for the random body.
const GROUP: usize = 4;

/// Random-body lengths the settings layer accepts.
pub const SUPPORTED_LENGTHS: &[usize] = &[12, 16, 20, 24];

/// How many times a colliding key is regenerated before giving up.
pub const MAX_GENERATE_ATTEMPTS: usize = 8;

/// Key format policy: prefix plus total random-body length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    pub prefix: String,
    pub length: usize,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            prefix: "PRUDA".to_owned(),
            length: 16,
        }
    }
}

/// Draws a fresh key under the policy using the OS RNG.
///
/// Bytes are mapped into the 36-symbol alphabet with rejection sampling
/// (bytes ≥ 252 are discarded) so no symbol is favored by modulo bias.
pub fn generate(policy: &KeyPolicy) -> String {
    let mut rng = OsRng;
    let mut body = String::with_capacity(policy.length);
    let mut buf = [0u8; 64];

    while body.len() < policy.length {
        rng.fill_bytes(&mut buf);
        for &b in buf.iter() {
            // 252 = 36 * 7: the largest multiple of 36 that fits in a byte.
            if b >= 252 {
                continue;
            }
            body.push(ALPHABET[(b % 36) as usize] as char);
            if body.len() == policy.length {
                break;
            }
        }
    }

    group(policy, &body)
}

/// Canonical form of user input: ASCII whitespace and hyphens stripped,
/// uppercased, and regrouped under the policy when the prefix matches.
/// Idempotent: canonicalizing a canonical key returns it unchanged.
pub fn canonicalize(policy: &KeyPolicy, input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match cleaned.strip_prefix(policy.prefix.as_str()) {
        Some(body) if !body.is_empty() => group(policy, body),
        _ => cleaned,
    }
}

/// Accepts exactly canonical keys: `^{PREFIX}(-[A-Z0-9]{4})+$` with a total
/// body length equal to the policy length.
pub fn validate(policy: &KeyPolicy, key: &str) -> bool {
    let Some(rest) = key.strip_prefix(policy.prefix.as_str()) else {
        return false;
    };

    // A canonical key continues with '-' right after the prefix, so the
    // first split element must be empty.
    let mut parts = rest.split('-');
    if parts.next() != Some("") {
        return false;
    }

    let mut body_len = 0;
    for chunk in parts {
        if chunk.len() != GROUP
            || !chunk
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return false;
        }
        body_len += chunk.len();
    }

    body_len == policy.length
}

fn group(policy: &KeyPolicy, body: &str) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = policy.prefix.clone();
    for chunk in chars.chunks(GROUP) {
        out.push('-');
        out.extend(chunk.iter());
    }
    out
}
