//! Deterministic, length-bounded resource names.

use sha2::{Digest, Sha256};

/// Maximum length of a DNS-1123 label (Service, and anything used as a label value).
pub const DNS1123_LABEL_MAX: usize = 63;
/// Maximum length of a DNS-1123 subdomain (most other object names).
pub const DNS1123_SUBDOMAIN_MAX: usize = 253;

const HASH_LEN: usize = 8;

pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Derive `<prefix>-<readable part>-<hash>` from a logical name.
///
/// The hash covers the raw logical name, so two names that sanitize to the
/// same readable part still differ. The readable part is truncated so the
/// whole name fits in `max_len`; if not even the prefix and hash fit, the
/// readable part is dropped and the result is cut to `max_len`.
pub fn hashed_name(prefix: &str, logical_name: &str, max_len: usize) -> String {
    let hash = sha256_hex(logical_name.as_bytes());
    let hash = &hash[..HASH_LEN];

    let readable = sanitize(logical_name);
    let fixed = prefix.len() + 1 + HASH_LEN + 1;
    let budget = max_len.saturating_sub(fixed);
    let readable = truncate_label(&readable, budget);

    let mut out = if readable.is_empty() {
        format!("{prefix}-{hash}")
    } else {
        format!("{prefix}-{readable}-{hash}")
    };
    out.truncate(max_len);
    out
}

/// Lowercase and replace anything outside `[a-z0-9-]` with `-`, collapsing runs.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}

fn truncate_label(s: &str, max: usize) -> &str {
    // sanitized names are ASCII, byte slicing is safe
    let cut = if s.len() > max { &s[..max] } else { s };
    cut.trim_end_matches('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn same_input_same_name() {
        let a = hashed_name("tollgate", "default/eg", DNS1123_LABEL_MAX);
        let b = hashed_name("tollgate", "default/eg", DNS1123_LABEL_MAX);
        assert_eq!(a, b);
        assert!(a.starts_with("tollgate-default-eg-"), "{a}");
        assert_eq!(a.len(), "tollgate-default-eg-".len() + HASH_LEN);
    }

    #[test]
    fn long_names_are_bounded() {
        let long = format!("{}/{}", "n".repeat(120), "g".repeat(200));
        for max in [20, DNS1123_LABEL_MAX, DNS1123_SUBDOMAIN_MAX] {
            let n = hashed_name("tollgate", &long, max);
            assert!(n.len() <= max, "len {} > {}", n.len(), max);
            assert!(!n.contains("--"), "{n}");
            assert!(!n.ends_with('-'));
        }
    }

    #[test]
    fn sanitized_collisions_are_split_by_hash() {
        let a = hashed_name("tollgate", "default/eg", DNS1123_LABEL_MAX);
        let b = hashed_name("tollgate", "default-eg", DNS1123_LABEL_MAX);
        let c = hashed_name("tollgate", "Default/EG", DNS1123_LABEL_MAX);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn no_collisions_in_large_sample() {
        let mut seen = HashSet::new();
        for ns in 0..100 {
            for gw in 0..100 {
                let n = hashed_name("tollgate", &format!("namespace-{ns}/gateway-{gw}"), DNS1123_LABEL_MAX);
                assert!(seen.insert(n), "collision at {ns}/{gw}");
            }
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn tiny_budget_still_yields_valid_prefix_hash() {
        let n = hashed_name("tollgate", "default/eg", 17);
        assert_eq!(n.len(), 17);
        assert!(n.starts_with("tollgate-"));
    }
}
