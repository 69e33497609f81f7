//! Diagnostic normalization, fingerprinting and similarity.
//!
//! Volatile details (numbers, hashes, temp paths split into segments) are
//! folded so that two failures differing only in line numbers or ids compare
//! as identical.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Normalize a diagnostic into a space-joined token string.
pub fn normalize(diagnostic: &str) -> String {
    tokens(diagnostic).join(" ")
}

/// Lowercased alphanumeric tokens with numbers and hex ids folded.
pub fn tokens(diagnostic: &str) -> Vec<String> {
    diagnostic
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| {
            let lower = t.to_lowercase();
            if lower.chars().all(|c| c.is_ascii_digit()) {
                "#".to_string()
            } else if lower.len() >= 7
                && lower.chars().all(|c| c.is_ascii_hexdigit())
                && lower.chars().any(|c| c.is_ascii_digit())
            {
                "<hex>".to_string()
            } else {
                lower
            }
        })
        .collect()
}

/// SHA-256 of the normalized diagnostic, hex encoded.
pub fn fingerprint(diagnostic: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(diagnostic).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Jaccard similarity of the two diagnostics' token sets.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a: HashSet<String> = tokens(a).into_iter().collect();
    let b: HashSet<String> = tokens(b).into_iter().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}
