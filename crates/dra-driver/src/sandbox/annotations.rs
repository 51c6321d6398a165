//! Claim UIDs referenced by a pod sandbox.
//!
//! There is no structured field carrying a pod's claim UIDs at sandbox
//! creation, so the values of DRA annotations are scanned for UID-shaped
//! tokens. Replace this once the runtime exposes the claims explicitly.

use std::collections::BTreeMap;
use std::collections::HashSet;

use uuid::Uuid;

/// Key prefix of the annotations the scan looks at.
pub const CLAIM_ANNOTATION_PREFIX: &str = "resource.kubernetes.io/";

const UUID_LEN: usize = 36;

/// Distinct UIDs found in DRA annotation values, in first-seen order.
pub fn claim_uids(annotations: &BTreeMap<String, String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut uids = Vec::new();
    for (key, value) in annotations {
        if !key.starts_with(CLAIM_ANNOTATION_PREFIX) {
            continue;
        }
        for uid in scan_uuids(value) {
            if seen.insert(uid) {
                uids.push(uid.to_string());
            }
        }
    }
    uids
}

/// Non-overlapping 8-4-4-4-12 hex tokens in `value`.
fn scan_uuids(value: &str) -> Vec<&str> {
    let bytes = value.as_bytes();
    let mut found = Vec::new();
    let mut start = 0;
    while start + UUID_LEN <= bytes.len() {
        if is_uuid(&bytes[start..start + UUID_LEN]) {
            // ASCII only, so the slice is on char boundaries.
            found.push(&value[start..start + UUID_LEN]);
            start += UUID_LEN;
        } else {
            start += 1;
        }
    }
    found
}

/// At this length only the hyphenated form parses.
fn is_uuid(candidate: &[u8]) -> bool {
    candidate.len() == UUID_LEN && Uuid::try_parse_ascii(candidate).is_ok()
}
