//! Checksum calculation for migration scripts

use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of a forward script
///
/// Used to detect migrations whose script was edited after being applied.
/// Returns the lowercase hexadecimal digest.
#[must_use]
pub fn calculate_checksum(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether a stored checksum still matches the script
#[must_use]
pub fn checksum_matches(stored: &str, script: &str) -> bool {
    stored == calculate_checksum(script)
}
