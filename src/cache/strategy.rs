use sha2::{Digest, Sha256};

/// Well-known namespaces used by the engine
pub mod namespaces {
    /// Deep classifier verdicts, keyed by feature hash
    pub const DEEP_VERDICTS: &str = "deep_verdicts";
}

/// Hex SHA-256 over length-prefixed parts, so ("ab", "c") and ("a", "bc") differ
pub fn content_hash<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
