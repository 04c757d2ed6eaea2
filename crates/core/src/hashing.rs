//! Content fingerprints for compiled pipeline graphs.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Fingerprint of a JSON document.
///
/// `serde_json` keeps object keys sorted, so two documents that differ
/// only in key insertion order hash the same.
pub fn json_fingerprint(value: &serde_json::Value) -> String {
    sha256_hex(value.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn digest_is_lowercase_hex() {
        let digest = sha256_hex(b"");
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let mut a = serde_json::Map::new();
        a.insert("seed".into(), json!(7));
        a.insert("cfg".into(), json!(6.5));
        let mut b = serde_json::Map::new();
        b.insert("cfg".into(), json!(6.5));
        b.insert("seed".into(), json!(7));

        assert_eq!(json_fingerprint(&a.into()), json_fingerprint(&b.into()));
    }

    #[test]
    fn any_value_change_changes_fingerprint() {
        let base = json!({"5": {"inputs": {"seed": 7}}});
        let reseeded = json!({"5": {"inputs": {"seed": 8}}});
        assert_ne!(json_fingerprint(&base), json_fingerprint(&reseeded));
    }
}
