use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn sha256_hex(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Content-addressed identifier, e.g. `doc-<sha256>`.
pub fn compute_id(prefix: &str, content: &str) -> String {
    format!("{prefix}{}", sha256_hex(content))
}

pub fn document_id(text: &str) -> String {
    compute_id("doc-", text.trim())
}

pub fn chunk_id(document_id: &str, content: &str) -> String {
    compute_id("chunk-", &format!("{document_id}:{content}"))
}

/// Identity of an entity: trimmed, whitespace-collapsed, case-folded name.
pub fn entity_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical (lexicographically ordered) endpoint pair of a relation.
pub fn relation_pair(a: &str, b: &str) -> (String, String) {
    let (a, b) = (entity_key(a), entity_key(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub fn entity_vector_id(name: &str) -> String {
    compute_id("ent-", &entity_key(name))
}

pub fn relation_vector_id(a: &str, b: &str) -> String {
    let (src, tgt) = relation_pair(a, b);
    compute_id("rel-", &format!("{src}\u{1f}{tgt}"))
}

/// Track id grouping the documents of one enqueue call.
pub fn generate_track_id(prefix: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{prefix}_{timestamp}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_ignore_surrounding_whitespace() {
        assert_eq!(document_id("  Acme uses Widget.\n"), document_id("Acme uses Widget."));
        assert!(document_id("x").starts_with("doc-"));
    }

    #[test]
    fn chunk_ids_are_scoped_to_their_document() {
        assert_ne!(chunk_id("doc-a", "same text"), chunk_id("doc-b", "same text"));
    }

    #[test]
    fn relation_keys_are_order_independent() {
        assert_eq!(relation_pair("Alice", "ACME"), relation_pair("acme", " alice "));
        assert_eq!(relation_vector_id("Acme", "Alice"), relation_vector_id("alice", "acme"));
        assert_eq!(entity_key("  Big   Corp "), "big corp");
    }

    #[test]
    fn track_ids_carry_prefix_and_timestamp() {
        let id = generate_track_id("insert");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "insert");
        assert_eq!(parts[3].len(), 8);
    }
}
