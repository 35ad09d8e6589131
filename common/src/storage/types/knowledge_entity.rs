use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::hashing::entity_key;

pub const DESCRIPTION_SEPARATOR: &str = "<SEP>";

/// Graph node. `key` is the case-folded identity; `name` keeps the casing of
/// the first extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEntity {
    pub key: String,
    pub name: String,
    pub entity_type: String,
    /// Deduplicated evidence strings, or a single summary once condensed.
    pub descriptions: Vec<String>,
    /// Originating chunk ids, oldest first.
    pub source_ids: Vec<String>,
    pub file_path: String,
    /// Lowest document id among the evidence, used to pick `file_path`.
    pub provenance_doc_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntity {
    pub fn new(name: &str, entity_type: String) -> Self {
        let now = Utc::now();
        Self {
            key: entity_key(name),
            name: name.trim().to_string(),
            entity_type,
            descriptions: Vec::new(),
            source_ids: Vec::new(),
            file_path: String::new(),
            provenance_doc_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn description(&self) -> String {
        self.descriptions.join(DESCRIPTION_SEPARATOR)
    }

    /// Text embedded into the entity vector namespace.
    pub fn embedding_content(&self) -> String {
        format!("{}\n{}", self.name, self.descriptions.join("\n"))
    }
}
