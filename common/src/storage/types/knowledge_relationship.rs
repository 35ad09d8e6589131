use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::hashing::relation_pair;

use super::knowledge_entity::DESCRIPTION_SEPARATOR;

/// Graph edge between two entity keys, stored under the canonical
/// (lexicographically ordered) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeRelationship {
    pub src_id: String,
    pub tgt_id: String,
    pub descriptions: Vec<String>,
    pub keywords: Vec<String>,
    pub weight: f32,
    pub source_ids: Vec<String>,
    pub file_path: String,
    pub provenance_doc_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeRelationship {
    pub fn new(a: &str, b: &str) -> Self {
        let (src_id, tgt_id) = relation_pair(a, b);
        let now = Utc::now();
        Self {
            src_id,
            tgt_id,
            descriptions: Vec::new(),
            keywords: Vec::new(),
            weight: 0.0,
            source_ids: Vec::new(),
            file_path: String::new(),
            provenance_doc_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pair(&self) -> (String, String) {
        (self.src_id.clone(), self.tgt_id.clone())
    }

    pub fn description(&self) -> String {
        self.descriptions.join(DESCRIPTION_SEPARATOR)
    }

    pub fn embedding_content(&self) -> String {
        format!(
            "{}\t{}\n{}\n{}",
            self.keywords.join(", "),
            self.src_id,
            self.tgt_id,
            self.descriptions.join("\n")
        )
    }
}
