use serde::{Deserialize, Serialize};

/// Token-bounded segment of a document, the unit of extraction and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub id: String,
    pub content: String,
    pub tokens: usize,
    pub chunk_order_index: usize,
    pub full_doc_id: String,
    pub file_path: String,
}

impl TextChunk {
    pub fn new(
        full_doc_id: String,
        content: String,
        tokens: usize,
        chunk_order_index: usize,
        file_path: String,
    ) -> Self {
        Self {
            id: crate::utils::hashing::chunk_id(&full_doc_id, &content),
            content,
            tokens,
            chunk_order_index,
            full_doc_id,
            file_path,
        }
    }
}
