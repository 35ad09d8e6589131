pub mod document;
pub mod knowledge_entity;
pub mod knowledge_relationship;
pub mod text_chunk;
