pub mod config;
pub mod embedding;
pub mod hashing;
pub mod limiter;
pub mod llm;
pub mod locks;
pub mod retry;
pub mod tokenizer;
