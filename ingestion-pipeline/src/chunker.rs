use std::collections::VecDeque;

use common::{
    error::AppError,
    utils::tokenizer::{decode_window, tokenizer},
};
use tiktoken_rs::{CoreBPE, Rank};

/// A chunk before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub content: String,
    pub tokens: usize,
    pub index: usize,
}

/// Splits text into overlapping windows of at most `max_tokens` tokens.
#[derive(Debug, Clone)]
pub struct TokenChunker {
    max_tokens: usize,
    overlap_tokens: usize,
    split_by_character: Option<String>,
    split_by_character_only: bool,
}

impl TokenChunker {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self, AppError> {
        if max_tokens == 0 {
            return Err(AppError::Validation(
                "chunk token size must be positive".into(),
            ));
        }
        if overlap_tokens >= max_tokens {
            return Err(AppError::Validation(format!(
                "chunk overlap ({overlap_tokens}) must be smaller than chunk size ({max_tokens})"
            )));
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
            split_by_character: None,
            split_by_character_only: false,
        })
    }

    /// Splits on `separator` first. Oversized pieces are token-windowed
    /// unless `only` is set, in which case they are rejected.
    pub fn with_split_character(mut self, separator: Option<String>, only: bool) -> Self {
        self.split_by_character = separator.filter(|s| !s.is_empty());
        self.split_by_character_only = only;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    pub fn chunks(&self, text: &str) -> Result<ChunkIter, AppError> {
        let bpe = tokenizer()?;
        let Some(separator) = &self.split_by_character else {
            return Ok(ChunkIter::windows(
                bpe,
                bpe.encode_ordinary(text),
                self.max_tokens,
                self.overlap_tokens,
            ));
        };

        let mut pieces = VecDeque::new();
        for segment in text.split(separator.as_str()) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let tokens = bpe.encode_ordinary(segment);
            if tokens.len() <= self.max_tokens {
                pieces.push_back((segment.to_string(), tokens.len()));
                continue;
            }
            if self.split_by_character_only {
                return Err(AppError::Validation(format!(
                    "segment of {} tokens exceeds chunk size {} and character-only splitting is set",
                    tokens.len(),
                    self.max_tokens
                )));
            }
            for span in ChunkIter::windows(bpe, tokens, self.max_tokens, self.overlap_tokens) {
                pieces.push_back((span.content, span.tokens));
            }
        }
        Ok(ChunkIter::pieces(pieces))
    }
}

enum Source {
    Windows {
        bpe: &'static CoreBPE,
        tokens: Vec<Rank>,
        start: usize,
        max_tokens: usize,
        step: usize,
        finished: bool,
    },
    Pieces(VecDeque<(String, usize)>),
}

/// Finite, single-pass sequence of chunks in document order.
pub struct ChunkIter {
    source: Source,
    index: usize,
}

impl ChunkIter {
    fn windows(bpe: &'static CoreBPE, tokens: Vec<Rank>, max_tokens: usize, overlap: usize) -> Self {
        Self {
            source: Source::Windows {
                finished: tokens.is_empty(),
                bpe,
                tokens,
                start: 0,
                max_tokens,
                step: max_tokens - overlap,
            },
            index: 0,
        }
    }

    fn pieces(pieces: VecDeque<(String, usize)>) -> Self {
        Self {
            source: Source::Pieces(pieces),
            index: 0,
        }
    }

    fn next_raw(&mut self) -> Option<(String, usize)> {
        match &mut self.source {
            Source::Pieces(pieces) => pieces.pop_front(),
            Source::Windows {
                bpe,
                tokens,
                start,
                max_tokens,
                step,
                finished,
            } => {
                if *finished {
                    return None;
                }
                let end = (*start + *max_tokens).min(tokens.len());
                let window = tokens.get(*start..end)?;
                let content = decode_window(*bpe, window);
                let count = window.len();
                if end >= tokens.len() {
                    *finished = true;
                } else {
                    *start += *step;
                }
                Some((content, count))
            }
        }
    }
}

impl Iterator for ChunkIter {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (content, tokens) = self.next_raw()?;
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            let span = ChunkSpan {
                content: content.to_string(),
                tokens,
                index: self.index,
            };
            self.index += 1;
            return Some(span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {i} talks about Acme and Widget."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            TokenChunker::new(100, 100),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(TokenChunker::new(0, 0), Err(AppError::Validation(_))));
    }

    #[test]
    fn windows_cover_the_document_with_overlap() {
        let text = sample_text(60);
        let bpe = tokenizer().expect("tokenizer");
        let total = bpe.encode_ordinary(&text).len();
        let chunker = TokenChunker::new(64, 16).expect("chunker");

        let chunks: Vec<ChunkSpan> = chunker.chunks(&text).expect("chunks").collect();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.tokens <= 64));
        let expected = (total - 16).div_ceil(48);
        assert_eq!(chunks.len(), expected);
        for (position, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, position);
        }
        let first = chunks.first().expect("first");
        let last = chunks.last().expect("last");
        assert!(text.starts_with(&first.content[..10]));
        assert!(text.trim_end().ends_with(last.content.trim_end()));
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunker = TokenChunker::new(1200, 100).expect("chunker");
        let chunks: Vec<ChunkSpan> = chunker
            .chunks("Alice is CEO of Acme.")
            .expect("chunks")
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Alice is CEO of Acme.");
    }

    #[test]
    fn empty_text_yields_nothing() {
        let chunker = TokenChunker::new(10, 2).expect("chunker");
        assert_eq!(chunker.chunks("").expect("chunks").count(), 0);
    }

    #[test]
    fn splits_on_separator_before_windowing() {
        let chunker = TokenChunker::new(1200, 100)
            .expect("chunker")
            .with_split_character(Some("\n\n".into()), false);
        let chunks: Vec<ChunkSpan> = chunker
            .chunks("First part.\n\nSecond part.\n\n\n\nThird part.")
            .expect("chunks")
            .collect();
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["First part.", "Second part.", "Third part."]);
    }

    #[test]
    fn character_only_split_rejects_oversized_segments() {
        let chunker = TokenChunker::new(8, 2)
            .expect("chunker")
            .with_split_character(Some("|".into()), true);
        let result = chunker.chunks(&sample_text(4));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
