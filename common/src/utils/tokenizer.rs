use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, Rank};

use crate::error::AppError;

static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

/// Shared `o200k_base` encoder. Chunk boundaries and every token budget are
/// measured with it, so the same text always yields the same counts.
pub fn tokenizer() -> Result<&'static CoreBPE, AppError> {
    if let Some(bpe) = TOKENIZER.get() {
        return Ok(bpe);
    }
    let bpe = tiktoken_rs::o200k_base()
        .map_err(|err| AppError::InternalError(format!("loading tokenizer: {err}")))?;
    Ok(TOKENIZER.get_or_init(|| bpe))
}

pub fn count_tokens(text: &str) -> Result<usize, AppError> {
    Ok(tokenizer()?.encode_ordinary(text).len())
}

/// Decodes a window of tokens. Windows cut by token count can split a
/// multi-byte character, so the window is narrowed one token at a time from
/// either edge until it decodes.
pub fn decode_window(bpe: &CoreBPE, tokens: &[Rank]) -> String {
    const MAX_TRIM: usize = 4;
    for trim_end in 0..=MAX_TRIM {
        for trim_start in 0..=MAX_TRIM {
            let end = tokens.len().saturating_sub(trim_end);
            if trim_start >= end {
                continue;
            }
            if let Some(slice) = tokens.get(trim_start..end) {
                if let Ok(text) = bpe.decode(slice.to_vec()) {
                    return text;
                }
            }
        }
    }
    String::new()
}
