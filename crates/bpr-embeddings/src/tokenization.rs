//! Tokenizers feeding the encoder towers.
//!
//! A [`Tokenizer`] turns text (or title/text pairs) into id sequences capped
//! at a maximum length; [`TokenBatch`] pads those sequences into the `[B, L]`
//! tensors a tower consumes.
//!
//! Two implementations ship in tree:
//! - [`HfTokenizer`] wraps a HuggingFace `tokenizer.json`
//! - [`HashingTokenizer`] hashes whitespace-separated words into a fixed
//!   vocabulary with xxh64 and needs no files

use std::path::Path;

use candle_core::{Device, Tensor};
use xxhash_rust::xxh64::xxh64;

use crate::error::{EmbeddingError, EmbeddingResult};

/// Padding id. Padded positions also get a zero attention mask.
pub const PAD_TOKEN_ID: u32 = 0;
/// Sequence start marker used by [`HashingTokenizer`].
pub const CLS_TOKEN_ID: u32 = 1;
/// Segment end marker used by [`HashingTokenizer`].
pub const SEP_TOKEN_ID: u32 = 2;

const HASHING_SEED: u64 = 0x6270_725f_746f_6b;
const SPECIAL_TOKENS: u32 = 3;

/// One encoded sequence before padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedText {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedText {
    fn from_ids(ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; ids.len()];
        Self {
            ids,
            attention_mask,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Cap at `max_len` tokens, keeping the final token (the closing
    /// separator) in place.
    fn truncate_keep_last(&mut self, max_len: usize) {
        if self.ids.len() <= max_len || max_len == 0 {
            self.ids.truncate(max_len);
            self.attention_mask.truncate(max_len);
            return;
        }
        let last_id = self.ids[self.ids.len() - 1];
        let last_mask = self.attention_mask[self.attention_mask.len() - 1];
        self.ids.truncate(max_len - 1);
        self.attention_mask.truncate(max_len - 1);
        self.ids.push(last_id);
        self.attention_mask.push(last_mask);
    }
}

/// Padded token batch on a device.
///
/// `input_ids` is `[B, L]` u32, `attention_mask` is `[B, L]` f32 with 1.0 on
/// real tokens and 0.0 on padding.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl TokenBatch {
    /// Right-pad `encodings` to the longest one and upload them.
    ///
    /// # Errors
    /// `EmptyInput` when `encodings` is empty.
    pub fn from_encodings(encodings: &[TokenizedText], device: &Device) -> EmbeddingResult<Self> {
        if encodings.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let batch = encodings.len();
        let seq_len = encodings.iter().map(TokenizedText::len).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for enc in encodings {
            ids.extend_from_slice(&enc.ids);
            ids.extend(std::iter::repeat(PAD_TOKEN_ID).take(seq_len - enc.len()));
            mask.extend(enc.attention_mask.iter().map(|&m| m as f32));
            mask.extend(std::iter::repeat(0.0f32).take(seq_len - enc.len()));
        }

        let input_ids = Tensor::from_vec(ids, (batch, seq_len), device).map_err(|e| {
            EmbeddingError::TensorError {
                message: format!("TokenBatch input_ids tensor failed: {}", e),
            }
        })?;
        let attention_mask = Tensor::from_vec(mask, (batch, seq_len), device).map_err(|e| {
            EmbeddingError::TensorError {
                message: format!("TokenBatch attention_mask tensor failed: {}", e),
            }
        })?;

        Ok(Self {
            input_ids,
            attention_mask,
        })
    }

    /// Number of sequences (the leading dimension of `input_ids`).
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    /// Padded sequence length.
    pub fn seq_len(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }
}

/// Text to token ids.
pub trait Tokenizer: Send + Sync {
    /// Encode one text, capped at `max_len` tokens.
    fn encode(&self, text: &str, max_len: usize) -> EmbeddingResult<TokenizedText>;

    /// Encode a `(first, second)` pair, e.g. a passage title and its text.
    fn encode_pair(&self, first: &str, second: &str, max_len: usize)
        -> EmbeddingResult<TokenizedText>;

    fn vocab_size(&self) -> usize;

    fn tokenize(&self, texts: &[&str], max_len: usize, device: &Device) -> EmbeddingResult<TokenBatch> {
        let encodings = texts
            .iter()
            .map(|text| self.encode(text, max_len))
            .collect::<EmbeddingResult<Vec<_>>>()?;
        TokenBatch::from_encodings(&encodings, device)
    }

    fn tokenize_pairs(
        &self,
        pairs: &[(&str, &str)],
        max_len: usize,
        device: &Device,
    ) -> EmbeddingResult<TokenBatch> {
        let encodings = pairs
            .iter()
            .map(|(first, second)| self.encode_pair(first, second, max_len))
            .collect::<EmbeddingResult<Vec<_>>>()?;
        TokenBatch::from_encodings(&encodings, device)
    }

    /// Tokenize passages that may carry a title. With `embed_title` set,
    /// every passage is encoded as the pair `(title, text)`, an absent title
    /// becoming the empty string, so titled and untitled passages share one
    /// framing. Without it only the text is encoded.
    fn tokenize_titled(
        &self,
        passages: &[(Option<&str>, &str)],
        max_len: usize,
        embed_title: bool,
        device: &Device,
    ) -> EmbeddingResult<TokenBatch> {
        if embed_title {
            let pairs: Vec<(&str, &str)> = passages
                .iter()
                .map(|(title, text)| (title.unwrap_or(""), *text))
                .collect();
            return self.tokenize_pairs(&pairs, max_len, device);
        }
        let texts: Vec<&str> = passages.iter().map(|(_, text)| *text).collect();
        self.tokenize(&texts, max_len, device)
    }
}

// ============================================================================
// HUGGINGFACE TOKENIZER
// ============================================================================

/// Wrapper around a `tokenizers::Tokenizer` loaded from `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> EmbeddingResult<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            EmbeddingError::TokenizationError {
                message: format!("failed to load tokenizer '{}': {}", path.display(), e),
            }
        })?;
        Ok(Self { inner })
    }

    fn finish(encoding: tokenizers::Encoding, max_len: usize) -> TokenizedText {
        let mut tokenized = TokenizedText {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        };
        tokenized.truncate_keep_last(max_len);
        tokenized
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, max_len: usize) -> EmbeddingResult<TokenizedText> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| EmbeddingError::TokenizationError {
                message: format!("HfTokenizer encode failed: {}", e),
            })?;
        Ok(Self::finish(encoding, max_len))
    }

    fn encode_pair(
        &self,
        first: &str,
        second: &str,
        max_len: usize,
    ) -> EmbeddingResult<TokenizedText> {
        let encoding = self
            .inner
            .encode((first, second), true)
            .map_err(|e| EmbeddingError::TokenizationError {
                message: format!("HfTokenizer pair encode failed: {}", e),
            })?;
        Ok(Self::finish(encoding, max_len))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

// ============================================================================
// HASHING TOKENIZER
// ============================================================================

/// Vocabulary-free tokenizer.
///
/// Lowercases, splits on anything that is not alphanumeric, and maps each
/// word to `3 + xxh64(word) % (vocab_size - 3)`. Sequences are framed as
/// `[CLS] words [SEP]` or `[CLS] first [SEP] second [SEP]`.
#[derive(Debug, Clone)]
pub struct HashingTokenizer {
    vocab_size: usize,
}

impl HashingTokenizer {
    /// # Errors
    /// `ConfigError` if `vocab_size` leaves no room beyond the special tokens.
    pub fn new(vocab_size: usize) -> EmbeddingResult<Self> {
        if vocab_size <= SPECIAL_TOKENS as usize {
            return Err(EmbeddingError::config(format!(
                "HashingTokenizer vocab_size must exceed {}, got {}",
                SPECIAL_TOKENS, vocab_size
            )));
        }
        Ok(Self { vocab_size })
    }

    fn word_ids(&self, text: &str) -> Vec<u32> {
        let buckets = (self.vocab_size as u64) - SPECIAL_TOKENS as u64;
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| {
                let word = w.to_lowercase();
                SPECIAL_TOKENS + (xxh64(word.as_bytes(), HASHING_SEED) % buckets) as u32
            })
            .collect()
    }
}

impl Tokenizer for HashingTokenizer {
    fn encode(&self, text: &str, max_len: usize) -> EmbeddingResult<TokenizedText> {
        let mut ids = Vec::with_capacity(max_len);
        ids.push(CLS_TOKEN_ID);
        ids.extend(self.word_ids(text));
        ids.push(SEP_TOKEN_ID);
        let mut tokenized = TokenizedText::from_ids(ids);
        tokenized.truncate_keep_last(max_len);
        Ok(tokenized)
    }

    fn encode_pair(
        &self,
        first: &str,
        second: &str,
        max_len: usize,
    ) -> EmbeddingResult<TokenizedText> {
        let mut a = self.word_ids(first);
        let mut b = self.word_ids(second);

        // Longest-first truncation to fit [CLS] a [SEP] b [SEP].
        let budget = max_len.saturating_sub(3);
        while a.len() + b.len() > budget {
            if a.len() > b.len() {
                a.pop();
            } else {
                b.pop();
            }
        }

        let mut ids = Vec::with_capacity(a.len() + b.len() + 3);
        ids.push(CLS_TOKEN_ID);
        ids.extend(a);
        ids.push(SEP_TOKEN_ID);
        ids.extend(b);
        ids.push(SEP_TOKEN_ID);
        let mut tokenized = TokenizedText::from_ids(ids);
        tokenized.truncate_keep_last(max_len);
        Ok(tokenized)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
