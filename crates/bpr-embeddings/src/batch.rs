//! Batched embedding extraction.
//!
//! Inputs are split into `batch_size` chunks; each chunk runs one dual-encoder
//! forward and its outputs are copied to host. The per-chunk outputs are then
//! concatenated per output kind, so callers see one flat list of dense query
//! vectors, one of query codes and one of passage codes, in input order.
//!
//! ```text
//! texts ──► split_batch ──► [chunk 0] ─► forward ─► host ─┐
//!                           [chunk 1] ─► forward ─► host ─┼─► concat per kind
//!                           [chunk n] ─► forward ─► host ─┘
//! ```

use bpr_core::BinaryCode;
use candle_core::{Device, Tensor};

use crate::dual_encoder::DualEncoder;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::tokenization::Tokenizer;
use crate::towers::TowerRole;

/// Split `items` into consecutive chunks of at most `batch_size`.
///
/// # Errors
/// `ConfigError` if `batch_size` is 0.
pub fn split_batch<T>(items: &[T], batch_size: usize) -> EmbeddingResult<Vec<&[T]>> {
    if batch_size == 0 {
        return Err(EmbeddingError::config("batch_size must be > 0"));
    }
    Ok(items.chunks(batch_size).collect())
}

/// Host-side outputs of a batched extraction, concatenated across chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedEmbeddings {
    /// Unhashed query embeddings, one per query.
    pub dense_query: Vec<Vec<f32>>,
    /// Packed query codes, one per query.
    pub binary_query: Vec<BinaryCode>,
    /// Packed passage codes, one per passage.
    pub binary_passage: Vec<BinaryCode>,
}

/// A passage as `(title, text)`.
pub type TitledPassage<'t> = (Option<&'t str>, &'t str);

/// Runs a [`DualEncoder`] over arbitrarily many inputs in fixed-size chunks.
pub struct EmbeddingExtractor<'a> {
    encoder: &'a DualEncoder,
    tokenizer: &'a dyn Tokenizer,
    device: Device,
    batch_size: usize,
    embed_title: bool,
}

impl<'a> EmbeddingExtractor<'a> {
    /// # Errors
    /// `ConfigError` if `batch_size` is 0.
    pub fn new(
        encoder: &'a DualEncoder,
        tokenizer: &'a dyn Tokenizer,
        device: Device,
        batch_size: usize,
        embed_title: bool,
    ) -> EmbeddingResult<Self> {
        if batch_size == 0 {
            return Err(EmbeddingError::config("[batch] batch_size must be > 0"));
        }
        Ok(Self {
            encoder,
            tokenizer,
            device,
            batch_size,
            embed_title,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Dense vectors and packed codes for `queries`.
    pub fn extract_queries(
        &self,
        queries: &[&str],
    ) -> EmbeddingResult<(Vec<Vec<f32>>, Vec<BinaryCode>)> {
        let out = self.extract(Some(queries), None)?;
        Ok((out.dense_query, out.binary_query))
    }

    /// Packed codes for `passages`.
    pub fn extract_passages(&self, passages: &[TitledPassage<'_>]) -> EmbeddingResult<Vec<BinaryCode>> {
        Ok(self.extract(None, Some(passages))?.binary_passage)
    }

    /// Chunked forward over queries and/or passages.
    ///
    /// Chunk `i` holds queries `[i·bs, (i+1)·bs)` and passages
    /// `[i·bs, (i+1)·bs)`; a side that runs out earlier is simply absent from
    /// the remaining chunks.
    ///
    /// # Errors
    /// - `ConfigError` if both sides are `None`
    /// - `ShapeMismatch` if the concatenated outputs do not match the input
    ///   counts
    /// - any encoder or tokenizer error, failing the whole call
    #[tracing::instrument(skip_all, fields(
        queries = queries.map_or(0, <[_]>::len),
        passages = passages.map_or(0, <[_]>::len),
        batch_size = self.batch_size,
    ))]
    pub fn extract(
        &self,
        queries: Option<&[&str]>,
        passages: Option<&[TitledPassage<'_>]>,
    ) -> EmbeddingResult<ExtractedEmbeddings> {
        if queries.is_none() && passages.is_none() {
            return Err(EmbeddingError::config(
                "extraction needs queries, passages, or both",
            ));
        }

        let query_chunks = split_batch(queries.unwrap_or_default(), self.batch_size)?;
        let passage_chunks = split_batch(passages.unwrap_or_default(), self.batch_size)?;
        let num_chunks = query_chunks.len().max(passage_chunks.len());

        let mut out = ExtractedEmbeddings::default();
        for i in 0..num_chunks {
            let q_chunk = query_chunks.get(i).copied();
            let p_chunk = passage_chunks.get(i).copied();

            let q_tokens = q_chunk
                .map(|texts| {
                    self.tokenizer.tokenize(
                        texts,
                        self.encoder.tower(TowerRole::Query).max_seq_len(),
                        &self.device,
                    )
                })
                .transpose()?;
            let p_tokens = p_chunk
                .map(|items| {
                    self.tokenizer.tokenize_titled(
                        items,
                        self.encoder.tower(TowerRole::Passage).max_seq_len(),
                        self.embed_title,
                        &self.device,
                    )
                })
                .transpose()?;

            let forward = self.encoder.forward(q_tokens.as_ref(), p_tokens.as_ref())?;

            if let Some(dense) = &forward.dense_query {
                out.dense_query.extend(to_rows(dense)?);
            }
            if let Some(binary) = &forward.binary_query {
                out.binary_query
                    .extend(to_rows(binary)?.iter().map(|row| BinaryCode::from_unpacked(row)));
            }
            if let Some(binary) = &forward.binary_passage {
                out.binary_passage
                    .extend(to_rows(binary)?.iter().map(|row| BinaryCode::from_unpacked(row)));
            }

            tracing::debug!(
                chunk = i,
                queries = q_chunk.map_or(0, <[_]>::len),
                passages = p_chunk.map_or(0, <[_]>::len),
                "extracted batch"
            );
        }

        let n_queries = queries.map_or(0, <[_]>::len);
        let n_passages = passages.map_or(0, <[_]>::len);
        for (kind, got, want) in [
            ("dense query rows", out.dense_query.len(), n_queries),
            ("binary query rows", out.binary_query.len(), n_queries),
            ("binary passage rows", out.binary_passage.len(), n_passages),
        ] {
            if got != want {
                return Err(EmbeddingError::shape(kind, want, got));
            }
        }

        Ok(out)
    }
}

fn to_rows(t: &Tensor) -> EmbeddingResult<Vec<Vec<f32>>> {
    t.to_dtype(candle_core::DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(|e| EmbeddingError::TensorError {
            message: format!("EmbeddingExtractor host copy failed: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashActivation;
    use crate::tokenization::HashingTokenizer;
    use crate::towers::{TowerRegistry, TowerSpec, MEAN_POOL_FAMILY};

    fn encoder() -> DualEncoder {
        let registry = TowerRegistry::with_defaults();
        let spec = |seed| TowerSpec {
            family: MEAN_POOL_FAMILY.to_string(),
            vocab_size: 100,
            hidden_dim: 8,
            output_dim: 12,
            max_seq_len: 32,
            seed,
        };
        DualEncoder::new(
            registry.build(&spec(3), &Device::Cpu).unwrap(),
            registry.build(&spec(4), &Device::Cpu).unwrap(),
            HashActivation::new(0.1).unwrap(),
            0.1,
        )
        .unwrap()
    }

    #[test]
    fn test_split_batch() {
        let items = [1, 2, 3, 4, 5];
        let chunks = split_batch(&items, 2).unwrap();
        assert_eq!(chunks, vec![&[1, 2][..], &[3, 4][..], &[5][..]]);
        assert!(split_batch(&items, 0).is_err());
        assert!(split_batch::<u8>(&[], 3).unwrap().is_empty());
    }

    #[test]
    fn test_chunking_does_not_change_outputs() {
        let enc = encoder();
        let tok = HashingTokenizer::new(100).unwrap();
        let queries = ["first question", "second", "a third question here", "fourth"];

        let one_batch = EmbeddingExtractor::new(&enc, &tok, Device::Cpu, 16, true).unwrap();
        let small = EmbeddingExtractor::new(&enc, &tok, Device::Cpu, 3, true).unwrap();

        let (dense_a, codes_a) = one_batch.extract_queries(&queries).unwrap();
        let (dense_b, codes_b) = small.extract_queries(&queries).unwrap();

        assert_eq!(dense_a.len(), 4);
        assert_eq!(codes_a, codes_b, "codes must not depend on chunking");
        for (a, b) in dense_a.iter().zip(dense_b.iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_query_codes_are_signs_of_dense() {
        let enc = encoder();
        let tok = HashingTokenizer::new(100).unwrap();
        let extractor = EmbeddingExtractor::new(&enc, &tok, Device::Cpu, 2, true).unwrap();
        let (dense, codes) = extractor.extract_queries(&["sign check", "another"]).unwrap();
        for (d, c) in dense.iter().zip(codes.iter()) {
            assert_eq!(c, &BinaryCode::from_signs(d));
            assert_eq!(c.bits(), 12);
        }
    }

    #[test]
    fn test_heterogeneous_lengths() {
        let enc = encoder();
        let tok = HashingTokenizer::new(100).unwrap();
        let extractor = EmbeddingExtractor::new(&enc, &tok, Device::Cpu, 2, true).unwrap();
        let passages = [
            (Some("t1"), "passage one"),
            (None, "passage two"),
            (Some("t3"), "passage three"),
            (None, "passage four"),
            (None, "passage five"),
        ];
        let out = extractor
            .extract(Some(&["only query"][..]), Some(&passages[..]))
            .unwrap();
        assert_eq!(out.dense_query.len(), 1);
        assert_eq!(out.binary_query.len(), 1);
        assert_eq!(out.binary_passage.len(), 5);
    }

    #[test]
    fn test_empty_inputs() {
        let enc = encoder();
        let tok = HashingTokenizer::new(100).unwrap();
        let extractor = EmbeddingExtractor::new(&enc, &tok, Device::Cpu, 2, true).unwrap();
        assert!(extractor.extract_passages(&[]).unwrap().is_empty());
        assert!(matches!(
            extractor.extract(None, None),
            Err(EmbeddingError::ConfigError { .. })
        ));
        assert!(EmbeddingExtractor::new(&enc, &tok, Device::Cpu, 0, true).is_err());
    }
}
