//! The binary passage retriever.
//!
//! Retrieval runs in two stages:
//!
//! 1. The query tower encodes the question into a dense vector and its sign
//!    code; the candidate index returns the `candidates` codes closest in
//!    Hamming distance.
//! 2. Each shortlisted code is unpacked to ±1 and scored against the dense
//!    query; the best `top_k` documents are returned in score order.
//!
//! Indexing is a separate phase: [`BinaryPassageRetriever::update_embeddings`]
//! encodes every document of the store and rebuilds the index from scratch.

use std::path::Path;

use bpr_core::{BinaryCode, CandidateIndex, Document, DocumentStore, FlatHammingIndex};
use bpr_embeddings::{
    select_device, BprConfig, DualEncoder, EmbeddingError, EmbeddingExtractor, EmbeddingResult,
    HashActivation, HashingTokenizer, HfTokenizer, SimilarityDataLoader, Tokenizer, TowerRegistry,
    TowerRole, Trainer, TrainingConfig, TrainingExample, TrainingHistory,
};
use candle_core::Device;

use crate::rerank::rerank;

/// Configuration file written next to the encoder checkpoints.
pub const CONFIG_FILE: &str = "config.toml";

pub struct BinaryPassageRetriever<S, I = FlatHammingIndex>
where
    S: DocumentStore,
    I: CandidateIndex,
{
    store: S,
    index: I,
    encoder: DualEncoder,
    tokenizer: Box<dyn Tokenizer>,
    config: BprConfig,
    device: Device,
}

impl<S: DocumentStore> BinaryPassageRetriever<S, FlatHammingIndex> {
    /// Freshly initialised encoder over an empty flat index.
    ///
    /// The tokenizer is loaded from `model.tokenizer_path` when set, otherwise
    /// a [`HashingTokenizer`] over `model.vocab_size` is used.
    pub fn new(store: S, config: BprConfig) -> EmbeddingResult<Self> {
        config.validate()?;
        let device = select_device(&config.device);
        let encoder = DualEncoder::from_config(&config, &TowerRegistry::with_defaults(), &device)?;
        let tokenizer = tokenizer_for(&config)?;
        let index = FlatHammingIndex::new(encoder.embedding_dim())?;
        Self::from_parts(store, index, encoder, tokenizer, config, device)
    }

    /// Restore encoders saved by [`BinaryPassageRetriever::save`].
    ///
    /// With `config` unset the configuration saved in `dir` is used. The
    /// index starts empty; call [`update_embeddings`](Self::update_embeddings).
    pub fn load(dir: impl AsRef<Path>, store: S, config: Option<BprConfig>) -> EmbeddingResult<Self> {
        let dir = dir.as_ref();
        let config = match config {
            Some(config) => config,
            None => BprConfig::from_file(dir.join(CONFIG_FILE))?,
        };
        config.validate()?;

        let device = select_device(&config.device);
        let encoder = DualEncoder::load(
            dir,
            &TowerRegistry::with_defaults(),
            HashActivation::new(config.hash.gamma)?,
            config.model.embeds_dropout_prob,
            &device,
        )?;
        let tokenizer = tokenizer_for(&config)?;
        let index = FlatHammingIndex::new(encoder.embedding_dim())?;

        tracing::info!(dir = %dir.display(), dim = encoder.embedding_dim(), "loaded retriever");
        Self::from_parts(store, index, encoder, tokenizer, config, device)
    }
}

impl<S, I> BinaryPassageRetriever<S, I>
where
    S: DocumentStore,
    I: CandidateIndex,
{
    /// Assemble a retriever from existing components.
    ///
    /// # Errors
    /// `ConfigError` if the index width differs from the encoder dimension,
    /// the tokenizer emits ids beyond a tower's vocabulary, or the config is
    /// invalid.
    pub fn from_parts(
        store: S,
        index: I,
        encoder: DualEncoder,
        tokenizer: Box<dyn Tokenizer>,
        config: BprConfig,
        device: Device,
    ) -> EmbeddingResult<Self> {
        config.validate()?;
        if index.code_bits() != encoder.embedding_dim() {
            return Err(EmbeddingError::config(format!(
                "index stores {}-bit codes but the encoder produces {} dimensions",
                index.code_bits(),
                encoder.embedding_dim()
            )));
        }
        for role in [TowerRole::Query, TowerRole::Passage] {
            let tower_vocab = encoder.tower(role).spec().vocab_size;
            if tokenizer.vocab_size() > tower_vocab {
                return Err(EmbeddingError::config(format!(
                    "tokenizer vocabulary ({}) exceeds the {} tower vocabulary ({})",
                    tokenizer.vocab_size(),
                    role,
                    tower_vocab
                )));
            }
        }

        Ok(Self {
            store,
            index,
            encoder,
            tokenizer,
            config,
            device,
        })
    }

    /// Top documents for `query`; `top_k` defaults to `retrieval.top_k`.
    ///
    /// An empty index logs a warning and yields no documents.
    #[tracing::instrument(skip(self), fields(indexed = self.index.len()))]
    pub fn retrieve(&self, query: &str, top_k: Option<usize>) -> EmbeddingResult<Vec<Document>> {
        let top_k = top_k.unwrap_or(self.config.retrieval.top_k);
        if self.index.is_empty() {
            tracing::warn!("index is empty, call update_embeddings before retrieving");
            return Ok(Vec::new());
        }

        let (dense, codes) = self.embed_queries(&[query])?;
        let (dense, code) = match (dense.first(), codes.first()) {
            (Some(dense), Some(code)) => (dense, code),
            _ => return Err(EmbeddingError::shape("query embeddings", 1, 0)),
        };
        self.retrieve_by_embedding(dense, code, top_k)
    }

    /// Shortlist, re-rank and resolve documents for an already encoded query.
    pub fn retrieve_by_embedding(
        &self,
        dense_query: &[f32],
        query_code: &BinaryCode,
        top_k: usize,
    ) -> EmbeddingResult<Vec<Document>> {
        if self.index.is_empty() {
            tracing::warn!("index is empty, nothing to retrieve");
            return Ok(Vec::new());
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let n = self.config.retrieval.candidates.min(self.index.len());
        let shortlist = self.index.search(query_code, n)?;
        let ranked = rerank(dense_query, &shortlist, &self.index)?;

        tracing::debug!(
            shortlisted = shortlist.len(),
            top_k,
            best = ranked.first().map(|(_, score)| *score),
            "re-ranked shortlist"
        );

        ranked
            .into_iter()
            .take(top_k)
            .map(|(id, _)| {
                self.store
                    .get(id)
                    .cloned()
                    .ok_or(EmbeddingError::DocumentNotFound { id })
            })
            .collect()
    }

    /// Dense query vectors and their packed codes.
    pub fn embed_queries(&self, texts: &[&str]) -> EmbeddingResult<(Vec<Vec<f32>>, Vec<BinaryCode>)> {
        self.extractor()?.extract_queries(texts)
    }

    /// Packed passage codes. Titles come from `meta["name"]`.
    pub fn embed_documents(&self, documents: &[Document]) -> EmbeddingResult<Vec<BinaryCode>> {
        let passages: Vec<(Option<&str>, &str)> = documents
            .iter()
            .map(|doc| (doc.title(), doc.content.as_str()))
            .collect();
        self.extractor()?.extract_passages(&passages)
    }

    /// Re-encode every document in the store and rebuild the index.
    ///
    /// Document `i` of the store is indexed under candidate id `i`. Returns the
    /// number of indexed documents.
    #[tracing::instrument(skip(self), fields(documents = self.store.len()))]
    pub fn update_embeddings(&mut self) -> EmbeddingResult<usize> {
        let codes = self.embed_documents(self.store.all_documents())?;

        self.index.clear();
        for (pos, code) in codes.iter().enumerate() {
            self.index.insert(pos as u64, code)?;
        }

        tracing::info!(indexed = codes.len(), "updated embeddings");
        Ok(codes.len())
    }

    /// Fine-tune both towers on DPR-format examples.
    ///
    /// Without a `dev` set, `training.dev_split` of `train` is held out. The
    /// index keeps codes from the previous weights until
    /// [`update_embeddings`](Self::update_embeddings) runs again.
    pub fn train(
        &mut self,
        train: Vec<TrainingExample>,
        dev: Option<Vec<TrainingExample>>,
        training: TrainingConfig,
    ) -> EmbeddingResult<TrainingHistory> {
        let n_hard = self.config.head.num_hard_negatives;
        let batch_size = training.batch_size;
        let seed = training.seed;

        let train_loader = SimilarityDataLoader::new(train, batch_size, n_hard, seed)?;
        let (mut train_loader, mut dev_loader) = match dev {
            Some(dev) => (
                train_loader,
                Some(SimilarityDataLoader::new(dev, batch_size, n_hard, seed.wrapping_add(1))?),
            ),
            None if training.dev_split > 0.0 => {
                let (train, dev) = train_loader.train_eval_split(training.dev_split, seed)?;
                (train, Some(dev))
            }
            None => (train_loader, None),
        };

        let mut trainer = Trainer::new(
            &self.encoder,
            self.tokenizer.as_ref(),
            self.config.head.clone(),
            training,
            self.device.clone(),
        )?;
        let history = trainer.train(&mut train_loader, dev_loader.as_mut())?;

        if !self.index.is_empty() {
            tracing::warn!(
                indexed = self.index.len(),
                "encoder weights changed, index codes are stale until update_embeddings"
            );
        }
        Ok(history)
    }

    /// Write `query_encoder/`, `passage_encoder/` and `config.toml` to `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> EmbeddingResult<()> {
        let dir = dir.as_ref();
        self.encoder.save(dir)?;
        std::fs::write(dir.join(CONFIG_FILE), self.config.to_toml_string()?)?;
        tracing::info!(dir = %dir.display(), "saved retriever");
        Ok(())
    }

    fn extractor(&self) -> EmbeddingResult<EmbeddingExtractor<'_>> {
        EmbeddingExtractor::new(
            &self.encoder,
            self.tokenizer.as_ref(),
            self.device.clone(),
            self.config.batch.batch_size,
            self.config.model.embed_title,
        )
    }

    pub fn config(&self) -> &BprConfig {
        &self.config
    }

    pub fn encoder(&self) -> &DualEncoder {
        &self.encoder
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable store access. Run `update_embeddings` after writing documents.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn tokenizer_for(config: &BprConfig) -> EmbeddingResult<Box<dyn Tokenizer>> {
    match &config.model.tokenizer_path {
        Some(path) => Ok(Box::new(HfTokenizer::from_file(path)?)),
        None => Ok(Box::new(HashingTokenizer::new(config.model.vocab_size)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpr_core::InMemoryDocumentStore;
    use bpr_embeddings::TokenizedText;

    /// Reports a small vocabulary but emits an id no tower has a row for.
    struct OutOfRangeTokenizer;

    impl Tokenizer for OutOfRangeTokenizer {
        fn encode(&self, _text: &str, _max_len: usize) -> EmbeddingResult<TokenizedText> {
            Ok(TokenizedText {
                ids: vec![1, 5000, 2],
                attention_mask: vec![1, 1, 1],
            })
        }

        fn encode_pair(&self, first: &str, _second: &str, max_len: usize) -> EmbeddingResult<TokenizedText> {
            self.encode(first, max_len)
        }

        fn vocab_size(&self) -> usize {
            16
        }
    }

    fn config(dim: usize) -> BprConfig {
        let mut config = BprConfig::default();
        config.model.embedding_dim = dim;
        config.model.hidden_dim = 8;
        config.model.vocab_size = 256;
        config.retrieval.top_k = 2;
        config.retrieval.candidates = 2;
        config.batch.batch_size = 2;
        config.device.use_gpu = false;
        config
    }

    fn store() -> InMemoryDocumentStore {
        InMemoryDocumentStore::from(vec![
            Document::new("d0", "unused slot"),
            Document::new("d1", "the first passage").with_meta("name", "One"),
            Document::new("d2", "the second passage"),
            Document::new("d3", "the third passage"),
        ])
    }

    fn code8(byte: u8) -> BinaryCode {
        BinaryCode::from_packed(vec![byte], 8).unwrap()
    }

    fn scenario() -> BinaryPassageRetriever<InMemoryDocumentStore> {
        let mut retriever = BinaryPassageRetriever::new(store(), config(8)).unwrap();
        retriever.index.insert(1, &code8(0b1111_0000)).unwrap();
        retriever.index.insert(2, &code8(0b1111_1111)).unwrap();
        retriever.index.insert(3, &code8(0b0000_0000)).unwrap();
        retriever
    }

    #[test]
    fn test_scenario_rerank_selects_aligned_document() {
        let retriever = scenario();
        let query = code8(0b1111_1110);
        assert_eq!(retriever.index().search(&query, 2).unwrap(), vec![(2, 1), (1, 3)]);

        // Aligned with id 1's ±1 code: scores 8 for id 1, 0 for id 2.
        let dense = [1.0f32, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0];
        let docs = retriever.retrieve_by_embedding(&dense, &query, 1).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "d1");

        let docs = retriever.retrieve_by_embedding(&dense, &query, 5).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"], "only the shortlist is re-ranked");
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let retriever = BinaryPassageRetriever::new(store(), config(8)).unwrap();
        assert!(retriever.retrieve("anything", Some(5)).unwrap().is_empty());
    }

    #[test]
    fn test_update_embeddings_indexes_every_document() {
        let mut retriever = BinaryPassageRetriever::new(store(), config(16)).unwrap();
        assert_eq!(retriever.update_embeddings().unwrap(), 4);
        assert_eq!(retriever.index().ids(), vec![0, 1, 2, 3]);

        // Reindexing clears first instead of failing on duplicate ids.
        assert_eq!(retriever.update_embeddings().unwrap(), 4);
        assert_eq!(retriever.index().len(), 4);
    }

    #[test]
    fn test_retrieve_is_idempotent() {
        let mut retriever = BinaryPassageRetriever::new(store(), config(16)).unwrap();
        retriever.update_embeddings().unwrap();

        let a = retriever.retrieve("the second passage", None).unwrap();
        let b = retriever.retrieve("the second passage", None).unwrap();
        assert_eq!(a.len(), 2, "top_k defaults to the configured value");
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_document_is_error() {
        let mut retriever = scenario();
        retriever.index.insert(9, &code8(0b1111_1110)).unwrap();
        // Id 9 is indexed but the store only holds positions 0..=3.
        let dense = code8(0b1111_1110).to_unpacked();
        let err = retriever
            .retrieve_by_embedding(&dense, &code8(0b1111_1110), 1)
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::DocumentNotFound { id: 9 }), "got {:?}", err);
    }

    #[test]
    fn test_mismatched_index_width_rejected() {
        let cfg = config(8);
        let encoder =
            DualEncoder::from_config(&cfg, &TowerRegistry::with_defaults(), &Device::Cpu).unwrap();
        let result = BinaryPassageRetriever::from_parts(
            store(),
            FlatHammingIndex::new(16).unwrap(),
            encoder,
            Box::new(HashingTokenizer::new(256).unwrap()),
            cfg,
            Device::Cpu,
        );
        assert!(matches!(result, Err(EmbeddingError::ConfigError { .. })));
    }

    #[test]
    fn test_oversized_tokenizer_rejected() {
        let cfg = config(8);
        let encoder =
            DualEncoder::from_config(&cfg, &TowerRegistry::with_defaults(), &Device::Cpu).unwrap();
        let result = BinaryPassageRetriever::from_parts(
            store(),
            FlatHammingIndex::new(8).unwrap(),
            encoder,
            Box::new(HashingTokenizer::new(10_000).unwrap()),
            cfg,
            Device::Cpu,
        );
        assert!(matches!(result, Err(EmbeddingError::ConfigError { .. })));
    }

    #[test]
    fn test_tower_failure_surfaces_as_encoding_error() {
        let cfg = config(8);
        let encoder =
            DualEncoder::from_config(&cfg, &TowerRegistry::with_defaults(), &Device::Cpu).unwrap();
        let mut retriever = BinaryPassageRetriever::from_parts(
            store(),
            FlatHammingIndex::new(8).unwrap(),
            encoder,
            Box::new(OutOfRangeTokenizer),
            cfg,
            Device::Cpu,
        )
        .unwrap();
        retriever.index.insert(1, &code8(0b1111_0000)).unwrap();

        let err = retriever.retrieve("any question", None).unwrap_err();
        match &err {
            EmbeddingError::EncodingError { tower, message } => {
                assert_eq!(*tower, TowerRole::Query);
                assert!(message.contains("forward failed"), "got: {}", message);
            }
            other => panic!("expected EncodingError, got {:?}", other),
        }

        // A failed reindex leaves the existing index untouched.
        let err = retriever.update_embeddings().unwrap_err();
        assert!(
            matches!(err, EmbeddingError::EncodingError { tower: TowerRole::Passage, .. }),
            "got {:?}",
            err
        );
        assert_eq!(retriever.index().ids(), vec![1]);
    }
}
