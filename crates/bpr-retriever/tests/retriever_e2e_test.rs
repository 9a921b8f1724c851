//! End-to-end retriever verification: index, retrieve, train, save, load.

use bpr_core::{BinaryCode, CandidateIndex, Document, DocumentStore, InMemoryDocumentStore};
use bpr_embeddings::{
    AdamWConfig, BprConfig, EmbeddingError, Passage, TrainingConfig, TrainingExample,
};
use bpr_retriever::{BinaryPassageRetriever, CONFIG_FILE};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> BprConfig {
    let mut config = BprConfig::default();
    config.model.embedding_dim = 32;
    config.model.hidden_dim = 16;
    config.model.vocab_size = 1024;
    config.model.max_seq_len_query = 16;
    config.model.max_seq_len_passage = 48;
    config.retrieval.top_k = 3;
    config.retrieval.candidates = 4;
    config.batch.batch_size = 4;
    config.head.num_hard_negatives = 1;
    config.device.use_gpu = false;
    config
}

fn corpus() -> Vec<Document> {
    [
        ("Rust", "Rust is a systems programming language focused on safety."),
        ("Paris", "Paris is the capital and largest city of France."),
        ("Everest", "Mount Everest is the highest mountain above sea level."),
        ("Hamming", "The Hamming distance counts positions at which bits differ."),
        ("Python", "Python is a high-level general-purpose programming language."),
        ("Nile", "The Nile is a major north-flowing river in Africa."),
    ]
    .iter()
    .enumerate()
    .map(|(i, (title, text))| Document::new(format!("doc-{}", i), *text).with_meta("name", *title))
    .collect()
}

fn training_examples() -> Vec<TrainingExample> {
    let docs = corpus();
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            let negative = &docs[(i + 1) % docs.len()];
            TrainingExample::new(
                format!("what is {}", doc.title().unwrap_or_default().to_lowercase()),
                Passage::new(doc.title().unwrap_or_default(), doc.content.clone()),
            )
            .with_hard_negative(Passage::new(
                negative.title().unwrap_or_default(),
                negative.content.clone(),
            ))
        })
        .collect()
}

// =============================================================================
// Edge Case 1: Empty index
// =============================================================================

#[test]
fn verify_empty_index_is_not_an_error() {
    init_tracing();
    println!("\n=== Empty index: retrieve(q, 5) ===");

    let retriever = BinaryPassageRetriever::new(InMemoryDocumentStore::new(), config()).unwrap();
    let docs = retriever.retrieve("anything at all", Some(5)).unwrap();
    println!("  returned {} documents", docs.len());
    assert!(docs.is_empty());
    println!("[PASS] Empty index yields an empty result\n");
}

// =============================================================================
// Edge Case 2: Index, retrieve, and stable results
// =============================================================================

#[test]
fn verify_retrieval_pipeline() {
    init_tracing();
    println!("\n=== Index corpus and retrieve ===");

    let store = InMemoryDocumentStore::from(corpus());
    let mut retriever = BinaryPassageRetriever::new(store, config()).unwrap();
    let indexed = retriever.update_embeddings().unwrap();
    println!("  indexed {} documents", indexed);
    assert_eq!(indexed, 6);
    assert_eq!(retriever.index().len(), 6);

    let first = retriever.retrieve("highest mountain", None).unwrap();
    let second = retriever.retrieve("highest mountain", None).unwrap();
    println!("  top ids: {:?}", first.iter().map(|d| &d.id).collect::<Vec<_>>());
    assert_eq!(first.len(), 3);
    assert_eq!(first, second, "retrieval must be idempotent on an unmodified index");

    // Every returned document must come from the re-ranked shortlist.
    let (dense, codes) = retriever.embed_queries(&["highest mountain"]).unwrap();
    let shortlist = retriever.index().search(&codes[0], 4).unwrap();
    let ranked = bpr_retriever::rerank(&dense[0], &shortlist, retriever.index()).unwrap();
    let expected: Vec<&Document> = ranked
        .iter()
        .take(3)
        .map(|(id, _)| retriever.store().get(*id).unwrap())
        .collect();
    assert_eq!(first.iter().collect::<Vec<_>>(), expected);

    // Stored codes match a fresh encoding of the same documents.
    let codes: Vec<BinaryCode> = retriever.embed_documents(retriever.store().all_documents()).unwrap();
    for (id, code) in codes.iter().enumerate() {
        assert_eq!(&retriever.index().reconstruct(id as u64).unwrap(), code);
    }
    println!("[PASS] Retrieval pipeline consistent\n");
}

// =============================================================================
// Edge Case 3: Train, save, load
// =============================================================================

#[test]
fn verify_train_save_load() {
    init_tracing();
    println!("\n=== Train → save → load ===");

    let store = InMemoryDocumentStore::from(corpus());
    let mut retriever = BinaryPassageRetriever::new(store, config()).unwrap();

    let training = TrainingConfig {
        batch_size: 2,
        epochs: 2,
        evaluate_every: 2,
        dev_split: 0.3,
        optimizer: AdamWConfig {
            learning_rate: 1e-3,
            warmup_steps: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let history = retriever.train(training_examples(), None, training).unwrap();
    println!(
        "  steps={} evaluations={} best_loss={:?}",
        history.total_steps,
        history.evaluations.len(),
        history.best_loss
    );
    // 6 examples, 2 held out: 2 batches per epoch.
    assert_eq!(history.total_steps, 4);
    assert!(!history.evaluations.is_empty());
    assert!(history.best_loss.is_some());

    retriever.update_embeddings().unwrap();
    let before = retriever.retrieve("capital of france", Some(2)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    retriever.save(dir.path()).unwrap();
    assert!(dir.path().join(CONFIG_FILE).exists());
    assert!(dir.path().join("query_encoder").exists());
    assert!(dir.path().join("passage_encoder").exists());

    let mut restored =
        BinaryPassageRetriever::load(dir.path(), InMemoryDocumentStore::from(corpus()), None).unwrap();
    assert_eq!(restored.config().model.embedding_dim, 32);
    assert!(restored.retrieve("capital of france", Some(2)).unwrap().is_empty());

    restored.update_embeddings().unwrap();
    let after = restored.retrieve("capital of france", Some(2)).unwrap();
    assert_eq!(before, after, "restored retriever must rank identically");
    println!("[PASS] Saved retriever reproduces rankings\n");
}

// =============================================================================
// Edge Case 4: Invalid configuration fails before any batch
// =============================================================================

#[test]
fn verify_invalid_config_rejected() {
    println!("\n=== Invalid config ===");

    let mut bad = config();
    bad.hash.gamma = 0.0;
    let err = BinaryPassageRetriever::new(InMemoryDocumentStore::new(), bad)
        .err()
        .expect("gamma = 0 must be rejected");
    println!("  error: {}", err);
    assert!(matches!(err, EmbeddingError::ConfigError { .. }));

    let mut bad = config();
    bad.retrieval.candidates = 1;
    assert!(BinaryPassageRetriever::new(InMemoryDocumentStore::new(), bad).is_err());
    println!("[PASS] Invalid configs rejected\n");
}
