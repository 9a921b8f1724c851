//! Training data for the dual encoder.
//!
//! Examples use the DPR JSON layout: a list of objects with a `question`, a
//! list of `positive_ctxs` and a list of `hard_negative_ctxs`, each context
//! carrying a `title` and a `text`. Unknown fields (`answers`,
//! `negative_ctxs`, `passage_id`, ...) are ignored.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, EmbeddingResult};

/// One passage: optional title plus body text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    #[serde(default)]
    pub title: String,
    pub text: String,
}

impl Passage {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }

    /// Title, or `None` when empty.
    pub fn title(&self) -> Option<&str> {
        if self.title.is_empty() {
            None
        } else {
            Some(&self.title)
        }
    }
}

/// A query with its positive and hard negative passages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub question: String,
    #[serde(rename = "positive_ctxs")]
    pub positives: Vec<Passage>,
    #[serde(rename = "hard_negative_ctxs", default)]
    pub hard_negatives: Vec<Passage>,
}

impl TrainingExample {
    pub fn new(question: impl Into<String>, positive: Passage) -> Self {
        Self {
            question: question.into(),
            positives: vec![positive],
            hard_negatives: Vec::new(),
        }
    }

    pub fn with_hard_negative(mut self, passage: Passage) -> Self {
        self.hard_negatives.push(passage);
        self
    }

    /// Whether the example can fill one positive plus `num_hard_negatives`.
    pub fn is_usable(&self, num_hard_negatives: usize) -> bool {
        !self.positives.is_empty() && self.hard_negatives.len() >= num_hard_negatives
    }
}

/// Read a DPR-format JSON file.
pub fn load_dpr_json(path: impl AsRef<Path>) -> EmbeddingResult<Vec<TrainingExample>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| EmbeddingError::SerializationError {
        message: format!("failed to parse '{}': {}", path.display(), e),
    })
}

/// A training batch. Passages are laid out per example, positive first.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub examples: Vec<TrainingExample>,
    /// Batch index (for logging).
    pub batch_idx: usize,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn questions(&self) -> Vec<&str> {
        self.examples.iter().map(|e| e.question.as_str()).collect()
    }

    /// `len() * (1 + num_hard_negatives)` passages: for each example its first
    /// positive followed by its first `num_hard_negatives` hard negatives.
    pub fn passages(&self, num_hard_negatives: usize) -> Vec<&Passage> {
        let mut out = Vec::with_capacity(self.examples.len() * (1 + num_hard_negatives));
        for example in &self.examples {
            out.extend(example.positives.first());
            out.extend(example.hard_negatives.iter().take(num_hard_negatives));
        }
        out
    }
}

/// Shuffling batch iterator over training examples.
pub struct SimilarityDataLoader {
    examples: Vec<TrainingExample>,
    batch_size: usize,
    num_hard_negatives: usize,
    indices: Vec<usize>,
    position: usize,
    rng: rand::rngs::StdRng,
}

impl SimilarityDataLoader {
    /// Examples that cannot supply one positive and `num_hard_negatives`
    /// hard negatives are dropped with a warning.
    ///
    /// # Errors
    /// `ConfigError` if `batch_size` is 0.
    pub fn new(
        examples: Vec<TrainingExample>,
        batch_size: usize,
        num_hard_negatives: usize,
        seed: u64,
    ) -> EmbeddingResult<Self> {
        if batch_size == 0 {
            return Err(EmbeddingError::config("batch_size must be > 0"));
        }
        let before = examples.len();
        let examples: Vec<TrainingExample> = examples
            .into_iter()
            .filter(|e| e.is_usable(num_hard_negatives))
            .collect();
        if examples.len() < before {
            tracing::warn!(
                dropped = before - examples.len(),
                kept = examples.len(),
                num_hard_negatives,
                "dropped training examples without a positive or with too few hard negatives"
            );
        }

        let indices: Vec<usize> = (0..examples.len()).collect();
        Ok(Self {
            examples,
            batch_size,
            num_hard_negatives,
            indices,
            position: 0,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_hard_negatives(&self) -> usize {
        self.num_hard_negatives
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    /// Shuffle indices for a new epoch.
    pub fn shuffle_epoch(&mut self) {
        self.indices.shuffle(&mut self.rng);
        self.position = 0;
    }

    /// Rewind to the start of the current order without reshuffling.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Get the next batch, or None if the epoch is complete.
    pub fn next_batch(&mut self, batch_idx: usize) -> Option<TrainingBatch> {
        if self.position >= self.indices.len() {
            return None;
        }

        let end = (self.position + self.batch_size).min(self.indices.len());
        let examples: Vec<TrainingExample> = self.indices[self.position..end]
            .iter()
            .map(|&idx| self.examples[idx].clone())
            .collect();
        self.position = end;

        Some(TrainingBatch {
            examples,
            batch_idx,
        })
    }

    /// Split off `eval_fraction` of the examples (rounded up) as a dev set.
    pub fn train_eval_split(
        mut self,
        eval_fraction: f32,
        seed: u64,
    ) -> EmbeddingResult<(SimilarityDataLoader, SimilarityDataLoader)> {
        if !(0.0..1.0).contains(&eval_fraction) {
            return Err(EmbeddingError::config(format!(
                "eval fraction must be in [0, 1), got {}",
                eval_fraction
            )));
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        self.examples.shuffle(&mut rng);

        let eval_count = (self.examples.len() as f32 * eval_fraction).ceil() as usize;
        let eval: Vec<TrainingExample> = self
            .examples
            .drain(self.examples.len() - eval_count..)
            .collect();

        let train = SimilarityDataLoader::new(
            self.examples,
            self.batch_size,
            self.num_hard_negatives,
            seed,
        )?;
        let dev = SimilarityDataLoader::new(eval, self.batch_size, self.num_hard_negatives, seed + 1)?;
        Ok((train, dev))
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(i: usize, hard_negatives: usize) -> TrainingExample {
        let mut e = TrainingExample::new(
            format!("question {}", i),
            Passage::new(format!("title {}", i), format!("positive {}", i)),
        );
        for j in 0..hard_negatives {
            e = e.with_hard_negative(Passage::new("", format!("negative {} {}", i, j)));
        }
        e
    }

    #[test]
    fn test_parse_dpr_json() {
        let raw = r#"[
            {
                "dataset": "nq",
                "question": "who wrote hamlet",
                "answers": ["Shakespeare"],
                "positive_ctxs": [{"title": "Hamlet", "text": "Hamlet is a tragedy by Shakespeare.", "score": 1000}],
                "negative_ctxs": [],
                "hard_negative_ctxs": [{"title": "Macbeth", "text": "Macbeth is a tragedy."}]
            },
            {
                "question": "no negatives here",
                "positive_ctxs": [{"text": "untitled passage"}]
            }
        ]"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, raw).unwrap();

        let examples = load_dpr_json(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].positives[0].title(), Some("Hamlet"));
        assert_eq!(examples[0].hard_negatives.len(), 1);
        assert_eq!(examples[1].positives[0].title(), None);
        assert!(examples[1].hard_negatives.is_empty());
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_dpr_json(&path),
            Err(EmbeddingError::SerializationError { .. })
        ));
    }

    #[test]
    fn test_drops_unusable_examples() {
        let examples = vec![example(0, 2), example(1, 0), example(2, 1)];
        let loader = SimilarityDataLoader::new(examples, 2, 1, 7).unwrap();
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.num_batches(), 1);
    }

    #[test]
    fn test_batches_cover_epoch() {
        let examples: Vec<_> = (0..5).map(|i| example(i, 1)).collect();
        let mut loader = SimilarityDataLoader::new(examples, 2, 1, 42).unwrap();
        loader.shuffle_epoch();

        let mut seen = Vec::new();
        let mut idx = 0;
        while let Some(batch) = loader.next_batch(idx) {
            assert_eq!(batch.batch_idx, idx);
            seen.extend(batch.questions().into_iter().map(String::from));
            idx += 1;
        }
        assert_eq!(idx, 3);
        seen.sort();
        let want: Vec<String> = (0..5).map(|i| format!("question {}", i)).collect();
        assert_eq!(seen, want);

        loader.reset();
        assert!(loader.next_batch(0).is_some());
    }

    #[test]
    fn test_passage_layout_positive_first() {
        let batch = TrainingBatch {
            examples: vec![example(0, 3), example(1, 3)],
            batch_idx: 0,
        };
        let texts: Vec<&str> = batch.passages(2).iter().map(|p| p.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "positive 0",
                "negative 0 0",
                "negative 0 1",
                "positive 1",
                "negative 1 0",
                "negative 1 1"
            ]
        );
    }

    #[test]
    fn test_train_eval_split() {
        let examples: Vec<_> = (0..10).map(|i| example(i, 1)).collect();
        let loader = SimilarityDataLoader::new(examples, 4, 1, 0).unwrap();
        let (train, dev) = loader.train_eval_split(0.25, 3).unwrap();
        assert_eq!(dev.len(), 3);
        assert_eq!(train.len(), 7);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(SimilarityDataLoader::new(vec![example(0, 0)], 0, 0, 0).is_err());
    }
}
