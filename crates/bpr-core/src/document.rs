//! Documents and the store the retriever resolves candidate ids against.
//!
//! Candidate ids are positions in the store: the document at position `i`
//! of [`DocumentStore::all_documents`] is indexed under id `i`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label assumed when a document carries none.
pub const DEFAULT_LABEL: &str = "positive";

/// A retrievable passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Builder-style meta entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Title, read from `meta["name"]`.
    pub fn title(&self) -> Option<&str> {
        self.meta.get("name").map(String::as_str)
    }

    /// Label from `meta["label"]`, `"positive"` when unset.
    pub fn label(&self) -> &str {
        self.meta
            .get("label")
            .map(String::as_str)
            .unwrap_or(DEFAULT_LABEL)
    }
}

/// Read access to a document collection.
pub trait DocumentStore: Send + Sync {
    /// Every document, in id order.
    fn all_documents(&self) -> &[Document];

    /// Document for a candidate id.
    fn get(&self, candidate_id: u64) -> Option<&Document> {
        usize::try_from(candidate_id)
            .ok()
            .and_then(|pos| self.all_documents().get(pos))
    }

    fn len(&self) -> usize {
        self.all_documents().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insertion-ordered in-memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryDocumentStore {
    documents: Vec<Document>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents. Returns the candidate id assigned to the first one.
    pub fn write_documents(&mut self, documents: impl IntoIterator<Item = Document>) -> u64 {
        let first = self.documents.len() as u64;
        self.documents.extend(documents);
        first
    }
}

impl From<Vec<Document>> for InMemoryDocumentStore {
    fn from(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn all_documents(&self) -> &[Document] {
        &self.documents
    }
}
