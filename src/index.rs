//! In-memory vector index with on-disk persistence.
//!
//! Stores one embedding per chunk and answers nearest-neighbor queries by
//! cosine similarity, the same metric used at indexing time. The index is
//! an explicitly owned instance: open one per corpus (or per test) and
//! pass it to whatever needs it.
//!
//! # Concurrency
//!
//! A single [`parking_lot::RwLock`] guards the entry map. Readers run
//! freely; writers are serialized. [`VectorIndex::replace_document`] swaps
//! a document's entries under one write guard, so a concurrent search sees
//! either the pre- or post-update state, never a partial one.
//!
//! # Persistence
//!
//! [`VectorIndex::save`] serializes entries (sorted by chunk id) as JSON to
//! a temp file and renames it into place. [`VectorIndex::open`] loads the
//! file if present; a missing file means an empty index, corrupt content is
//! [`IndexError::Corrupt`]. Search ordering uses (score desc, chunk_id asc),
//! so relative ranking is stable across a save/load round trip.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::embedding::cosine_similarity;
use crate::error::IndexError;

/// A single entry: the embedding for one chunk.
#[derive(Debug, Clone)]
struct Entry {
    document_id: String,
    vector: Vec<f32>,
}

/// A scored nearest-neighbor hit, best first.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

#[derive(Debug, Default)]
struct IndexState {
    dims: Option<usize>,
    entries: HashMap<String, Entry>,
}

/// On-disk representation.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dims: Option<usize>,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    chunk_id: String,
    document_id: String,
    vector: Vec<f32>,
}

/// Cosine nearest-neighbor store over chunk embeddings.
#[derive(Debug)]
pub struct VectorIndex {
    path: PathBuf,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// Open the index at `path`, loading persisted entries if the file
    /// exists. A missing file is an empty index, not an error.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let state = if path.exists() {
            let bytes = std::fs::read(path)?;
            let persisted: PersistedIndex =
                serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;

            let mut entries = HashMap::with_capacity(persisted.entries.len());
            for entry in persisted.entries {
                if let Some(dims) = persisted.dims {
                    if entry.vector.len() != dims {
                        return Err(IndexError::Corrupt {
                            path: path.to_path_buf(),
                            reason: format!(
                                "entry {} has {} dims, index declares {}",
                                entry.chunk_id,
                                entry.vector.len(),
                                dims
                            ),
                        });
                    }
                }
                entries.insert(
                    entry.chunk_id,
                    Entry {
                        document_id: entry.document_id,
                        vector: entry.vector,
                    },
                );
            }

            IndexState {
                dims: persisted.dims,
                entries,
            }
        } else {
            IndexState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Insert or replace the entry for a chunk.
    ///
    /// The first inserted vector fixes the index dimensionality; later
    /// vectors of a different length are rejected.
    pub fn add(
        &self,
        chunk_id: &str,
        document_id: &str,
        vector: Vec<f32>,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write();
        insert_locked(&mut state, chunk_id, document_id, vector)
    }

    /// Atomically replace all entries for a document with `entries`.
    pub fn replace_document(
        &self,
        document_id: &str,
        entries: Vec<(String, Vec<f32>)>,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write();
        state.entries.retain(|_, e| e.document_id != document_id);
        for (chunk_id, vector) in entries {
            insert_locked(&mut state, &chunk_id, document_id, vector)?;
        }
        Ok(())
    }

    /// Delete all entries for a document. Returns the number removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.document_id != document_id);
        before - state.entries.len()
    }

    /// Return up to `k` nearest entries by cosine similarity, best first.
    ///
    /// Ties are broken by chunk id so ranking is deterministic. Searching
    /// an empty index returns an empty Vec.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        let state = self.state.read();

        let mut hits: Vec<SearchHit> = state
            .entries
            .iter()
            .map(|(chunk_id, entry)| SearchHit {
                chunk_id: chunk_id.clone(),
                document_id: entry.document_id.clone(),
                score: cosine_similarity(query, &entry.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);

        hits
    }

    /// Sorted distinct document ids currently indexed.
    pub fn document_ids(&self) -> Vec<String> {
        let state = self.state.read();
        let set: BTreeSet<&String> = state.entries.values().map(|e| &e.document_id).collect();
        set.into_iter().cloned().collect()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Persist the index to its path (temp file + rename).
    pub fn save(&self) -> Result<(), IndexError> {
        let state = self.state.read();

        let mut entries: Vec<PersistedEntry> = state
            .entries
            .iter()
            .map(|(chunk_id, entry)| PersistedEntry {
                chunk_id: chunk_id.clone(),
                document_id: entry.document_id.clone(),
                vector: entry.vector.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));

        let persisted = PersistedIndex {
            dims: state.dims,
            entries,
        };
        drop(state);

        let bytes = serde_json::to_vec(&persisted).map_err(|e| IndexError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}

fn insert_locked(
    state: &mut IndexState,
    chunk_id: &str,
    document_id: &str,
    vector: Vec<f32>,
) -> Result<(), IndexError> {
    match state.dims {
        None => state.dims = Some(vector.len()),
        Some(dims) => {
            if vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    got: vector.len(),
                });
            }
        }
    }

    state.entries.insert(
        chunk_id.to_string(),
        Entry {
            document_id: document_id.to_string(),
            vector,
        },
    );
    Ok(())
}
