//! # VectorStore
//!
//! The trainable semantic index over user turns.
//!
//! This module ties three pieces together:
//! - an [`EmbeddingBuffer`] of vectors waiting for the next flush, each paired with the
//!   [`TurnRef`] of the user turn it was computed from;
//! - an [`IvfFlatIndex`], which must be trained on a sample before it accepts vectors;
//! - an [`IndexPositionMap`] from the index's global positions back to `(user, position)`.
//!
//! ## Lifecycle
//! Vectors accumulate in the buffer. When it reaches `buffer_size`, the store
//! *flushes*: on the first flush it trains the index with the buffered vectors, then
//! (on every flush) adds them to the index, records one position-map entry per vector
//! in the same order, and clears the buffer. Training happens at most once.
//!
//! ## Invariant
//! `positions.len() == index.ntotal()` at all times. Index adds are all-or-nothing, and
//! the map is only extended after an add succeeded.
//!
//! ## Quick Example
//! ```
//! use awful_recall::conversation::TurnRef;
//! use awful_recall::vector_store::VectorStore;
//!
//! let mut vs = VectorStore::new(2, 4, 1, 2);
//! vs.add(vec![0.0, 0.0], TurnRef::new("alice", 0)).unwrap();
//! let report = vs.add(vec![1.0, 1.0], TurnRef::new("alice", 1)).unwrap();
//! assert!(report.is_some_and(|r| r.trained));
//! let hits = vs.search(&[0.9, 0.9], 1, "alice").unwrap();
//! assert_eq!(hits[0].turn.position, 1);
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::conversation::TurnRef;
use crate::error::{MemoryError, Result};
use crate::ivf::{IvfFlatIndex, l2_squared};

/// Vectors awaiting the next flush, paired 1:1 and in order with their turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingBuffer {
    vectors: Vec<Vec<f32>>,
    turns: Vec<TurnRef>,
}

impl EmbeddingBuffer {
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn turns(&self) -> &[TurnRef] {
        &self.turns
    }

    /// Insert keeping each user's entries in log order.
    ///
    /// Concurrent appends by one user can finish embedding out of order; the entry
    /// goes in front of that user's first pending entry with a later position.
    fn push(&mut self, vector: Vec<f32>, turn: TurnRef) {
        let at = self
            .turns
            .iter()
            .position(|t| t.user_id == turn.user_id && t.position > turn.position)
            .unwrap_or(self.turns.len());
        self.vectors.insert(at, vector);
        self.turns.insert(at, turn);
    }

    fn iter(&self) -> impl Iterator<Item = (&Vec<f32>, &TurnRef)> {
        self.vectors.iter().zip(&self.turns)
    }
}

/// Global index position → turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexPositionMap {
    entries: Vec<TurnRef>,
}

impl IndexPositionMap {
    pub fn new(entries: Vec<TurnRef>) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, position: usize) -> Option<&TurnRef> {
        self.entries.get(position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TurnRef] {
        &self.entries
    }
}

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Whether this flush trained the index.
    pub trained: bool,
    /// Global positions assigned to the flushed vectors.
    pub added: Range<usize>,
}

/// A search result resolved to its turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub turn: TurnRef,
    /// Squared L2 distance to the query.
    pub distance: f32,
    /// Global index position; `None` for a still-buffered vector.
    pub index_position: Option<usize>,
}

/// The persisted half of a [`VectorStore`] that goes in the binary index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub index: IvfFlatIndex,
    pub pending: EmbeddingBuffer,
    pub training_events: usize,
}

/// Buffer + trainable index + position map.
#[derive(Debug, Clone)]
pub struct VectorStore {
    index: IvfFlatIndex,
    buffer: EmbeddingBuffer,
    buffer_size: usize,
    positions: IndexPositionMap,
    training_events: usize,
}

impl VectorStore {
    /// Create an empty store with an untrained index.
    ///
    /// # Parameters
    /// - `dimension`: Length of every vector.
    /// - `nlist`, `nprobe`: IVF parameters, see [`IvfFlatIndex::new`].
    /// - `buffer_size`: Flush threshold.
    pub fn new(dimension: usize, nlist: usize, nprobe: usize, buffer_size: usize) -> Self {
        Self {
            index: IvfFlatIndex::new(dimension, nlist, nprobe),
            buffer: EmbeddingBuffer::default(),
            buffer_size: buffer_size.max(1),
            positions: IndexPositionMap::default(),
            training_events: 0,
        }
    }

    /// Rebuild a store from persisted parts.
    ///
    /// # Errors
    /// Returns a description of the inconsistency if the index is malformed, the
    /// position table does not cover exactly `ntotal` entries, or any vector has
    /// the wrong dimension.
    pub fn from_parts(
        snapshot: IndexSnapshot,
        positions: IndexPositionMap,
        buffer_size: usize,
    ) -> std::result::Result<Self, String> {
        snapshot.index.verify()?;
        if positions.len() != snapshot.index.ntotal() {
            return Err(format!(
                "index holds {} vectors but the position table has {} entries",
                snapshot.index.ntotal(),
                positions.len()
            ));
        }
        let dimension = snapshot.index.dimension();
        if snapshot.pending.vectors.len() != snapshot.pending.turns.len()
            || snapshot.pending.vectors.iter().any(|v| v.len() != dimension)
        {
            return Err("pending buffer is malformed".into());
        }
        Ok(Self {
            index: snapshot.index,
            buffer: snapshot.pending,
            buffer_size: buffer_size.max(1),
            positions,
            training_events: snapshot.training_events,
        })
    }

    /// Point-in-time copy of the persisted state.
    pub fn snapshot(&self) -> (IndexSnapshot, IndexPositionMap) {
        (
            IndexSnapshot {
                index: self.index.clone(),
                pending: self.buffer.clone(),
                training_events: self.training_events,
            },
            self.positions.clone(),
        )
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn ntotal(&self) -> usize {
        self.index.ntotal()
    }

    pub fn is_trained(&self) -> bool {
        self.index.is_trained()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn training_events(&self) -> usize {
        self.training_events
    }

    pub fn positions(&self) -> &IndexPositionMap {
        &self.positions
    }

    /// Turns whose vectors are still buffered, in flush order.
    pub fn pending_turns(&self) -> &[TurnRef] {
        self.buffer.turns()
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.index.set_nprobe(nprobe);
    }

    /// Buffer a vector for `turn`; flushes when the buffer reaches `buffer_size`.
    ///
    /// # Returns
    /// `Some(report)` if this call flushed the buffer.
    ///
    /// # Errors
    /// - [`MemoryError::DimensionMismatch`] if `vector` has the wrong length (nothing is buffered).
    /// - Any error from [`train_and_flush`](Self::train_and_flush); the vector stays buffered.
    pub fn add(&mut self, vector: Vec<f32>, turn: TurnRef) -> Result<Option<FlushReport>> {
        if vector.len() != self.dimension() {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension(),
                actual: vector.len(),
            });
        }
        self.buffer.push(vector, turn);
        if self.buffer.len() >= self.buffer_size {
            return self.train_and_flush().map(Some);
        }
        Ok(None)
    }

    /// Train (first time only), move the buffer into the index, extend the position map.
    ///
    /// # Errors
    /// - [`MemoryError::InsufficientTrainingData`] if the buffer is below `buffer_size`.
    /// - Index errors; on failure the buffer and position map are left untouched.
    pub fn train_and_flush(&mut self) -> Result<FlushReport> {
        if self.buffer.len() < self.buffer_size {
            warn!(
                have = self.buffer.len(),
                need = self.buffer_size,
                "Not enough buffered embeddings to flush"
            );
            return Err(MemoryError::InsufficientTrainingData {
                have: self.buffer.len(),
                need: self.buffer_size,
            });
        }

        let trained = if self.index.is_trained() {
            false
        } else {
            self.index.train(&self.buffer.vectors)?;
            self.training_events += 1;
            true
        };

        let added = self.index.add(&self.buffer.vectors)?;
        self.positions.entries.append(&mut self.buffer.turns);
        self.buffer.vectors.clear();

        info!(
            trained,
            flushed = added.len(),
            ntotal = self.index.ntotal(),
            "Flushed embedding buffer into index"
        );
        Ok(FlushReport { trained, added })
    }

    /// The `top_k` turns of `user_id` closest to `query`.
    ///
    /// Indexed vectors are searched through the IVF index, restricted to the user's
    /// entries; the user's buffered vectors are scanned exactly. Results are merged by
    /// ascending distance. An untrained or empty index yields no results.
    ///
    /// # Errors
    /// [`MemoryError::DimensionMismatch`] for a query of the wrong length.
    pub fn search(&self, query: &[f32], top_k: usize, user_id: &str) -> Result<Vec<Match>> {
        if query.len() != self.dimension() {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension(),
                actual: query.len(),
            });
        }
        if !self.index.is_trained() {
            warn!(user_id, "Index not trained yet; search returns nothing");
            return Ok(Vec::new());
        }
        if self.index.ntotal() == 0 && self.buffer.is_empty() {
            warn!(user_id, "Index is empty; search returns nothing");
            return Ok(Vec::new());
        }

        let owned_by_user = |position: usize| {
            self.positions
                .resolve(position)
                .is_some_and(|turn| turn.user_id == user_id)
        };
        let mut matches: Vec<Match> = self
            .index
            .search_filtered(query, top_k, owned_by_user)?
            .into_iter()
            .filter_map(|n| {
                self.positions.resolve(n.position).map(|turn| Match {
                    turn: turn.clone(),
                    distance: n.distance,
                    index_position: Some(n.position),
                })
            })
            .collect();

        matches.extend(
            self.buffer
                .iter()
                .filter(|(_, turn)| turn.user_id == user_id)
                .map(|(vector, turn)| Match {
                    turn: turn.clone(),
                    distance: l2_squared(query, vector),
                    index_position: None,
                }),
        );

        // Indexed entries precede buffered ones on equal distance.
        matches.sort_by(|a, b| {
            a.distance.total_cmp(&b.distance).then_with(|| {
                match (a.index_position, b.index_position) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => a.turn.position.cmp(&b.turn.position),
                }
            })
        });
        matches.truncate(top_k);
        debug!(user_id, results = matches.len(), "Vector search complete");
        Ok(matches)
    }
}
