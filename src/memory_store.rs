//! # Memory store
//!
//! The public face of the subsystem. [`MemoryStore`] owns the conversation logs, the
//! vector index (with its buffer and position map), the short-term memory and the
//! persistence manager, and is safe to share across threads behind an `Arc`.
//!
//! ## Ingestion
//! `add_to_conversation` appends the turn first; the text record is durable in memory
//! even if embedding later fails. For user turns the embedding is computed *without*
//! holding any lock, then the buffer/threshold/train/flush sequence runs under the
//! vector-store write lock as one unit.
//!
//! ## Query
//! `search` embeds the query, searches the index restricted to the caller's own turns,
//! and resolves each hit back to the caller's conversation log. An untrained index, or a
//! failed embedding, yields an empty result.
//!
//! ## Locking
//! Conversations and vectors each sit behind an `RwLock`. When both are needed (only in
//! [`MemoryStore::save`]) they are taken in that order. Saves are serialized among
//! themselves so an older snapshot can never overwrite a newer one.
//!
//! ## Quick Example
//! ```
//! use std::sync::Arc;
//! use awful_recall::config::RecallConfig;
//! use awful_recall::conversation::Role;
//! use awful_recall::embeddings::HashingEmbedder;
//! use awful_recall::memory_store::MemoryStore;
//!
//! let config = RecallConfig { dimension: 64, buffer_size: 2, ..Default::default() };
//! let store = MemoryStore::in_memory(config, Arc::new(HashingEmbedder::new(64))).unwrap();
//! store.add_to_conversation("alice", Role::User, "hello").unwrap();
//! store.add_to_conversation("alice", Role::User, "goodbye").unwrap();
//! assert_eq!(store.search("alice", "hello", 1).unwrap(), vec!["hello".to_string()]);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::brain::ShortTermMemory;
use crate::config::RecallConfig;
use crate::conversation::{ConversationStore, ConversationTurn, Role, TurnRef};
use crate::embeddings::EmbeddingProvider;
use crate::error::{MemoryError, Result, validate_user_id};
use crate::persistence::{ConversationSnapshot, IndexFile, LoadedState, PersistenceManager};
use crate::vector_store::{FlushReport, IndexPositionMap, IndexSnapshot, VectorStore};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A search result resolved to conversation text.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Position of the turn in the user's log.
    pub position: usize,
    /// Squared L2 distance to the query.
    pub distance: f32,
    pub turn: ConversationTurn,
}

/// Counters describing the store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub users: usize,
    pub turns: usize,
    pub indexed: usize,
    pub pending: usize,
    pub trained: bool,
    pub training_events: usize,
}

/// Conversational memory: per-user logs, semantic index, short-term recall.
pub struct MemoryStore {
    config: RecallConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    conversations: RwLock<ConversationStore>,
    vectors: RwLock<VectorStore>,
    short_term: Mutex<ShortTermMemory>,
    persistence: Option<PersistenceManager>,
    save_lock: Mutex<()>,
    dirty: AtomicBool,
    /// Generation of the last successful save (or of the loaded files).
    generation: AtomicU64,
}

impl MemoryStore {
    /// Open the store persisted under `config.save_path`, or start empty.
    ///
    /// Unreadable state files are logged and ignored; the store then starts empty
    /// (or, if only the vector state is unusable, with conversations but no index).
    ///
    /// # Errors
    /// - [`MemoryError::Config`] for invalid parameters or an embedder whose dimension
    ///   differs from `config.dimension`.
    pub fn open(config: RecallConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let persistence = PersistenceManager::new(&config.save_path, &config.store_name);
        let store = Self::build(config, embedder, Some(persistence.clone()))?;

        match persistence.load() {
            Ok(state) => store.restore(state),
            Err(e) => error!(error = %e, "Failed to load persisted memory; starting empty"),
        }
        Ok(store)
    }

    /// A store that never touches disk; [`save`](Self::save) is a no-op.
    pub fn in_memory(config: RecallConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Self::build(config, embedder, None)
    }

    fn build(
        config: RecallConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        persistence: Option<PersistenceManager>,
    ) -> Result<Self> {
        config.validate()?;
        if embedder.dimension() != config.dimension {
            return Err(MemoryError::Config(format!(
                "embedding model {} produces {}-d vectors but dimension is {}",
                embedder.model_name(),
                embedder.dimension(),
                config.dimension
            )));
        }

        let vectors = VectorStore::new(
            config.dimension,
            config.nlist,
            config.nprobe,
            config.buffer_size,
        );
        let short_term = ShortTermMemory::new(
            config.short_term.max_memories,
            Duration::from_secs(config.short_term.ttl_secs),
        );

        Ok(Self {
            config,
            embedder,
            conversations: RwLock::new(ConversationStore::new()),
            vectors: RwLock::new(vectors),
            short_term: Mutex::new(short_term),
            persistence,
            save_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    fn restore(&self, state: LoadedState) {
        let LoadedState {
            index,
            conversations,
        } = state;
        let snapshot = conversations.unwrap_or_default();
        let generation = snapshot.generation;
        let restored = ConversationStore::from_snapshot(snapshot.users);
        let positions = IndexPositionMap::new(snapshot.index_positions);

        let vectors = match index {
            Some(file) if file.generation != generation => {
                error!(
                    index_generation = file.generation,
                    snapshot_generation = generation,
                    "Index file and conversation snapshot come from different saves; discarding vector state"
                );
                None
            }
            Some(file) => self.restore_vectors(&restored, file.snapshot, positions),
            None if positions.is_empty() => None,
            None => {
                error!(
                    entries = positions.len(),
                    "Position table present but index file missing; discarding vector state"
                );
                None
            }
        };

        info!(
            users = restored.user_count(),
            turns = restored.turn_count(),
            "Restored conversations"
        );
        *write(&self.conversations) = restored;
        self.generation.store(generation, Ordering::Release);
        if let Some(vectors) = vectors {
            *write(&self.vectors) = vectors;
        }
    }

    fn restore_vectors(
        &self,
        conversations: &ConversationStore,
        index: IndexSnapshot,
        positions: IndexPositionMap,
    ) -> Option<VectorStore> {
        let mut vectors = match VectorStore::from_parts(index, positions, self.config.buffer_size) {
            Ok(vectors) => vectors,
            Err(reason) => {
                error!(%reason, "Persisted index is inconsistent; discarding vector state");
                return None;
            }
        };
        if vectors.dimension() != self.config.dimension {
            error!(
                persisted = vectors.dimension(),
                configured = self.config.dimension,
                "Persisted index dimension differs from configuration; discarding vector state"
            );
            return None;
        }
        // Indexed and buffered vectors must each belong to an existing user turn.
        let dangling = vectors
            .positions()
            .entries()
            .iter()
            .chain(vectors.pending_turns())
            .find(|t| {
                !matches!(
                    conversations.resolve(&t.user_id, t.position),
                    Ok(turn) if turn.role == Role::User
                )
            });
        if let Some(turn) = dangling {
            error!(
                user_id = %turn.user_id,
                position = turn.position,
                "Vector state points at a missing or non-user turn; discarding vector state"
            );
            return None;
        }
        vectors.set_nprobe(self.config.nprobe);
        Some(vectors)
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// True when something changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Append a turn to `user_id`'s log; user turns are also embedded and indexed.
    ///
    /// # Returns
    /// The position of the new turn in the user's log.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidUserId`] before anything is stored.
    /// - [`MemoryError::EmbeddingUnavailable`] / [`MemoryError::EmbeddingFailure`] or an
    ///   index error *after* the turn was appended; the turn stays in the log but is not
    ///   searchable.
    pub fn add_to_conversation(
        &self,
        user_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<usize> {
        validate_user_id(user_id)?;
        let content = content.into();

        let position =
            write(&self.conversations).append(user_id, ConversationTurn::new(role, content.clone()));
        self.mark_dirty();
        debug!(user_id, %role, position, "Appended conversation turn");

        if role != Role::User {
            return Ok(position);
        }

        let vector = self.embedder.embed(&content).map_err(|e| {
            error!(user_id, position, error = %e, "Embedding failed; turn stored but not indexed");
            e
        })?;

        let flushed = write(&self.vectors).add(vector, TurnRef::new(user_id, position));
        // A save may have run while the embedding was computed.
        self.mark_dirty();
        match flushed {
            Ok(Some(report)) => info!(
                trained = report.trained,
                flushed = report.added.len(),
                "Embedding buffer flushed"
            ),
            Ok(None) => {}
            Err(e) => {
                error!(user_id, position, error = %e, "Failed to index turn");
                return Err(e);
            }
        }
        Ok(position)
    }

    /// Force a flush of the embedding buffer.
    ///
    /// # Errors
    /// [`MemoryError::InsufficientTrainingData`] unless the buffer is full.
    pub fn train_and_flush(&self) -> Result<FlushReport> {
        let report = write(&self.vectors).train_and_flush()?;
        self.mark_dirty();
        Ok(report)
    }

    /// The user's turns in append order; empty for unknown users.
    ///
    /// # Errors
    /// [`MemoryError::InvalidUserId`] for a blank id.
    pub fn get_conversation_history(&self, user_id: &str) -> Result<Vec<ConversationTurn>> {
        validate_user_id(user_id)?;
        let history = read(&self.conversations).get_history(user_id).to_vec();
        debug!(user_id, turns = history.len(), "Fetched conversation history");
        Ok(history)
    }

    /// A single turn by position.
    ///
    /// # Errors
    /// [`MemoryError::OutOfRange`] outside the user's log.
    pub fn resolve(&self, user_id: &str, position: usize) -> Result<ConversationTurn> {
        validate_user_id(user_id)?;
        read(&self.conversations)
            .resolve(user_id, position)
            .cloned()
    }

    /// Text of up to `top_k` of the user's turns closest to `query`, nearest first.
    ///
    /// # Errors
    /// Only [`MemoryError::InvalidUserId`]; every other failure yields an empty list.
    pub fn search(&self, user_id: &str, query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .search_hits(user_id, query, top_k)?
            .into_iter()
            .map(|hit| hit.turn.content)
            .collect())
    }

    /// Like [`search`](Self::search), with positions and distances.
    pub fn search_hits(&self, user_id: &str, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        validate_user_id(user_id)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if !read(&self.vectors).is_trained() {
            warn!(user_id, "Index not trained yet; no semantic results");
            return Ok(Vec::new());
        }

        let query_vector = match self.embedder.embed(query) {
            Ok(v) => v,
            Err(e) => {
                error!(user_id, error = %e, "Failed to embed search query");
                return Ok(Vec::new());
            }
        };

        let matches = match read(&self.vectors).search(&query_vector, top_k, user_id) {
            Ok(matches) => matches,
            Err(e) => {
                error!(user_id, error = %e, "Vector search failed");
                return Ok(Vec::new());
            }
        };

        let conversations = read(&self.conversations);
        let hits: Vec<SearchHit> = matches
            .into_iter()
            .filter(|m| m.turn.user_id == user_id)
            .filter_map(|m| {
                conversations
                    .resolve(user_id, m.turn.position)
                    .ok()
                    .map(|turn| SearchHit {
                        position: m.turn.position,
                        distance: m.distance,
                        turn: turn.clone(),
                    })
            })
            .take(top_k)
            .collect();

        debug!(user_id, results = hits.len(), "Search complete");
        Ok(hits)
    }

    /// Remember `content` in short-term memory.
    pub fn add_memory(&self, content: impl Into<String>, important: bool) {
        lock(&self.short_term).add_memory(content, important);
    }

    /// Short-term memories containing `query`, case-insensitively.
    pub fn get_relevant_memories(&self, query: &str) -> Vec<String> {
        lock(&self.short_term).get_relevant_memories(query)
    }

    /// Write a point-in-time snapshot to disk.
    ///
    /// The in-memory state stays authoritative whatever happens here.
    ///
    /// # Errors
    /// [`MemoryError::PersistenceFailure`] (already logged).
    pub fn save(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let _saving = lock(&self.save_lock);
        let generation = self.generation.load(Ordering::Acquire) + 1;

        let (users, (index, positions)) = {
            let conversations = read(&self.conversations);
            let vectors = read(&self.vectors);
            (conversations.to_snapshot(), vectors.snapshot())
        };
        // Cleared before writing so mutations during the write mark it again.
        self.dirty.store(false, Ordering::Release);

        let index = IndexFile {
            generation,
            snapshot: index,
        };
        let snapshot = ConversationSnapshot {
            generation,
            users,
            index_positions: positions.entries().to_vec(),
        };
        persistence.save(&index, &snapshot).map_err(|e| {
            self.mark_dirty();
            error!(error = %e, "Failed to save memory store");
            e
        })?;
        self.generation.store(generation, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let (users, turns) = {
            let conversations = read(&self.conversations);
            (conversations.user_count(), conversations.turn_count())
        };
        let vectors = read(&self.vectors);
        StoreStats {
            users,
            turns,
            indexed: vectors.ntotal(),
            pending: vectors.pending(),
            trained: vectors.is_trained(),
            training_events: vectors.training_events(),
        }
    }
}
