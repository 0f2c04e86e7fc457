//! # Brain module (short-term memory)
//!
//! The **brain** is a small in-process scratch memory that complements the vector index.
//! It is intentionally simple:
//!
//! - Stores a bounded queue (`VecDeque`) of [`MemoryEntry`] items; the oldest entry is
//!   evicted when capacity is exceeded, regardless of importance or age.
//! - Recalls by case-insensitive substring match, in storage order.
//! - Entries not marked `important` stop being recalled once older than the TTL.
//!   Expiry is lazy: expired entries stay in the queue until capacity pushes them out.
//!
//! The module does no embedding, ranking or I/O.
//!
//! ## Quick start
//! ```rust
//! use awful_recall::brain::ShortTermMemory;
//! use std::time::Duration;
//!
//! let mut brain = ShortTermMemory::new(2, Duration::from_secs(3600));
//! brain.add_memory("a", false);
//! brain.add_memory("b", false);
//! brain.add_memory("c", false);
//! assert!(brain.get_relevant_memories("a").is_empty());
//! assert_eq!(brain.get_relevant_memories("C"), vec!["c".to_string()]);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// A single short-term memory item.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MemoryEntry {
    /// The textual content of the memory.
    pub content: String,
    /// When the memory was added.
    pub created_at: DateTime<Utc>,
    /// Important memories never expire (they can still be evicted by capacity).
    pub important: bool,
}

impl MemoryEntry {
    /// Whether this entry is still recallable at `now`.
    fn is_live(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.important || now - self.created_at <= ttl
    }
}

/// Bounded, time-boxed scratch memory.
#[derive(Debug, Clone)]
pub struct ShortTermMemory {
    /// FIFO store of memories (oldest at the front).
    memories: VecDeque<MemoryEntry>,
    max_memories: usize,
    ttl: chrono::Duration,
}

impl ShortTermMemory {
    /// Create an empty memory holding at most `max_memories` entries.
    ///
    /// A TTL too large for `chrono` is treated as "never expires".
    pub fn new(max_memories: usize, ttl: Duration) -> Self {
        Self {
            memories: VecDeque::with_capacity(max_memories.min(1024)),
            max_memories: max_memories.max(1),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Add a memory stamped with the current time.
    pub fn add_memory(&mut self, content: impl Into<String>, important: bool) {
        self.add_memory_at(content, important, Utc::now());
    }

    /// Add a memory with an explicit timestamp.
    pub fn add_memory_at(
        &mut self,
        content: impl Into<String>,
        important: bool,
        created_at: DateTime<Utc>,
    ) {
        self.memories.push_back(MemoryEntry {
            content: content.into(),
            created_at,
            important,
        });
        while self.memories.len() > self.max_memories {
            if let Some(evicted) = self.memories.pop_front() {
                tracing::debug!(important = evicted.important, "Evicted oldest short-term memory");
            }
        }
    }

    /// Contents of every live entry containing `query` (case-insensitive), in storage order.
    pub fn get_relevant_memories(&self, query: &str) -> Vec<String> {
        self.get_relevant_memories_at(query, Utc::now())
    }

    /// [`get_relevant_memories`](Self::get_relevant_memories) evaluated at `now`.
    pub fn get_relevant_memories_at(&self, query: &str, now: DateTime<Utc>) -> Vec<String> {
        let needle = query.to_lowercase();
        self.memories
            .iter()
            .filter(|m| m.is_live(now, self.ttl))
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .map(|m| m.content.clone())
            .collect()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut brain = ShortTermMemory::new(2, Duration::from_secs(60));
        brain.add_memory_at("a", true, at(0));
        brain.add_memory_at("b", false, at(1));
        brain.add_memory_at("c", false, at(2));

        assert_eq!(brain.len(), 2);
        assert!(brain.get_relevant_memories_at("a", at(3)).is_empty());
        assert_eq!(brain.get_relevant_memories_at("b", at(3)), vec!["b"]);
        assert_eq!(brain.get_relevant_memories_at("c", at(3)), vec!["c"]);
    }

    #[test]
    fn non_important_entries_expire_lazily() {
        let mut brain = ShortTermMemory::new(10, Duration::from_secs(60));
        brain.add_memory_at("coffee order", false, at(0));

        assert_eq!(brain.get_relevant_memories_at("coffee", at(60)).len(), 1);
        assert!(brain.get_relevant_memories_at("coffee", at(61)).is_empty());
        // Still stored until capacity pressure removes it.
        assert_eq!(brain.len(), 1);
    }

    #[test]
    fn important_entries_never_expire() {
        let mut brain = ShortTermMemory::new(10, Duration::from_secs(60));
        brain.add_memory_at("Allergic to peanuts", true, at(0));
        assert_eq!(
            brain.get_relevant_memories_at("PEANUT", at(1_000_000)),
            vec!["Allergic to peanuts"]
        );
    }

    #[test]
    fn results_keep_storage_order() {
        let mut brain = ShortTermMemory::new(10, Duration::from_secs(60));
        brain.add_memory_at("red apple", false, at(0));
        brain.add_memory_at("green pear", false, at(1));
        brain.add_memory_at("Apple pie", false, at(2));
        assert_eq!(
            brain.get_relevant_memories_at("apple", at(3)),
            vec!["red apple", "Apple pie"]
        );
    }

    #[test]
    fn empty_query_matches_every_live_entry() {
        let mut brain = ShortTermMemory::new(10, Duration::from_secs(5));
        brain.add_memory_at("old", false, at(0));
        brain.add_memory_at("new", false, at(10));
        assert_eq!(brain.get_relevant_memories_at("", at(12)), vec!["new"]);
    }
}
