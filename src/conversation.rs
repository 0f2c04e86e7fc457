//! # Conversation log
//!
//! Per-user, append-only dialogue history. This is the source of truth for turn
//! content; the vector index only ever points back into it by `(user_id, position)`.
//!
//! Logs grow without bound. Nothing here truncates or deletes turns, since that would
//! change what [`ConversationStore::get_history`] reports.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{MemoryError, Result};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role {other:?} (expected user or assistant)")),
        }
    }
}

/// A single dialogue turn. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Pointer from the vector index back into a conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnRef {
    pub user_id: String,
    pub position: usize,
}

impl TurnRef {
    pub fn new(user_id: impl Into<String>, position: usize) -> Self {
        Self {
            user_id: user_id.into(),
            position,
        }
    }
}

/// All users' logs, keyed by user id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStore {
    logs: HashMap<String, Vec<ConversationTurn>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn to `user_id`'s log and return its 0-based position.
    pub fn append(&mut self, user_id: &str, turn: ConversationTurn) -> usize {
        let log = self.logs.entry(user_id.to_string()).or_default();
        log.push(turn);
        log.len() - 1
    }

    /// The user's turns in append order; empty for unknown users.
    pub fn get_history(&self, user_id: &str) -> &[ConversationTurn] {
        self.logs.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The turn at `position` in `user_id`'s log.
    ///
    /// # Errors
    /// [`MemoryError::OutOfRange`] if the position is past the end of the log
    /// (every position is out of range for an unknown user).
    pub fn resolve(&self, user_id: &str, position: usize) -> Result<&ConversationTurn> {
        let log = self.get_history(user_id);
        log.get(position).ok_or_else(|| MemoryError::OutOfRange {
            user_id: user_id.to_string(),
            position,
            len: log.len(),
        })
    }

    pub fn user_count(&self) -> usize {
        self.logs.len()
    }

    pub fn turn_count(&self) -> usize {
        self.logs.values().map(Vec::len).sum()
    }

    /// Sorted copy of every log, for snapshots.
    pub fn to_snapshot(&self) -> BTreeMap<String, Vec<ConversationTurn>> {
        self.logs
            .iter()
            .map(|(user, log)| (user.clone(), log.clone()))
            .collect()
    }

    pub fn from_snapshot(users: BTreeMap<String, Vec<ConversationTurn>>) -> Self {
        Self {
            logs: users.into_iter().collect(),
        }
    }
}
