//! # Awful Recall (library root)
//!
//! Conversational memory for a chat service. The crate stores per-user dialogue turns,
//! builds a semantic index over user utterances and answers nearest-neighbor queries
//! to pull relevant past turns back into a conversation.
//!
//! - Per-user append-only conversation logs (`conversation`).
//! - Text embeddings with Candle or a model-free hasher (`embeddings`).
//! - A trainable inverted-file ANN index (`ivf`) fed through a buffering trainer
//!   that maps index positions back to turns (`vector_store`).
//! - Atomic two-file persistence (`persistence`) and debounced background saves (`autosave`).
//! - A bounded, TTL-based short-term memory with substring recall (`brain`).
//! - The thread-safe orchestrator tying it all together (`memory_store`).
//! - CLI parsing & configuration (`commands`, `config`).
//!
//! ## Flow
//! ```text
//! add_to_conversation ─▶ ConversationStore.append
//!                        └─(user turn)─▶ embed ─▶ buffer ─(full)─▶ train once / add ─▶ position map
//! search ─▶ embed(query) ─▶ IVF search (caller's turns only) ─▶ resolve ─▶ ranked text
//! ```
//!
//! ## Modules
//! - [`autosave`], [`brain`], [`commands`], [`config`], [`conversation`], [`embeddings`],
//!   [`error`], [`ivf`], [`memory_store`], [`persistence`], [`vector_store`]

use directories::ProjectDirs;
use std::error::Error;

pub mod autosave;
pub mod brain;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod ivf;
pub mod memory_store;
pub mod persistence;
pub mod vector_store;

pub use error::{MemoryError, Result};
pub use memory_store::MemoryStore;

/// Return the per-platform configuration directory used by Awful Recall.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "awful-sec", "ajr")`, so you get the right place on each OS
/// (e.g., `~/Library/Application Support/com.awful-sec.ajr` on macOS).
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = awful_recall::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> std::result::Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "awful-sec", "ajr")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
