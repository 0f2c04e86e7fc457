//! This module provides functionality for loading and handling the memory store's configuration.
//!
//! It defines the [`RecallConfig`] struct, which holds the configuration parameters,
//! and a [`load_config`] function to load the configuration from a YAML file.
//! Every field has a default, so a partial file (or an empty one) is valid.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use awful_recall::config::{RecallConfig, load_config};
//!
//! let config_file_path = "/path/to/config.yaml";
//! let config: RecallConfig = load_config(config_file_path).unwrap();
//! println!("{:?}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use tracing::*;

use crate::error::{MemoryError, Result};

/// Which embedding implementation backs the store.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// A BERT sentence model run through candle.
    #[default]
    Candle,
    /// Deterministic feature hashing; no model download.
    Hashing,
}

/// Embedding model settings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,

    /// Hugging Face repository id of the sentence model.
    pub model_id: String,

    /// Repository revision (branch, tag or commit).
    pub revision: String,

    /// Local directory holding `config.json`, `tokenizer.json` and `model.safetensors`.
    /// When set, the hub is never contacted.
    pub model_path: Option<PathBuf>,

    /// Inputs are truncated to this many tokens.
    pub max_seq_length: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Candle,
            model_id: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            revision: "main".to_string(),
            model_path: None,
            max_seq_length: 128,
        }
    }
}

/// Short-term memory settings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ShortTermConfig {
    pub max_memories: usize,
    pub ttl_secs: u64,
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            max_memories: 1000,
            ttl_secs: 3600,
        }
    }
}

/// Represents the memory store's configuration.
///
/// This struct holds the parameters needed to build a [`MemoryStore`](crate::memory_store::MemoryStore):
/// the vector dimension, the training threshold, IVF parameters, where state files live,
/// and the embedding and short-term memory sections.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RecallConfig {
    /// Dimension of every embedding; must match the embedding model.
    pub dimension: usize,

    /// Number of buffered user-turn embeddings that triggers training / a flush.
    pub buffer_size: usize,

    /// Number of IVF buckets requested at training time.
    pub nlist: usize,

    /// Number of IVF buckets visited per query.
    pub nprobe: usize,

    /// Directory holding the index file and the conversation snapshot.
    pub save_path: PathBuf,

    /// Prefix for the state files (several stores can share a directory).
    pub store_name: String,

    /// Debounce window for background saves.
    pub autosave_interval_secs: u64,

    pub embedding: EmbeddingConfig,

    pub short_term: ShortTermConfig,
}

impl Default for RecallConfig {
    fn default() -> Self {
        let save_path = crate::config_dir()
            .map(|dir| dir.join("store"))
            .unwrap_or_else(|_| PathBuf::from("./vector_store"));

        Self {
            dimension: 384,
            buffer_size: 100,
            nlist: 100,
            nprobe: 8,
            save_path,
            store_name: "default".to_string(),
            autosave_interval_secs: 5,
            embedding: EmbeddingConfig::default(),
            short_term: ShortTermConfig::default(),
        }
    }
}

impl RecallConfig {
    /// Check that every numeric parameter is usable.
    ///
    /// # Errors
    /// Returns [`MemoryError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("dimension", self.dimension),
            ("buffer_size", self.buffer_size),
            ("nlist", self.nlist),
            ("nprobe", self.nprobe),
            ("short_term.max_memories", self.short_term.max_memories),
            ("embedding.max_seq_length", self.embedding.max_seq_length),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(MemoryError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.store_name.trim().is_empty() {
            return Err(MemoryError::Config("store_name must not be empty".into()));
        }
        Ok(())
    }
}

/// Loads the configuration from a YAML file.
///
/// This function reads the file at the given path, parses it as YAML, and
/// validates the result.
///
/// # Parameters
///
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
///
/// - `Ok(RecallConfig)`: The loaded configuration.
/// - `Err(MemoryError)`: The file could not be read, parsed, or failed validation.
///
/// # Examples
///
/// ```no_run
/// use awful_recall::config::load_config;
///
/// match load_config("/path/to/config.yaml") {
///     Ok(config) => println!("{:?}", config),
///     Err(err) => eprintln!("Error loading config: {}", err),
/// }
/// ```
pub fn load_config(file: &str) -> Result<RecallConfig> {
    debug!(path = file, "Loading config");
    let content = fs::read_to_string(file).map_err(|e| MemoryError::Config(format!("{file}: {e}")))?;
    let config: RecallConfig =
        serde_yaml::from_str(&content).map_err(|e| MemoryError::Config(format!("{file}: {e}")))?;
    config.validate()?;
    Ok(config)
}
