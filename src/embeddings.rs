//! # Embeddings
//!
//! Text → fixed-dimension vector providers.
//!
//! The store treats embedding as an opaque function behind [`EmbeddingProvider`].
//! Two implementations ship with the crate:
//!
//! - [`SentenceEmbeddings`]: a BERT sentence model run with Candle (pure Rust).
//!   Weights come from a local directory or from the Hugging Face hub. Outputs are
//!   mean-pooled over the attention mask and L2-normalized.
//! - [`HashingEmbedder`]: a model-free, deterministic bag-of-words hasher. Identical
//!   text always maps to the identical vector, which is what tests and offline setups need.
//!
//! A model that fails to load does not abort construction: the provider is still
//! returned and every [`embed`](EmbeddingProvider::embed) call reports
//! [`MemoryError::EmbeddingUnavailable`].

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, error, info};

use crate::config::{EmbeddingBackend, EmbeddingConfig, RecallConfig};
use crate::error::{MemoryError, Result};

/// Opaque text → vector function.
///
/// Implementations must be deterministic for identical input within a process.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    ///
    /// # Errors
    /// - [`MemoryError::EmbeddingUnavailable`] if the underlying model never loaded.
    /// - [`MemoryError::EmbeddingFailure`] if this particular input could not be embedded.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector returned by [`embed`](Self::embed).
    fn dimension(&self) -> usize;

    /// Human-readable model identifier, used in logs.
    fn model_name(&self) -> &str;
}

/// Build the provider selected by `config.embedding.backend`.
pub fn provider_from_config(config: &RecallConfig) -> Arc<dyn EmbeddingProvider> {
    match config.embedding.backend {
        EmbeddingBackend::Candle => {
            Arc::new(SentenceEmbeddings::new(&config.embedding, config.dimension))
        }
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
    }
}

/// Sentence embeddings model using Candle (pure Rust)
pub struct SentenceEmbeddingsModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    hidden_size: usize,
}

impl SentenceEmbeddingsModel {
    /// Load the model from a local directory, or from the Hugging Face Hub when
    /// `config.model_path` is unset.
    pub fn load(config: &EmbeddingConfig) -> Result<Self, Box<dyn Error>> {
        let device = Device::Cpu;

        let (config_filename, tokenizer_filename, weights_filename) = match &config.model_path {
            Some(dir) => Self::local_files(dir)?,
            None => {
                let repo = Repo::with_revision(
                    config.model_id.clone(),
                    RepoType::Model,
                    config.revision.clone(),
                );
                let api = Api::new()?;
                let api_repo = api.repo(repo);
                (
                    api_repo.get("config.json")?,
                    api_repo.get("tokenizer.json")?,
                    api_repo.get("model.safetensors")?,
                )
            }
        };

        let raw_config = std::fs::read_to_string(config_filename)?;
        let bert_config: Config = serde_json::from_str(&raw_config)?;
        let hidden_size = serde_json::from_str::<serde_json::Value>(&raw_config)?
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .ok_or("config.json has no hidden_size")? as usize;

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| format!("Failed to load tokenizer: {}", e))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| format!("Failed to configure truncation: {}", e))?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? };
        let model = BertModel::load(vb, &bert_config)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            hidden_size,
        })
    }

    fn local_files(dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf), Box<dyn Error>> {
        let files = ["config.json", "tokenizer.json", "model.safetensors"].map(|f| dir.join(f));
        if let Some(missing) = files.iter().find(|p| !p.is_file()) {
            return Err(format!("model file not found: {}", missing.display()).into());
        }
        let [config, tokenizer, weights] = files;
        Ok((config, tokenizer, weights))
    }

    /// Width of the pooled output.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Encode text into an embedding
    pub fn encode(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error>> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| format!("Tokenization error: {}", e))?;
        if tokens.get_ids().is_empty() {
            return Err("input produced no tokens".into());
        }

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;
        let embedding = self.mean_pooling(&output, tokens.get_attention_mask())?;
        let embedding = self.normalize(&embedding)?;

        Ok(embedding.to_vec1::<f32>()?)
    }

    /// Mean pooling over token embeddings, considering attention mask
    fn mean_pooling(
        &self,
        embeddings: &Tensor,
        attention_mask: &[u32],
    ) -> Result<Tensor, Box<dyn Error>> {
        // embeddings: [1, seq_len, hidden]; mask must broadcast as [1, seq_len, 1]
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let masked = embeddings.broadcast_mul(&mask)?;
        let sum = masked.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        let mean = sum.broadcast_div(&count)?;

        Ok(mean.squeeze(0)?)
    }

    /// L2 normalize the embedding vector
    fn normalize(&self, tensor: &Tensor) -> Result<Tensor, Box<dyn Error>> {
        let norm = tensor.sqr()?.sum_all()?.sqrt()?;
        Ok(tensor.broadcast_div(&norm)?)
    }
}

/// [`EmbeddingProvider`] backed by a [`SentenceEmbeddingsModel`].
///
/// Holds the load failure instead of the model when loading did not succeed.
pub struct SentenceEmbeddings {
    model: std::result::Result<SentenceEmbeddingsModel, String>,
    dimension: usize,
    model_name: String,
}

impl SentenceEmbeddings {
    /// Load the configured model. Never fails: a load error is logged and kept.
    ///
    /// # Parameters
    /// - `config`: Model location and tokenizer settings.
    /// - `dimension`: The store's fixed dimension; a model with another hidden size
    ///   is treated as unavailable.
    pub fn new(config: &EmbeddingConfig, dimension: usize) -> Self {
        let model_name = config
            .model_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| config.model_id.clone());

        info!(model = %model_name, "Loading embedding model");
        let model = match SentenceEmbeddingsModel::load(config) {
            Ok(model) if model.hidden_size() != dimension => Err(format!(
                "model produces {}-d vectors but the store expects {}",
                model.hidden_size(),
                dimension
            )),
            Ok(model) => Ok(model),
            Err(e) => Err(e.to_string()),
        };

        match &model {
            Ok(_) => info!(model = %model_name, dimension, "Embedding model loaded"),
            Err(reason) => error!(model = %model_name, %reason, "Embedding model failed to load"),
        }

        Self {
            model,
            dimension,
            model_name,
        }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_ok()
    }
}

impl EmbeddingProvider for SentenceEmbeddings {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .model
            .as_ref()
            .map_err(|reason| MemoryError::EmbeddingUnavailable(reason.clone()))?;
        let vector = model
            .encode(text)
            .map_err(|e| MemoryError::EmbeddingFailure(e.to_string()))?;
        debug!(chars = text.len(), "Generated embedding");
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("static regex"));

/// Deterministic feature-hashing embedder.
///
/// Each lowercase word (and, for non-ASCII words, each character) is hashed with
/// BLAKE3 into a signed bucket; the bucket counts are L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// A zero `dimension` is raised to 1.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn accumulate(&self, feature: &str, vector: &mut [f32]) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        let mut vector = vec![0f32; self.dimension];
        let mut features = 0usize;

        for word in WORD.find_iter(&lowered).map(|m| m.as_str()) {
            self.accumulate(word, &mut vector);
            features += 1;
            if !word.is_ascii() {
                let mut buf = [0u8; 4];
                for ch in word.chars() {
                    self.accumulate(ch.encode_utf8(&mut buf), &mut vector);
                    features += 1;
                }
            }
        }

        if features == 0 {
            return Err(MemoryError::EmbeddingFailure(
                "input contains no word tokens".into(),
            ));
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "blake3-hashing"
    }
}
