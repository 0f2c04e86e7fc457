//! # IVF-Flat index
//!
//! An inverted-file approximate nearest-neighbor index over `f32` vectors with
//! squared-L2 distance.
//!
//! The index is a two-state machine:
//!
//! ```text
//! Untrained ──train(samples)──▶ Trained { centroids }
//! ```
//!
//! Training runs k-means over a sample to obtain the coarse quantizer (one centroid
//! per bucket). Only a trained index accepts [`add`](IvfFlatIndex::add) and
//! [`search`](IvfFlatIndex::search). Each added vector is stored, uncompressed, in the
//! bucket of its nearest centroid. A query scans the `nprobe` buckets whose centroids
//! are closest to it.
//!
//! Vectors are identified by their *global position*: the 0-based order in which they
//! were added.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};

/// Upper bound on Lloyd iterations during training.
const MAX_KMEANS_ITERATIONS: usize = 25;

/// Training state of the coarse quantizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexState {
    Untrained,
    Trained { centroids: Vec<Vec<f32>> },
}

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Global position of the stored vector.
    pub position: usize,
    /// Squared L2 distance to the query.
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct InvertedList {
    positions: Vec<usize>,
    /// Row-major, `positions.len() * dimension` values.
    vectors: Vec<f32>,
}

/// Inverted-file index with flat (uncompressed) storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfFlatIndex {
    dimension: usize,
    nlist: usize,
    nprobe: usize,
    state: IndexState,
    lists: Vec<InvertedList>,
    ntotal: usize,
}

/// Squared Euclidean distance between two equal-length vectors.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index and distance of the centroid closest to `vector`; ties go to the lower index.
fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> (usize, f32) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, l2_squared(c, vector)))
        .fold((0, f32::INFINITY), |best, cur| {
            if cur.1 < best.1 { cur } else { best }
        })
}

impl IvfFlatIndex {
    /// Create an untrained index.
    ///
    /// # Parameters
    /// - `dimension`: Length of every vector.
    /// - `nlist`: Number of buckets requested at training time.
    /// - `nprobe`: Number of buckets scanned per query.
    pub fn new(dimension: usize, nlist: usize, nprobe: usize) -> Self {
        Self {
            dimension,
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            state: IndexState::Untrained,
            lists: Vec::new(),
            ntotal: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of vectors added since training.
    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    pub fn is_trained(&self) -> bool {
        matches!(self.state, IndexState::Trained { .. })
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    /// Buckets actually in use (0 while untrained).
    pub fn bucket_count(&self) -> usize {
        match &self.state {
            IndexState::Untrained => 0,
            IndexState::Trained { centroids } => centroids.len(),
        }
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.nprobe = nprobe.max(1);
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Train the coarse quantizer with k-means over `samples`.
    ///
    /// The bucket count is `min(nlist, samples.len())`. Seeds are evenly spaced
    /// samples, so training is deterministic for a given sample.
    ///
    /// # Errors
    /// - [`MemoryError::IndexAlreadyTrained`] if called twice.
    /// - [`MemoryError::InsufficientTrainingData`] for an empty sample.
    /// - [`MemoryError::DimensionMismatch`] if any sample has the wrong length.
    pub fn train(&mut self, samples: &[Vec<f32>]) -> Result<()> {
        if self.is_trained() {
            return Err(MemoryError::IndexAlreadyTrained);
        }
        if samples.is_empty() {
            return Err(MemoryError::InsufficientTrainingData { have: 0, need: 1 });
        }
        for sample in samples {
            self.check_dimension(sample)?;
        }

        let k = self.nlist.min(samples.len());
        if k < self.nlist {
            warn!(
                requested = self.nlist,
                using = k,
                samples = samples.len(),
                "Fewer training samples than buckets; clamping nlist"
            );
        }

        let centroids = self.kmeans(samples, k);
        self.lists = vec![InvertedList::default(); centroids.len()];
        self.state = IndexState::Trained { centroids };
        info!(buckets = k, samples = samples.len(), "IVF index trained");
        Ok(())
    }

    fn kmeans(&self, samples: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
        let n = samples.len();
        let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| samples[i * n / k].clone()).collect();
        let mut assignment = vec![usize::MAX; n];

        for iteration in 0..MAX_KMEANS_ITERATIONS {
            let next: Vec<usize> = samples
                .par_iter()
                .map(|s| nearest_centroid(&centroids, s).0)
                .collect();
            let changed = next
                .iter()
                .zip(&assignment)
                .filter(|(a, b)| a != b)
                .count();
            assignment = next;

            let mut sums = vec![vec![0f32; self.dimension]; k];
            let mut counts = vec![0usize; k];
            for (sample, &bucket) in samples.iter().zip(&assignment) {
                counts[bucket] += 1;
                for (acc, v) in sums[bucket].iter_mut().zip(sample) {
                    *acc += v;
                }
            }
            // Empty buckets keep their previous centroid.
            for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
                if count > 0 {
                    *centroid = sum.into_iter().map(|v| v / count as f32).collect();
                }
            }

            debug!(iteration, changed, "k-means iteration");
            if changed == 0 {
                break;
            }
        }
        centroids
    }

    /// Add vectors in order; returns the global positions assigned to them.
    ///
    /// All-or-nothing: every vector is validated before the first insert.
    ///
    /// # Errors
    /// - [`MemoryError::IndexUntrained`] before training.
    /// - [`MemoryError::DimensionMismatch`] if any vector has the wrong length.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<Range<usize>> {
        let IndexState::Trained { centroids } = &self.state else {
            return Err(MemoryError::IndexUntrained);
        };
        for vector in vectors {
            self.check_dimension(vector)?;
        }

        let buckets: Vec<usize> = vectors
            .par_iter()
            .map(|v| nearest_centroid(centroids, v).0)
            .collect();

        let start = self.ntotal;
        for (offset, (vector, bucket)) in vectors.iter().zip(buckets).enumerate() {
            let list = &mut self.lists[bucket];
            list.positions.push(start + offset);
            list.vectors.extend_from_slice(vector);
        }
        self.ntotal += vectors.len();
        debug!(added = vectors.len(), ntotal = self.ntotal, "Added vectors to IVF index");
        Ok(start..self.ntotal)
    }

    /// The `k` nearest stored vectors, by ascending distance.
    ///
    /// # Errors
    /// - [`MemoryError::IndexUntrained`] before training.
    /// - [`MemoryError::DimensionMismatch`] for a query of the wrong length.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_filtered(query, k, |_| true)
    }

    /// Like [`search`](Self::search), restricted to positions accepted by `filter`.
    ///
    /// The filter is applied while scanning, so up to `k` accepted results are
    /// returned whenever the probed buckets hold that many.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, filter: F) -> Result<Vec<Neighbor>>
    where
        F: Fn(usize) -> bool + Sync,
    {
        let IndexState::Trained { centroids } = &self.state else {
            return Err(MemoryError::IndexUntrained);
        };
        self.check_dimension(query)?;
        if k == 0 || self.ntotal == 0 {
            return Ok(Vec::new());
        }

        let mut order: Vec<(usize, f32)> = centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, l2_squared(c, query)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        order.truncate(self.nprobe);

        let dimension = self.dimension;
        let filter = &filter;
        let mut hits: Vec<Neighbor> = order
            .par_iter()
            .flat_map_iter(|&(bucket, _)| {
                let list = &self.lists[bucket];
                list.positions
                    .iter()
                    .zip(list.vectors.chunks_exact(dimension))
                    .filter(move |(position, _)| filter(**position))
                    .map(move |(&position, vector)| Neighbor {
                        position,
                        distance: l2_squared(query, vector),
                    })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Check the structural invariants of a deserialized index.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let stored: usize = self.lists.iter().map(|l| l.positions.len()).sum();
        if stored != self.ntotal {
            return Err(format!("ntotal {} but {} stored vectors", self.ntotal, stored));
        }
        if self.lists.len() != self.bucket_count() {
            return Err(format!(
                "{} inverted lists for {} centroids",
                self.lists.len(),
                self.bucket_count()
            ));
        }
        if let IndexState::Trained { centroids } = &self.state {
            if centroids.iter().any(|c| c.len() != self.dimension) {
                return Err("centroid dimension mismatch".into());
            }
        }
        if self
            .lists
            .iter()
            .any(|l| l.vectors.len() != l.positions.len() * self.dimension)
        {
            return Err("inverted list length mismatch".into());
        }
        Ok(())
    }
}
