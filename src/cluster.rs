//! Cluster
//!
//! Agglomerative clustering of latent means cut by a distance threshold, the retry
//! loop that relaxes the threshold until every cluster is large enough, and the
//! resulting assignment of samples to clusters.
use crate::config::Linkage;
use crate::constants::CLUSTER_MAX_RETRIES;
use crate::context::ExecutionContext;
use crate::data::{DataSplit, Matrix, SplitKind};
use crate::errors::FairVaeError;
use crate::model::{with_inference, LatentModel};
use crate::sampler::{batch_ranges, Sampler, SortedSampler};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Pairwise distances of `n` points, upper triangle stored row by row.
struct CondensedMatrix {
    n: usize,
    values: Vec<f64>,
}

impl CondensedMatrix {
    fn euclidean(points: &Matrix) -> Self {
        let n = points.rows;
        let mut values = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            let a = points.row(i);
            for j in (i + 1)..n {
                let b = points.row(j);
                let d2: f64 = a.iter().zip(b).map(|(x, y)| ((x - y) as f64).powi(2)).sum();
                values.push(d2.sqrt());
            }
        }
        CondensedMatrix { n, values }
    }

    fn index(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        self.n * i - i * (i + 1) / 2 + j - i - 1
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.values[self.index(i, j)]
    }

    fn set(&mut self, i: usize, j: usize, v: f64) {
        let k = self.index(i, j);
        self.values[k] = v;
    }
}

/// Lance-Williams update: distance from `k` to the union of `i` and `j`.
fn lance_williams(linkage: Linkage, d_ik: f64, d_jk: f64, d_ij: f64, n_i: f64, n_j: f64, n_k: f64) -> f64 {
    match linkage {
        Linkage::Single => d_ik.min(d_jk),
        Linkage::Complete => d_ik.max(d_jk),
        Linkage::Average => (n_i * d_ik + n_j * d_jk) / (n_i + n_j),
        Linkage::Ward => {
            let t = n_i + n_j + n_k;
            (((n_i + n_k) * d_ik * d_ik + (n_j + n_k) * d_jk * d_jk - n_k * d_ij * d_ij) / t)
                .max(0.0)
                .sqrt()
        }
    }
}

/// One merge of the dendrogram. `a` and `b` are the slots of the two merged clusters,
/// named after one of their original points; the union keeps slot `b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub a: usize,
    pub b: usize,
    pub height: f64,
    pub size: usize,
}

/// Full merge history of `n` points. Heights are monotone for every supported linkage.
#[derive(Debug, Clone, PartialEq)]
pub struct Dendrogram {
    pub n: usize,
    pub merges: Vec<Merge>,
}

impl Dendrogram {
    /// Build the dendrogram with the nearest-neighbour chain algorithm.
    pub fn build(points: &Matrix, linkage: Linkage) -> Self {
        let n = points.rows;
        let mut dist = CondensedMatrix::euclidean(points);
        let mut size = vec![1usize; n];
        let mut active = vec![true; n];
        let mut chain: Vec<usize> = Vec::with_capacity(n);
        let mut merges = Vec::with_capacity(n.saturating_sub(1));

        for _ in 1..n {
            if chain.is_empty() {
                if let Some(first) = active.iter().position(|a| *a) {
                    chain.push(first);
                }
            }
            let (a, b) = loop {
                let x = chain[chain.len() - 1];
                let prev = if chain.len() >= 2 { Some(chain[chain.len() - 2]) } else { None };
                // Ties prefer the previous chain element so the chain terminates.
                let mut best = prev;
                let mut best_d = prev.map_or(f64::INFINITY, |p| dist.get(x, p));
                for y in 0..n {
                    if y == x || !active[y] {
                        continue;
                    }
                    let d = dist.get(x, y);
                    if d < best_d {
                        best_d = d;
                        best = Some(y);
                    }
                }
                let y = match best {
                    Some(y) => y,
                    None => break (x, x),
                };
                if Some(y) == prev {
                    chain.pop();
                    chain.pop();
                    break (x, y);
                }
                chain.push(y);
            };
            if a == b {
                break;
            }

            let d_ab = dist.get(a, b);
            let (n_a, n_b) = (size[a] as f64, size[b] as f64);
            active[a] = false;
            for k in 0..n {
                if !active[k] || k == b {
                    continue;
                }
                let updated = lance_williams(linkage, dist.get(a, k), dist.get(b, k), d_ab, n_a, n_b, size[k] as f64);
                dist.set(b, k, updated);
            }
            size[b] += size[a];
            merges.push(Merge {
                a,
                b,
                height: d_ab,
                size: size[b],
            });
        }
        merges.sort_by(|x, y| x.height.total_cmp(&y.height));
        Dendrogram { n, merges }
    }

    /// Flat clusters obtained by applying every merge lower than `threshold`.
    /// Cluster ids are numbered in order of first appearance.
    pub fn cut(&self, threshold: f64) -> Vec<usize> {
        let mut parent: Vec<usize> = (0..self.n).collect();
        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }
        for m in self.merges.iter().take_while(|m| m.height < threshold) {
            let ra = find(&mut parent, m.a);
            let rb = find(&mut parent, m.b);
            if ra != rb {
                parent[ra] = rb;
            }
        }
        let mut ids = vec![usize::MAX; self.n];
        let mut labels = Vec::with_capacity(self.n);
        let mut next = 0;
        for i in 0..self.n {
            let root = find(&mut parent, i);
            if ids[root] == usize::MAX {
                ids[root] = next;
                next += 1;
            }
            labels.push(ids[root]);
        }
        labels
    }
}

/// Number of members of every cluster id.
pub fn cluster_sizes(labels: &[usize]) -> Vec<usize> {
    let n_clusters = labels.iter().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0; n_clusters];
    for l in labels {
        sizes[*l] += 1;
    }
    sizes
}

/// Labels of a successful clustering and the threshold that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    pub labels: Vec<usize>,
    pub threshold: f64,
    pub attempts: usize,
}

/// Cluster `points`, doubling the threshold until every cluster holds at least
/// `min_size` points or `max_retries` attempts have been made.
pub fn retry_clustering(
    points: &Matrix,
    threshold: f64,
    min_size: usize,
    max_retries: usize,
    linkage: Linkage,
) -> Result<ClusterOutcome, FairVaeError> {
    if points.rows == 0 {
        return Err(FairVaeError::EmptyIndexSet("clustering"));
    }
    let dendrogram = Dendrogram::build(points, linkage);
    let mut threshold = threshold;
    let mut thresholds = Vec::with_capacity(max_retries);
    let mut all_sizes = Vec::with_capacity(max_retries);
    for attempt in 1..=max_retries {
        let labels = dendrogram.cut(threshold);
        let sizes = cluster_sizes(&labels);
        let smallest = sizes.iter().min().copied().unwrap_or(0);
        debug!(
            "clustering attempt {} at threshold {}: {} clusters, smallest {}",
            attempt,
            threshold,
            sizes.len(),
            smallest
        );
        if smallest >= min_size {
            info!(
                "clustered {} points into {} clusters at threshold {} after {} attempts",
                points.rows,
                sizes.len(),
                threshold,
                attempt
            );
            return Ok(ClusterOutcome {
                labels,
                threshold,
                attempts: attempt,
            });
        }
        thresholds.push(threshold);
        all_sizes.push(sizes);
        threshold *= 2.0;
    }
    Err(FairVaeError::ClusteringNonConvergence {
        thresholds,
        cluster_sizes: all_sizes,
    })
}

/// Hard cluster of every sample of one index set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Sample ids, ascending.
    pub samples: Vec<usize>,
    /// Cluster id of `samples[i]`.
    pub clusters: Vec<usize>,
    pub threshold: f64,
    pub attempts: usize,
}

impl ClusterAssignment {
    /// Cluster of an original sample id, `None` when the sample was not clustered.
    pub fn cluster_of(&self, sample: usize) -> Option<usize> {
        self.samples.binary_search(&sample).ok().map(|i| self.clusters[i])
    }

    pub fn sizes(&self) -> Vec<usize> {
        cluster_sizes(&self.clusters)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FairVaeError> {
        let json = serde_json::to_string(self).map_err(|e| FairVaeError::UnableToWrite(e.to_string()))?;
        fs::write(path.as_ref(), json)
            .map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", path.as_ref().display(), e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FairVaeError> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&json).map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.as_ref().display(), e)))
    }
}

/// Cluster the label-channel latent means of the validation (or training) samples.
///
/// Runs in inference mode over the index set in ascending order, batched like training.
pub fn cluster_latents<M: LatentModel>(
    model: &mut M,
    data: &DataSplit,
    ctx: &ExecutionContext,
    use_validation: bool,
) -> Result<ClusterAssignment, FairVaeError> {
    let kind = if use_validation { SplitKind::Valid } else { SplitKind::Train };
    let mut rng = ctx.inference_rng();
    let samples = SortedSampler.order(&mut rng, data.indices(kind));
    if samples.is_empty() {
        return Err(FairVaeError::EmptyIndexSet(kind.name()));
    }

    let means = with_inference(model, |m| {
        let mut parts = Vec::new();
        for range in batch_ranges(samples.len(), data.batch_size()) {
            let (feats, labels) = data.batch(&samples[range], &ctx.device)?;
            let out = m.forward(&labels, &feats, &mut rng)?;
            parts.push(Matrix::from_tensor(&out.label_mu)?);
        }
        Matrix::vconcat(&parts)
    })?;

    let outcome = retry_clustering(
        &means,
        ctx.config.labels_cluster_distance_threshold,
        ctx.config.labels_cluster_min_size,
        CLUSTER_MAX_RETRIES,
        ctx.config.linkage,
    )?;
    Ok(ClusterAssignment {
        samples,
        clusters: outcome.labels,
        threshold: outcome.threshold,
        attempts: outcome.attempts,
    })
}
