//! Fairness
//!
//! Disparity between the latent centroid of each cluster and the centroids of its
//! sensitive subgroups, used as a training penalty, and the distance-weighted variant
//! used to report how fair a trained model is around a target label.
use crate::cluster::ClusterAssignment;
use crate::context::ExecutionContext;
use crate::data::{DataSplit, GroupIndex, Matrix, SplitKind};
use crate::errors::FairVaeError;
use crate::model::LatentModel;
use crate::optim::{has_finite_grad, Adam};
use crate::sampler::{batch_ranges, Sampler, ShuffleSampler};
use candle_core::{DType, Device, Tensor};
use log::info;
use std::collections::BTreeMap;

fn index_tensor(rows: &[usize], device: &Device) -> Result<Tensor, FairVaeError> {
    let idx: Vec<u32> = rows.iter().map(|r| *r as u32).collect();
    Ok(Tensor::from_vec(idx, rows.len(), device)?)
}

fn centroid(z: &Tensor, rows: &[usize]) -> Result<Tensor, FairVaeError> {
    Ok(z.index_select(&index_tensor(rows, z.device())?, 0)?.mean(0)?)
}

/// Members of every (cluster, group) pair, clusters and groups in ascending order.
/// Rows without a cluster are left out.
fn partition(clusters: &[Option<usize>], groups: &[usize]) -> BTreeMap<usize, (Vec<usize>, BTreeMap<usize, Vec<usize>>)> {
    let mut out: BTreeMap<usize, (Vec<usize>, BTreeMap<usize, Vec<usize>>)> = BTreeMap::new();
    for (row, (cluster, group)) in clusters.iter().zip(groups).enumerate() {
        if let Some(c) = cluster {
            let entry = out.entry(*c).or_default();
            entry.0.push(row);
            entry.1.entry(*group).or_default().push(row);
        }
    }
    out
}

/// Sum over clusters, sensitive groups present in the cluster, and both channels, of
/// `sum_d (subgroup_mean_d - cluster_mean_d)^2`.
///
/// Row `i` of `labels_z` and `feats_z` belongs to cluster `clusters[i]` and group
/// `groups[i]`.
pub fn disparity_loss(
    labels_z: &Tensor,
    feats_z: &Tensor,
    clusters: &[Option<usize>],
    groups: &[usize],
) -> Result<Tensor, FairVaeError> {
    let n = labels_z.dim(0)?;
    if feats_z.dim(0)? != n || clusters.len() != n || groups.len() != n {
        return Err(FairVaeError::InvalidData(format!(
            "disparity inputs disagree: {} label rows, {} feature rows, {} clusters, {} groups",
            n,
            feats_z.dim(0)?,
            clusters.len(),
            groups.len()
        )));
    }
    let mut total = Tensor::zeros((), DType::F32, labels_z.device())?;
    for (members, subgroups) in partition(clusters, groups).values() {
        for z in [labels_z, feats_z] {
            let cluster_mean = centroid(z, members)?;
            for rows in subgroups.values() {
                let gap = centroid(z, rows)?.sub(&cluster_mean)?.sqr()?.sum_all()?;
                total = total.add(&gap)?;
            }
        }
    }
    Ok(total)
}

/// One disparity step: sample both latent channels over the chosen index set,
/// penalise cluster/subgroup centroid gaps, and update through `optimizer`.
/// Returns the penalty before the update.
pub fn fairness_penalty<M: LatentModel>(
    data: &DataSplit,
    model: &M,
    optimizer: &mut Adam,
    ctx: &mut ExecutionContext,
    assignment: &ClusterAssignment,
    use_validation: bool,
) -> Result<f32, FairVaeError> {
    let kind = if use_validation { SplitKind::Valid } else { SplitKind::Train };
    let sensitive = data.sensitive().ok_or(FairVaeError::MissingSensitive)?;
    let order = ShuffleSampler.order(&mut ctx.rng, data.indices(kind));
    if order.is_empty() {
        return Err(FairVaeError::EmptyIndexSet(kind.name()));
    }

    let mut labels_z = Vec::new();
    let mut feats_z = Vec::new();
    for range in batch_ranges(order.len(), data.batch_size()) {
        let (feats, labels) = data.batch(&order[range], &ctx.device)?;
        let out = model.forward(&labels, &feats, &mut ctx.rng)?;
        labels_z.push(model.label_reparameterize(&out.label_mu, &out.label_logvar, &mut ctx.rng)?);
        feats_z.push(model.feat_reparameterize(&out.feat_mu, &out.feat_logvar, &mut ctx.rng)?);
    }
    let labels_z = Tensor::cat(&labels_z, 0)?;
    let feats_z = Tensor::cat(&feats_z, 0)?;

    let group_index = GroupIndex::from_matrix(sensitive);
    let clusters: Vec<Option<usize>> = order.iter().map(|i| assignment.cluster_of(*i)).collect();
    let groups: Vec<usize> = order.iter().map(|i| group_index.group_of(*i)).collect();

    let loss = disparity_loss(&labels_z, &feats_z, &clusters, &groups)?;
    let value = loss.to_scalar::<f32>()?;
    let grads = loss.backward()?;
    has_finite_grad(&grads, optimizer.vars())?;
    optimizer.step(&grads)?;
    info!("fairness penalty={:.6}", value);
    Ok(value)
}

/// Distance-weighted disparity of latent codes `z` around one target label.
///
/// `weights[i]` weighs row `i`. The weighted centroid of each sensitive group is
/// compared with the overall weighted centroid by mean squared difference over
/// dimensions. Returns one value per group carrying positive weight; empty when the
/// total weight is zero.
pub fn weighted_group_disparities(z: &Matrix, weights: &[f64], groups: &[usize]) -> Vec<f64> {
    let weighted_centroid = |rows: &mut dyn Iterator<Item = usize>| -> Option<Vec<f64>> {
        let mut sum = vec![0.0; z.cols];
        let mut w_sum = 0.0;
        for i in rows {
            let w = weights[i];
            w_sum += w;
            for (s, v) in sum.iter_mut().zip(z.row(i)) {
                *s += w * *v as f64;
            }
        }
        (w_sum > 0.0).then(|| sum.iter().map(|s| s / w_sum).collect())
    };

    let overall = match weighted_centroid(&mut (0..z.rows)) {
        Some(c) => c,
        None => return Vec::new(),
    };
    let n_groups = groups.iter().max().map_or(0, |g| g + 1);
    (0..n_groups)
        .filter_map(|g| {
            let centroid = weighted_centroid(&mut (0..z.rows).filter(|i| groups[*i] == g))?;
            let msd = centroid
                .iter()
                .zip(&overall)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                / z.cols.max(1) as f64;
            Some(msd)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::tests::{synthetic_split, tiny_config, tiny_model};
    use crate::utils::precision_round;

    /// Validation samples split into two clusters of consecutive pairs, so that every
    /// cluster holds both sensitive groups.
    fn mixed_assignment(data: &DataSplit) -> ClusterAssignment {
        let samples = data.valid_idx().to_vec();
        let clusters = (0..samples.len()).map(|k| (k / 2) % 2).collect();
        ClusterAssignment {
            samples,
            clusters,
            threshold: 0.1,
            attempts: 1,
        }
    }

    #[test]
    fn test_hand_computed_disparity() {
        // Cluster 0: group 0 at (1, 0), group 1 at (-1, 0). Cluster 1: group 0 at (2, 2),
        // group 1 at (0, 0). Gaps are 1 + 1 for cluster 0 and 2 + 2 for cluster 1.
        let labels_z = Tensor::new(&[[1f32, 0.], [-1., 0.], [2., 2.], [0., 0.]], &Device::Cpu).unwrap();
        let feats_z = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        let clusters = vec![Some(0), Some(0), Some(1), Some(1)];
        let groups = vec![0, 1, 0, 1];
        let loss = disparity_loss(&labels_z, &feats_z, &clusters, &groups).unwrap();
        assert_eq!(precision_round(loss.to_scalar::<f32>().unwrap() as f64, 5), 6.0);
    }

    #[test]
    fn test_unclustered_rows_and_single_group_clusters() {
        let labels_z = Tensor::new(&[[1f32], [3.], [100.]], &Device::Cpu).unwrap();
        let feats_z = Tensor::new(&[[0f32], [0.], [0.]], &Device::Cpu).unwrap();
        // The third row has no cluster, and a cluster with one group has no gap.
        let loss = disparity_loss(&labels_z, &feats_z, &[Some(0), Some(0), None], &[0, 0, 1]).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
        let loss = disparity_loss(&labels_z, &feats_z, &[Some(0), Some(0), None], &[0, 1, 1]).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 2.0);
    }

    #[test]
    fn test_mismatched_inputs() {
        let z = Tensor::zeros((2, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(disparity_loss(&z, &z, &[Some(0)], &[0, 0]).is_err());
    }

    #[test]
    fn test_penalty_steps_reduce_disparity() {
        let data = synthetic_split(40, 8, true);
        let mut ctx = ExecutionContext::with_device(tiny_config(), Device::Cpu);
        let model = tiny_model(&data, &mut ctx);
        let assignment = mixed_assignment(&data);
        let mut optimizer = Adam::new("disparity", model.vars(), 0.05).unwrap();

        let penalties: Vec<f32> = (0..30)
            .map(|_| fairness_penalty(&data, &model, &mut optimizer, &mut ctx, &assignment, true).unwrap())
            .collect();
        let first = penalties[0];
        let last = penalties[penalties.len() - 1];
        assert!(first > 0.0);
        assert!(penalties.iter().all(|p| p.is_finite()));
        assert!(last < first, "first={} last={}", first, last);
    }

    #[test]
    fn test_penalty_without_clustered_samples_is_zero() {
        let data = synthetic_split(40, 8, true);
        let mut ctx = ExecutionContext::with_device(tiny_config(), Device::Cpu);
        let model = tiny_model(&data, &mut ctx);
        // Only validation samples carry a cluster, so the training set contributes nothing.
        let assignment = mixed_assignment(&data);
        let mut optimizer = Adam::new("disparity", model.vars(), 0.05).unwrap();
        let penalty = fairness_penalty(&data, &model, &mut optimizer, &mut ctx, &assignment, false).unwrap();
        assert_eq!(penalty, 0.0);
    }

    #[test]
    fn test_penalty_needs_sensitive_attributes() {
        let data = synthetic_split(40, 8, false);
        let mut ctx = ExecutionContext::with_device(tiny_config(), Device::Cpu);
        let model = tiny_model(&data, &mut ctx);
        let assignment = mixed_assignment(&data);
        let mut optimizer = Adam::new("disparity", model.vars(), 0.05).unwrap();
        let err = fairness_penalty(&data, &model, &mut optimizer, &mut ctx, &assignment, true).unwrap_err();
        assert!(matches!(err, FairVaeError::MissingSensitive));
    }

    #[test]
    fn test_weighted_group_disparities() {
        let z = Matrix::new(vec![1., 1., 3., 3., 100., 100.], 3, 2).unwrap();
        // The third row carries no weight. Overall centroid (2, 2); groups at (1, 1) and (3, 3).
        let d = weighted_group_disparities(&z, &[1., 1., 0.], &[0, 1, 1]);
        assert_eq!(d, vec![1.0, 1.0]);
        assert!(weighted_group_disparities(&z, &[0., 0., 0.], &[0, 1, 1]).is_empty());
        // A group with no weight is skipped.
        let d = weighted_group_disparities(&z, &[1., 0., 0.], &[0, 1, 1]);
        assert_eq!(d, vec![0.0]);
    }
}
