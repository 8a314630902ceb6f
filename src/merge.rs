//! Picks the most confused cluster pair and merges it.

use log::{info, warn};

use crate::confusion::ConfusionMatrix;
use crate::dataset::{distinct_clusters, ClusterId, Labels};

#[derive(Debug, Clone, PartialEq)]
pub struct MergedPair {
    /// Surviving cluster, the lower id of the pair.
    pub kept: ClusterId,
    /// Cluster whose cells were relabelled to `kept`.
    pub absorbed: ClusterId,
    /// Confusion rate that selected this pair.
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergePlan {
    Merged { labels: Labels, pair: MergedPair },
    NoMergePossible,
}

/// Highest off-diagonal entry that does not touch `protected`.
///
/// Rows and columns are visited in `ClusterId` order and only a strictly
/// larger value replaces the current best, so ties go to the smallest
/// (row, column) pair. NaN entries are never selected.
pub fn most_confused_pair(
    confusion: &ConfusionMatrix,
    protected: Option<&ClusterId>,
) -> Option<(ClusterId, ClusterId, f64)> {
    let mut order: Vec<usize> = (0..confusion.n_classes()).collect();
    order.sort_by(|&a, &b| confusion.classes[a].cmp(&confusion.classes[b]));

    let is_protected = |idx: usize| protected.map_or(false, |p| &confusion.classes[idx] == p);

    let mut best: Option<(usize, usize, f64)> = None;
    for &i in &order {
        if is_protected(i) {
            continue;
        }
        for &j in &order {
            if i == j || is_protected(j) {
                continue;
            }
            let value = confusion.rates[[i, j]];
            if value.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, _, b)| value > b) {
                best = Some((i, j, value));
            }
        }
    }

    best.map(|(i, j, value)| (confusion.classes[i].clone(), confusion.classes[j].clone(), value))
}

/// Merge the most confused pair in `labels`.
///
/// The lower id of the pair absorbs the higher one; cells without a label
/// and clusters outside the pair are untouched.
pub fn plan_merge(confusion: &ConfusionMatrix, labels: &[Option<ClusterId>], protected: Option<&ClusterId>) -> MergePlan {
    if confusion.n_classes() < 2 {
        info!("Only {} cluster left, nothing to merge", confusion.n_classes());
        return MergePlan::NoMergePossible;
    }

    let Some((a, b, rate)) = most_confused_pair(confusion, protected) else {
        info!("Every remaining merge candidate involves the protected cluster");
        return MergePlan::NoMergePossible;
    };
    let (kept, absorbed) = if a <= b { (a, b) } else { (b, a) };

    let merged: Labels = labels
        .iter()
        .map(|label| match label {
            Some(l) if *l == absorbed => Some(kept.clone()),
            other => other.clone(),
        })
        .collect();

    let before = distinct_clusters(labels).len();
    let after = distinct_clusters(&merged).len();
    if after + 1 != before {
        warn!(
            "Merging {} into {} changed the cluster count from {} to {}",
            absorbed, kept, before, after
        );
    }
    info!("Merging cluster {} into {} (confusion {:.4})", absorbed, kept, rate);

    MergePlan::Merged {
        labels: merged,
        pair: MergedPair { kept, absorbed, rate },
    }
}
