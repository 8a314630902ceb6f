//! Repeated stratified held-out validation producing an averaged,
//! row-normalised confusion matrix between clusters.

use std::collections::HashMap;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::classifier::ClassifierFactory;
use crate::dataset::{distinct_clusters, ClusterId};
use crate::error::{Result, SccafError};

pub const DEFAULT_ITERATIONS: usize = 3;
pub const DEFAULT_HELD_OUT_FRACTION: f64 = 0.5;

/// Cluster x cluster misclassification rates. Entry (i, j) is the fraction
/// of held-out cells of `classes[i]` predicted as `classes[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    pub classes: Vec<ClusterId>,
    pub rates: Array2<f64>,
}

impl ConfusionMatrix {
    pub fn new(classes: Vec<ClusterId>, rates: Array2<f64>) -> Result<Self> {
        if rates.nrows() != classes.len() || rates.ncols() != classes.len() {
            return Err(SccafError::ShapeMismatch(format!(
                "confusion matrix is {}x{} for {} clusters",
                rates.nrows(),
                rates.ncols(),
                classes.len()
            )));
        }
        Ok(Self { classes, rates })
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn rate(&self, from: &ClusterId, to: &ClusterId) -> Option<f64> {
        let i = self.classes.iter().position(|c| c == from)?;
        let j = self.classes.iter().position(|c| c == to)?;
        Some(self.rates[[i, j]])
    }
}

/// Labels mapped to dense class indices, in `ClusterId` order.
#[derive(Debug, Clone)]
pub struct EncodedLabels {
    pub classes: Vec<ClusterId>,
    pub codes: Vec<usize>,
}

impl EncodedLabels {
    /// Encode `labels`, checking that a stratified split is possible: at
    /// least two clusters, each with at least two cells.
    pub fn new(labels: &[ClusterId]) -> Result<Self> {
        let classes = distinct_clusters(&labels.iter().cloned().map(Some).collect::<Vec<_>>());
        if classes.len() < 2 {
            return Err(SccafError::InsufficientClasses(classes.len()));
        }

        let index: HashMap<&ClusterId, usize> = classes.iter().enumerate().map(|(i, c)| (c, i)).collect();
        let codes: Vec<usize> = labels.iter().map(|l| index[l]).collect();

        let mut counts = vec![0usize; classes.len()];
        for &c in &codes {
            counts[c] += 1;
        }
        if let Some((c, &size)) = counts.iter().enumerate().find(|(_, &n)| n < 2) {
            return Err(SccafError::DegenerateCluster {
                cluster: classes[c].to_string(),
                size,
            });
        }

        Ok(Self { classes, codes })
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }
}

/// Split row indices so every class lands in both halves.
///
/// Each class contributes `round(n * held_out_fraction)` rows to the test
/// side, clamped to `1..=n-1`. Both index lists come back sorted.
pub fn stratified_split(
    encoded: &EncodedLabels,
    held_out_fraction: f64,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); encoded.n_classes()];
    for (row, &c) in encoded.codes.iter().enumerate() {
        by_class[c].push(row);
    }

    let mut train = Vec::with_capacity(encoded.codes.len());
    let mut test = Vec::new();
    for mut rows in by_class {
        rows.shuffle(rng);
        let n = rows.len();
        let n_test = ((n as f64 * held_out_fraction).round() as usize).clamp(1, n - 1);
        test.extend_from_slice(&rows[..n_test]);
        train.extend_from_slice(&rows[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub iterations: usize,
    pub held_out_fraction: f64,
    pub n_jobs: usize,
    pub seed: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            held_out_fraction: DEFAULT_HELD_OUT_FRACTION,
            n_jobs: 0,
            seed: 0,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(SccafError::Config("iterations must be at least 1".to_string()));
        }
        if !(self.held_out_fraction > 0.0 && self.held_out_fraction < 1.0) {
            return Err(SccafError::Config(format!(
                "held-out fraction must be in (0, 1), got {}",
                self.held_out_fraction
            )));
        }
        Ok(())
    }
}

pub struct ConfusionEstimator<'a> {
    factory: &'a dyn ClassifierFactory,
    config: EstimatorConfig,
}

impl<'a> ConfusionEstimator<'a> {
    pub fn new(factory: &'a dyn ClassifierFactory, config: EstimatorConfig) -> Self {
        Self { factory, config }
    }

    /// Average confusion matrix and accuracy over `iterations` stratified
    /// splits. Iteration `k` samples with seed `seed + k`.
    pub fn estimate(&self, x: ArrayView2<f64>, y: &[ClusterId]) -> Result<(ConfusionMatrix, f64)> {
        self.config.validate()?;
        if x.nrows() != y.len() {
            return Err(SccafError::ShapeMismatch(format!(
                "{} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        let encoded = EncodedLabels::new(y)?;
        let k = encoded.n_classes();

        let pb = ProgressBar::new(self.config.iterations as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} splits evaluated (Confusion)",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );

        // 0 threads lets rayon size the pool from the available cores
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_jobs)
            .build()?;
        let splits: Vec<(Array2<f64>, f64)> = pool.install(|| {
            (0..self.config.iterations)
                .into_par_iter()
                .map(|iteration| {
                    let split = self.evaluate_split(x, &encoded, iteration)?;
                    pb.inc(1);
                    Ok(split)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        pb.finish_and_clear();

        // summed in split order so the result does not depend on scheduling
        let mut total = Array2::<f64>::zeros((k, k));
        let mut accuracy_sum = 0.0;
        for (counts, accuracy) in &splits {
            total += counts;
            accuracy_sum += accuracy;
        }

        let n = self.config.iterations as f64;
        let mean_accuracy = accuracy_sum / n;
        info!(
            "Cross-validation over {} clusters: mean accuracy {:.4} ({} splits)",
            k, mean_accuracy, self.config.iterations
        );
        Ok((ConfusionMatrix::new(encoded.classes, total / n)?, mean_accuracy))
    }

    /// Row-normalised confusion counts and accuracy for split `iteration`.
    fn evaluate_split(
        &self,
        x: ArrayView2<f64>,
        encoded: &EncodedLabels,
        iteration: usize,
    ) -> Result<(Array2<f64>, f64)> {
        let k = encoded.n_classes();
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(iteration as u64));
        let (train, test) = stratified_split(encoded, self.config.held_out_fraction, &mut rng);

        let y_train: Vec<usize> = train.iter().map(|&i| encoded.codes[i]).collect();
        let mut clf = self.factory.build(self.config.n_jobs)?;
        clf.fit(x.select(Axis(0), &train).view(), &y_train, k)?;
        let predicted = clf.predict(x.select(Axis(0), &test).view())?;

        let mut counts = Array2::<f64>::zeros((k, k));
        let mut correct = 0usize;
        for (&row, &p) in test.iter().zip(&predicted) {
            let t = encoded.codes[row];
            counts[[t, p]] += 1.0;
            if t == p {
                correct += 1;
            }
        }
        for mut row in counts.rows_mut() {
            let n = row.sum();
            if n > 0.0 {
                row /= n;
            }
        }

        let accuracy = correct as f64 / test.len() as f64;
        debug!("Split {}: accuracy {:.4} on {} held-out cells", iteration + 1, accuracy, test.len());
        Ok((counts, accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::NearestCentroidFactory;
    use ndarray::Array2;

    fn ids(labels: &[&str]) -> Vec<ClusterId> {
        labels.iter().map(|&l| ClusterId::from(l)).collect()
    }

    /// Cells sit on one point per group; `groups[i]` is the group of cell i.
    fn points(groups: &[usize]) -> Array2<f64> {
        Array2::from_shape_fn((groups.len(), 2), |(i, j)| (groups[i] * 10 + j) as f64)
    }

    #[test]
    fn encoding_requires_two_classes() {
        let err = EncodedLabels::new(&ids(&["a", "a", "a"])).unwrap_err();
        assert!(matches!(err, SccafError::InsufficientClasses(1)));
    }

    #[test]
    fn encoding_rejects_singleton_clusters() {
        let err = EncodedLabels::new(&ids(&["0", "0", "1"])).unwrap_err();
        assert!(matches!(err, SccafError::DegenerateCluster { ref cluster, size: 1 } if cluster == "1"));
    }

    #[test]
    fn split_keeps_every_class_on_both_sides() {
        let encoded = EncodedLabels::new(&ids(&["0", "0", "1", "1", "1", "2", "2", "2", "2", "2"])).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (train, test) = stratified_split(&encoded, 0.9, &mut rng);
        assert_eq!(train.len() + test.len(), 10);
        for class in 0..3 {
            assert!(train.iter().any(|&r| encoded.codes[r] == class));
            assert!(test.iter().any(|&r| encoded.codes[r] == class));
        }
    }

    #[test]
    fn separable_clusters_give_identity_matrix() {
        let groups = [0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2];
        let y = ids(&["0", "0", "0", "0", "1", "1", "1", "1", "2", "2", "2", "2"]);
        let estimator = ConfusionEstimator::new(&NearestCentroidFactory, EstimatorConfig::default());
        let (cm, accuracy) = estimator.estimate(points(&groups).view(), &y).unwrap();

        assert_eq!(accuracy, 1.0);
        assert_eq!(cm.rates, Array2::<f64>::eye(3));
    }

    #[test]
    fn rows_sum_to_one_and_accuracy_is_bounded() {
        // clusters "1" and "2" share a location, so the stub sends all of them to "1"
        let groups = [0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];
        let y = ids(&["0", "0", "0", "0", "1", "1", "1", "1", "2", "2", "2", "2"]);
        let config = EstimatorConfig {
            iterations: 4,
            ..EstimatorConfig::default()
        };
        let estimator = ConfusionEstimator::new(&NearestCentroidFactory, config);
        let (cm, accuracy) = estimator.estimate(points(&groups).view(), &y).unwrap();

        for row in cm.rates.rows() {
            assert!(row.sum() <= 1.0 + 1e-9);
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!((0.0..=1.0).contains(&accuracy));
        assert_eq!(cm.rate(&"2".into(), &"1".into()), Some(1.0));
        assert!((accuracy - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn zero_iterations_is_a_config_error() {
        let config = EstimatorConfig {
            iterations: 0,
            ..EstimatorConfig::default()
        };
        let estimator = ConfusionEstimator::new(&NearestCentroidFactory, config);
        let y = ids(&["0", "0", "1", "1"]);
        let err = estimator.estimate(points(&[0, 0, 1, 1]).view(), &y).unwrap_err();
        assert!(matches!(err, SccafError::Config(_)));
    }

    #[test]
    fn thread_count_does_not_change_the_estimate() {
        let groups = [0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];
        let y = ids(&["0", "0", "0", "0", "1", "1", "1", "1", "2", "2", "2", "2"]);
        let estimate = |n_jobs| {
            let config = EstimatorConfig {
                iterations: 5,
                n_jobs,
                seed: 11,
                ..EstimatorConfig::default()
            };
            ConfusionEstimator::new(&NearestCentroidFactory, config)
                .estimate(points(&groups).view(), &y)
                .unwrap()
        };
        let (serial, serial_acc) = estimate(1);
        let (parallel, parallel_acc) = estimate(4);
        assert_eq!(serial.rates, parallel.rates);
        assert_eq!(serial_acc, parallel_acc);
    }
}
