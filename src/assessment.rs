//! Self-projection assessment: how well a classifier trained on a clustering
//! recovers that clustering on held-out cells.

use log::info;
use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::classifier::{argmax_rows, Classifier, ClassifierFactory};
use crate::confusion::{stratified_split, ConfusionEstimator, ConfusionMatrix, EncodedLabels, EstimatorConfig};
use crate::dataset::ClusterId;
use crate::error::{Result, SccafError};

/// Outcome of one assessment. Only lives for the round it describes.
pub struct AssessmentResult {
    /// Column order of `probabilities`.
    pub classes: Vec<ClusterId>,
    pub probabilities: Array2<f64>,
    pub predictions: Vec<ClusterId>,
    pub truth: Vec<ClusterId>,
    pub classifier: Box<dyn Classifier>,
    /// Mean accuracy of the repeated confusion estimate.
    pub cv_accuracy: f64,
    /// Accuracy of the single held-out split.
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
}

impl std::fmt::Debug for AssessmentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssessmentResult")
            .field("classes", &self.classes)
            .field("held_out", &self.truth.len())
            .field("cv_accuracy", &self.cv_accuracy)
            .field("accuracy", &self.accuracy)
            .finish()
    }
}

/// Anything able to score a label assignment over an expression matrix.
pub trait Assessor {
    fn assess(&self, x: ArrayView2<f64>, labels: &[Option<ClusterId>]) -> Result<AssessmentResult>;
}

pub struct AssessmentEngine<'a> {
    factory: &'a dyn ClassifierFactory,
    config: EstimatorConfig,
}

impl<'a> AssessmentEngine<'a> {
    pub fn new(factory: &'a dyn ClassifierFactory, config: EstimatorConfig) -> Self {
        Self { factory, config }
    }
}

impl Assessor for AssessmentEngine<'_> {
    fn assess(&self, x: ArrayView2<f64>, labels: &[Option<ClusterId>]) -> Result<AssessmentResult> {
        if x.nrows() == 0 || labels.is_empty() {
            return Err(SccafError::EmptyInput("expression matrix or labels are empty".to_string()));
        }
        if x.nrows() != labels.len() {
            return Err(SccafError::ShapeMismatch(format!(
                "{} cells in the matrix but {} labels",
                x.nrows(),
                labels.len()
            )));
        }

        let labelled: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|_| i))
            .collect();
        if labelled.is_empty() {
            return Err(SccafError::EmptyInput("no cell carries a cluster label".to_string()));
        }
        if labelled.len() < labels.len() {
            info!(
                "Excluding {} unlabelled cell(s) from assessment",
                labels.len() - labelled.len()
            );
        }
        let x = x.select(Axis(0), &labelled);
        let y: Vec<ClusterId> = labelled.iter().filter_map(|&i| labels[i].clone()).collect();

        let estimator = ConfusionEstimator::new(self.factory, self.config.clone());
        let (confusion, cv_accuracy) = estimator.estimate(x.view(), &y)?;

        let encoded = EncodedLabels::new(&y)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.config.iterations as u64));
        let (train, test) = stratified_split(&encoded, self.config.held_out_fraction, &mut rng);

        let y_train: Vec<usize> = train.iter().map(|&i| encoded.codes[i]).collect();
        let mut classifier = self.factory.build(self.config.n_jobs)?;
        classifier.fit(x.select(Axis(0), &train).view(), &y_train, encoded.n_classes())?;
        let probabilities = classifier.predict_proba(x.select(Axis(0), &test).view())?;

        let predicted = argmax_rows(&probabilities);
        let correct = test
            .iter()
            .zip(&predicted)
            .filter(|(&row, &p)| encoded.codes[row] == p)
            .count();
        let accuracy = correct as f64 / test.len() as f64;
        info!(
            "Assessment: {} clusters, {} held-out cells, accuracy {:.4}, CV mean {:.4}",
            encoded.n_classes(),
            test.len(),
            accuracy,
            cv_accuracy
        );

        let predictions = predicted.iter().map(|&p| encoded.classes[p].clone()).collect();
        let truth = test.iter().map(|&row| encoded.classes[encoded.codes[row]].clone()).collect();

        Ok(AssessmentResult {
            classes: encoded.classes,
            probabilities,
            predictions,
            truth,
            classifier,
            cv_accuracy,
            accuracy,
            confusion,
        })
    }
}

/// One-vs-rest ROC curve for a single cluster.
#[derive(Debug, Clone)]
pub struct RocCurve {
    pub class: ClusterId,
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub auc: f64,
}

/// ROC curves from held-out probabilities, one per cluster. Clusters with no
/// positive or no negative held-out cell are skipped.
pub fn roc_curves(result: &AssessmentResult) -> Vec<RocCurve> {
    let mut curves = Vec::with_capacity(result.classes.len());
    for (j, class) in result.classes.iter().enumerate() {
        let mut scored: Vec<(f64, bool)> = result
            .probabilities
            .column(j)
            .iter()
            .zip(&result.truth)
            .map(|(&p, t)| (p, t == class))
            .collect();
        let positives = scored.iter().filter(|(_, pos)| *pos).count();
        let negatives = scored.len() - positives;
        if positives == 0 || negatives == 0 {
            continue;
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut fpr = vec![0.0];
        let mut tpr = vec![0.0];
        let (mut tp, mut fp) = (0usize, 0usize);
        for (idx, &(score, is_positive)) in scored.iter().enumerate() {
            if is_positive {
                tp += 1;
            } else {
                fp += 1;
            }
            // emit a point only once all cells sharing this score are counted
            let last_of_score = scored.get(idx + 1).map_or(true, |next| next.0 != score);
            if last_of_score {
                fpr.push(fp as f64 / negatives as f64);
                tpr.push(tp as f64 / positives as f64);
            }
        }

        let mut auc = 0.0;
        for i in 1..fpr.len() {
            auc += (fpr[i] - fpr[i - 1]) * (tpr[i] + tpr[i - 1]) / 2.0;
        }

        curves.push(RocCurve {
            class: class.clone(),
            fpr,
            tpr,
            auc,
        });
    }
    curves
}
