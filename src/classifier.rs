//! Supervised classifier capability used by the assessment and the
//! optimisation loop, plus the default logistic-regression backend.

use log::debug;
use ndarray::{Array1, Array2, ArrayView2};
use smartcore::linear::logistic_regression::{
    LogisticRegression as SmartcoreLogistic, LogisticRegressionParameters,
};

use crate::error::{Result, SccafError};

/// A classifier over dense feature rows and class indices `0..n_classes`.
pub trait Classifier: Send {
    fn fit(&mut self, x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()>;

    /// Row-wise class probabilities, `n_rows x n_classes`.
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<usize>> {
        Ok(argmax_rows(&self.predict_proba(x)?))
    }

    /// Fraction of rows whose predicted class equals `y`.
    fn score(&self, x: ArrayView2<f64>, y: &[usize]) -> Result<f64> {
        let predicted = self.predict(x)?;
        if predicted.is_empty() {
            return Ok(0.0);
        }
        let correct = predicted.iter().zip(y).filter(|(p, t)| p == t).count();
        Ok(correct as f64 / predicted.len() as f64)
    }
}

/// Builds fresh, unfitted classifiers. `n_jobs` is a degree-of-parallelism
/// hint; 0 lets the backend pick.
pub trait ClassifierFactory: Sync {
    fn build(&self, n_jobs: usize) -> Result<Box<dyn Classifier>>;
}

/// Index of the largest entry in each row; the first index wins ties.
pub fn argmax_rows(probabilities: &Array2<f64>) -> Vec<usize> {
    probabilities
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (j, &p) in row.iter().enumerate() {
                if p > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// L2 penalty for the default backend.
#[derive(Debug, Clone)]
pub struct LogisticRegressionParams {
    pub alpha: f64,
}

impl Default for LogisticRegressionParams {
    fn default() -> Self {
        Self { alpha: 1e-3 }
    }
}

type SmartcoreModel = SmartcoreLogistic<f64, u32, Array2<f64>, Array1<u32>>;

/// Multinomial logistic regression from `smartcore`.
///
/// smartcore only exposes hard predictions for this model, so
/// `predict_proba` returns a one-hot row per cell. The fit itself is single
/// threaded; the confusion estimator runs its splits in parallel instead.
pub struct LogisticRegression {
    params: LogisticRegressionParams,
    n_features: usize,
    n_classes: usize,
    model: Option<SmartcoreModel>,
}

impl LogisticRegression {
    pub fn new(params: LogisticRegressionParams) -> Self {
        Self {
            params,
            n_features: 0,
            n_classes: 0,
            model: None,
        }
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()> {
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 {
            return Err(SccafError::EmptyInput("no training rows".to_string()));
        }
        if y.len() != n_rows {
            return Err(SccafError::ShapeMismatch(format!(
                "{} training rows but {} labels",
                n_rows,
                y.len()
            )));
        }
        if let Some(&bad) = y.iter().find(|&&c| c >= n_classes) {
            return Err(SccafError::ShapeMismatch(format!(
                "label index {} outside 0..{}",
                bad, n_classes
            )));
        }

        let features = x.to_owned();
        let labels: Array1<u32> = y.iter().map(|&c| c as u32).collect();
        let params = LogisticRegressionParameters::default().with_alpha(self.params.alpha);
        let model = SmartcoreLogistic::fit(&features, &labels, params)?;
        debug!(
            "Logistic regression fitted on {} rows x {} features ({} classes)",
            n_rows, n_features, n_classes
        );

        self.n_features = n_features;
        self.n_classes = n_classes;
        self.model = Some(model);
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| SccafError::Config("classifier used before fit".to_string()))?;
        if x.ncols() != self.n_features {
            return Err(SccafError::ShapeMismatch(format!(
                "classifier fitted on {} features, got {}",
                self.n_features,
                x.ncols()
            )));
        }
        let predicted: Array1<u32> = model.predict(&x.to_owned())?;
        let mut proba = Array2::<f64>::zeros((x.nrows(), self.n_classes));
        for (i, &c) in predicted.iter().enumerate() {
            let c = c as usize;
            if c >= self.n_classes {
                return Err(SccafError::ShapeMismatch(format!(
                    "classifier predicted class {} outside 0..{}",
                    c, self.n_classes
                )));
            }
            proba[[i, c]] = 1.0;
        }
        Ok(proba)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogisticRegressionFactory {
    pub params: LogisticRegressionParams,
}

impl ClassifierFactory for LogisticRegressionFactory {
    fn build(&self, _n_jobs: usize) -> Result<Box<dyn Classifier>> {
        Ok(Box::new(LogisticRegression::new(self.params.clone())))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn argmax_prefers_first_on_ties() {
        let p = array![[0.2, 0.4, 0.4], [0.9, 0.05, 0.05]];
        assert_eq!(argmax_rows(&p), vec![1, 0]);
    }

    #[test]
    fn logistic_regression_separates_two_blobs() {
        let x = array![
            [0.0, 0.1],
            [0.2, 0.0],
            [0.1, 0.2],
            [5.0, 5.1],
            [5.2, 4.9],
            [4.9, 5.0]
        ];
        let y = vec![0, 0, 0, 1, 1, 1];
        let mut clf = LogisticRegressionFactory::default().build(2).unwrap();
        clf.fit(x.view(), &y, 2).unwrap();

        assert_eq!(clf.predict(x.view()).unwrap(), y);
        assert_eq!(clf.score(x.view(), &y).unwrap(), 1.0);
        let proba = clf.predict_proba(array![[0.0, 0.0], [5.0, 5.0]].view()).unwrap();
        assert_eq!(proba.row(0).to_vec(), vec![1.0, 0.0]);
        assert_eq!(proba.row(1).to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn logistic_regression_handles_three_classes() {
        let x = array![
            [0.0, 0.0],
            [0.1, 0.2],
            [0.2, 0.1],
            [6.0, 0.0],
            [6.1, 0.2],
            [5.9, 0.1],
            [0.0, 6.0],
            [0.2, 6.1],
            [0.1, 5.9]
        ];
        let y = vec![0, 0, 0, 1, 1, 1, 2, 2, 2];
        let mut clf = LogisticRegressionFactory::default().build(1).unwrap();
        clf.fit(x.view(), &y, 3).unwrap();

        assert_eq!(clf.predict(x.view()).unwrap(), y);
        let proba = clf.predict_proba(x.view()).unwrap();
        assert_eq!(proba.dim(), (9, 3));
        for row in proba.rows() {
            assert_eq!(row.sum(), 1.0);
        }
    }

    #[test]
    fn predict_before_fit_is_an_error() {
        let clf = LogisticRegression::new(LogisticRegressionParams::default());
        assert!(clf.predict_proba(array![[1.0]].view()).is_err());
    }

    #[test]
    fn fit_rejects_out_of_range_labels() {
        let mut clf = LogisticRegression::new(LogisticRegressionParams::default());
        let err = clf.fit(array![[1.0], [2.0]].view(), &[0, 3], 2);
        assert!(matches!(err, Err(SccafError::ShapeMismatch(_))));
    }

    #[test]
    fn nearest_centroid_stub_resolves_ties_to_lowest_class() {
        use testing::NearestCentroid;
        let x = array![[1.0], [1.0], [4.0]];
        let mut clf = NearestCentroid::default();
        clf.fit(x.view(), &[0, 1, 2], 3).unwrap();
        assert_eq!(clf.predict(x.view()).unwrap(), vec![0, 0, 2]);
    }
}
