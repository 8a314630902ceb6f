//! Iterative merge-and-reassess loop, written as an explicit state machine.

use log::{info, warn};
use ndarray::ArrayView2;

use crate::assessment::{AssessmentResult, Assessor};
use crate::dataset::{distinct_clusters, ClusterId, Labels};
use crate::error::{Result, SccafError};
use crate::lineage::round_key;
use crate::merge::{plan_merge, MergePlan, MergedPair};
use crate::report::Reporter;

pub const DEFAULT_MIN_ACCURACY: f64 = 0.955;
pub const DEFAULT_PREFIX: &str = "L1";

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub prefix: String,
    pub min_accuracy: f64,
    /// Cluster that never takes part in a merge.
    pub protected: Option<ClusterId>,
    /// Upper bound on assessed rounds; `None` runs until convergence.
    pub max_rounds: Option<usize>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            min_accuracy: DEFAULT_MIN_ACCURACY,
            protected: None,
            max_rounds: None,
        }
    }
}

/// Labels of one round together with the merge that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub round: usize,
    /// `<prefix>_Round<N>`, also the obs column the labels are stored under.
    pub key: String,
    pub labels: Labels,
    /// `None` for round 0.
    pub merged: Option<MergedPair>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundScore {
    pub round: usize,
    pub cv_accuracy: f64,
    pub accuracy: f64,
    pub n_clusters: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    ThresholdReached,
    NoMergePossible,
    RoundLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Init,
    Assessing,
    Merging,
    Converged(ConvergenceReason),
    Done(ConvergenceReason),
}

#[derive(Debug)]
pub struct OptimizationOutcome {
    pub rounds: Vec<RoundRecord>,
    pub scores: Vec<RoundScore>,
    pub result_labels: Labels,
    pub reason: ConvergenceReason,
    /// True only when the accuracy threshold was met.
    pub converged: bool,
    pub final_accuracy: f64,
    /// Assessment of the final round's labels.
    pub final_assessment: AssessmentResult,
}

pub struct Optimizer<'a> {
    x: ArrayView2<'a, f64>,
    assessor: &'a dyn Assessor,
    reporter: &'a mut dyn Reporter,
    config: OptimizerConfig,
    state: LoopState,
    initial: Option<Labels>,
    /// Assessment of the starting labels made before the loop was built.
    initial_assessment: Option<AssessmentResult>,
    rounds: Vec<RoundRecord>,
    scores: Vec<RoundScore>,
    last: Option<AssessmentResult>,
}

impl<'a> Optimizer<'a> {
    pub fn new(
        x: ArrayView2<'a, f64>,
        labels: Labels,
        assessor: &'a dyn Assessor,
        reporter: &'a mut dyn Reporter,
        config: OptimizerConfig,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.min_accuracy) {
            return Err(SccafError::Config(format!(
                "minimum accuracy must be in [0, 1], got {}",
                config.min_accuracy
            )));
        }
        if config.max_rounds == Some(0) {
            return Err(SccafError::Config("max rounds must be at least 1".to_string()));
        }
        if labels.len() != x.nrows() {
            return Err(SccafError::ShapeMismatch(format!(
                "{} labels for {} cells",
                labels.len(),
                x.nrows()
            )));
        }
        Ok(Self {
            x,
            assessor,
            reporter,
            config,
            state: LoopState::Init,
            initial: Some(labels),
            initial_assessment: None,
            rounds: Vec::new(),
            scores: Vec::new(),
            last: None,
        })
    }

    /// Use `result` as the round 0 assessment instead of assessing the
    /// starting labels again. Its classes must match those labels.
    pub fn with_initial_assessment(mut self, result: AssessmentResult) -> Result<Self> {
        let expected = self.initial.as_deref().map(distinct_clusters).unwrap_or_default();
        if result.classes != expected {
            return Err(SccafError::ShapeMismatch(format!(
                "initial assessment covers {} clusters, starting labels have {}",
                result.classes.len(),
                expected.len()
            )));
        }
        self.initial_assessment = Some(result);
        Ok(self)
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn scores(&self) -> &[RoundScore] {
        &self.scores
    }

    /// Perform a single transition and return the new state. A failed
    /// transition leaves the state where it was.
    pub fn step(&mut self) -> Result<&LoopState> {
        let next = match self.state.clone() {
            LoopState::Init => {
                let labels = self.initial.take().unwrap_or_default();
                info!(
                    "Round 0: starting from {} clusters",
                    distinct_clusters(&labels).len()
                );
                self.push_round(labels, None);
                LoopState::Assessing
            }
            LoopState::Assessing => self.assess_current()?,
            LoopState::Merging => self.merge_current()?,
            LoopState::Converged(reason) => {
                let key = self.rounds.last().map_or("", |r| r.key.as_str());
                info!("Optimisation finished ({:?}); result taken from {}", reason, key);
                LoopState::Done(reason)
            }
            done @ LoopState::Done(_) => done,
        };
        self.state = next;
        Ok(&self.state)
    }

    /// Drive the loop to `Done`.
    pub fn run(mut self) -> Result<OptimizationOutcome> {
        let reason = loop {
            if let LoopState::Done(reason) = self.step()? {
                break *reason;
            }
        };

        let final_assessment = self
            .last
            .take()
            .ok_or_else(|| SccafError::EmptyInput("optimisation finished without an assessment".to_string()))?;
        let result_labels = self.rounds.last().map(|r| r.labels.clone()).unwrap_or_default();
        Ok(OptimizationOutcome {
            final_accuracy: final_assessment.cv_accuracy,
            converged: reason == ConvergenceReason::ThresholdReached,
            rounds: self.rounds,
            scores: self.scores,
            result_labels,
            reason,
            final_assessment,
        })
    }

    fn push_round(&mut self, labels: Labels, merged: Option<MergedPair>) {
        let round = self.rounds.len();
        self.rounds.push(RoundRecord {
            round,
            key: round_key(&self.config.prefix, round),
            labels,
            merged,
        });
    }

    fn assess_current(&mut self) -> Result<LoopState> {
        let record = self
            .rounds
            .last()
            .ok_or_else(|| SccafError::EmptyInput("no round to assess".to_string()))?;
        let result = match self.initial_assessment.take() {
            Some(result) if record.round == 0 => {
                info!("{}: reusing the starting assessment", record.key);
                result
            }
            _ => self.assessor.assess(self.x, &record.labels)?,
        };
        self.reporter.round(record, &result)?;

        let cv_accuracy = result.cv_accuracy;
        info!(
            "{}: {} clusters, CV accuracy {:.4} (threshold {:.4})",
            record.key,
            result.classes.len(),
            cv_accuracy,
            self.config.min_accuracy
        );
        self.scores.push(RoundScore {
            round: record.round,
            cv_accuracy,
            accuracy: result.accuracy,
            n_clusters: result.classes.len(),
        });
        self.last = Some(result);

        if cv_accuracy >= self.config.min_accuracy {
            return Ok(LoopState::Converged(ConvergenceReason::ThresholdReached));
        }
        if let Some(limit) = self.config.max_rounds {
            if self.rounds.len() >= limit {
                warn!(
                    "Stopping after {} rounds without reaching accuracy {:.4}",
                    limit, self.config.min_accuracy
                );
                return Ok(LoopState::Converged(ConvergenceReason::RoundLimit));
            }
        }
        Ok(LoopState::Merging)
    }

    fn merge_current(&mut self) -> Result<LoopState> {
        let (Some(record), Some(result)) = (self.rounds.last(), self.last.as_ref()) else {
            return Err(SccafError::EmptyInput("nothing assessed to merge".to_string()));
        };
        match plan_merge(&result.confusion, &record.labels, self.config.protected.as_ref()) {
            MergePlan::NoMergePossible => {
                warn!("No merge possible; keeping the best achievable clustering");
                Ok(LoopState::Converged(ConvergenceReason::NoMergePossible))
            }
            MergePlan::Merged { labels, pair } => {
                self.push_round(labels, Some(pair));
                Ok(LoopState::Assessing)
            }
        }
    }
}
