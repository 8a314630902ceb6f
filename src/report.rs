//! Side outputs of a run: ROC plots, the per-round plot archive and the
//! per-round summary table. The optimisation loop only sees the `Reporter`
//! trait.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use plotters::prelude::*;
use serde::Serialize;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::assessment::{roc_curves, AssessmentResult, RocCurve};
use crate::error::{Result, SccafError};
use crate::optimize::RoundRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initial,
    Optimized,
}

pub trait Reporter {
    /// A standalone assessment, before or after optimisation.
    fn assessment(&mut self, stage: Stage, result: &AssessmentResult) -> Result<()>;

    /// Called once for every round the loop assesses.
    fn round(&mut self, record: &RoundRecord, result: &AssessmentResult) -> Result<()>;

    /// Flush and close whatever the reporter holds open.
    fn finish(&mut self) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    round: usize,
    key: &'a str,
    clusters: usize,
    cv_accuracy: f64,
    accuracy: f64,
    merged_into: Option<&'a str>,
    merged_from: Option<&'a str>,
    merge_rate: Option<f64>,
}

/// Writes SVG plots and tables to disk. Every output is optional.
#[derive(Default)]
pub struct PlotReporter {
    initial_roc: Option<PathBuf>,
    optimized_roc: Option<PathBuf>,
    rounds_zip: Option<ZipWriter<File>>,
    summary: Option<csv::Writer<File>>,
}

impl PlotReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roc_plots(mut self, initial: PathBuf, optimized: PathBuf) -> Self {
        self.initial_roc = Some(initial);
        self.optimized_roc = Some(optimized);
        self
    }

    /// Collect one SVG page per round into a zip archive at `path`.
    pub fn with_round_archive(mut self, path: &Path) -> Result<Self> {
        self.rounds_zip = Some(ZipWriter::new(File::create(path)?));
        Ok(self)
    }

    pub fn with_summary_csv(mut self, path: &Path) -> Result<Self> {
        self.summary = Some(csv::Writer::from_writer(File::create(path)?));
        Ok(self)
    }
}

impl Reporter for PlotReporter {
    fn assessment(&mut self, stage: Stage, result: &AssessmentResult) -> Result<()> {
        let (path, title) = match stage {
            Stage::Initial => (&self.initial_roc, "Initial clustering"),
            Stage::Optimized => (&self.optimized_roc, "Optimised clustering"),
        };
        let Some(path) = path else {
            return Ok(());
        };
        let svg = render_roc(
            &roc_curves(result),
            &format!("{} (accuracy {:.3})", title, result.accuracy),
        )?;
        std::fs::write(path, svg)?;
        info!("ROC plot written to {}", path.display());
        Ok(())
    }

    fn round(&mut self, record: &RoundRecord, result: &AssessmentResult) -> Result<()> {
        if let Some(zip) = self.rounds_zip.as_mut() {
            let title = format!(
                "{}: {} clusters, CV accuracy {:.3}",
                record.key,
                result.classes.len(),
                result.cv_accuracy
            );
            let svg = render_roc(&roc_curves(result), &title)?;
            let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
            zip.start_file(format!("round_{}.svg", record.round), options)?;
            zip.write_all(svg.as_bytes())?;
        }

        if let Some(writer) = self.summary.as_mut() {
            writer.serialize(SummaryRow {
                round: record.round,
                key: &record.key,
                clusters: result.classes.len(),
                cv_accuracy: result.cv_accuracy,
                accuracy: result.accuracy,
                merged_into: record.merged.as_ref().map(|m| m.kept.as_str()),
                merged_from: record.merged.as_ref().map(|m| m.absorbed.as_str()),
                merge_rate: record.merged.as_ref().map(|m| m.rate),
            })?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut zip) = self.rounds_zip.take() {
            zip.finish()?;
            info!("Per-round plots archived");
        }
        if let Some(mut writer) = self.summary.take() {
            writer.flush()?;
            info!("Round summary written");
        }
        Ok(())
    }
}

fn plot_error<E: std::fmt::Display>(e: E) -> SccafError {
    SccafError::Plot(e.to_string())
}

/// One-vs-rest ROC curves on a single SVG page.
pub fn render_roc(curves: &[RocCurve], title: &str) -> Result<String> {
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, (800, 600)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_error)?;
        let root = root.margin(10, 10, 10, 10);
        let mut chart = ChartBuilder::on(&root)
            .caption(title, ("sans-serif", 26))
            .x_label_area_size(50)
            .y_label_area_size(50)
            .build_cartesian_2d(0.0..1.0, 0.0..1.0)
            .map_err(plot_error)?;

        chart
            .configure_mesh()
            .x_desc("False Positive Rate")
            .y_desc("True Positive Rate")
            .x_labels(5)
            .y_labels(5)
            .disable_mesh()
            .draw()
            .map_err(plot_error)?;

        for (i, curve) in curves.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            let points: Vec<(f64, f64)> = curve.fpr.iter().copied().zip(curve.tpr.iter().copied()).collect();
            chart
                .draw_series(LineSeries::new(points, color.stroke_width(2)))
                .map_err(plot_error)?
                .label(format!("{} (AUC={:.3})", curve.class, curve.auc))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }

        chart
            .draw_series(LineSeries::new(
                vec![(0.0, 0.0), (1.0, 1.0)],
                RGBColor(180, 180, 180).stroke_width(1),
            ))
            .map_err(plot_error)?;

        if !curves.is_empty() {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .label_font(("sans-serif", 14))
                .position(SeriesLabelPosition::LowerRight)
                .draw()
                .map_err(plot_error)?;
        }

        root.present().map_err(plot_error)?;
    }
    Ok(svg)
}
