use clap::{value_parser, Arg, ArgAction, ArgGroup, Command};
use colored::*;
use log::{error, info, warn};
use serde_json::json;
use std::path::{Path, PathBuf};

mod assessment;
mod classifier;
mod clustering;
mod confusion;
mod dataset;
mod error;
mod lineage;
mod merge;
mod optimize;
mod report;

use assessment::{AssessmentEngine, Assessor};
use classifier::LogisticRegressionFactory;
use clustering::{initial_clustering, ClusteringConfig};
use confusion::{EstimatorConfig, DEFAULT_HELD_OUT_FRACTION, DEFAULT_ITERATIONS};
use dataset::{distinct_clusters, read_external_clustering, AnnotatedMatrix, ClusterId, Labels};
use error::SccafError;
use lineage::{order_rounds, result_key, write_rounds};
use optimize::{Optimizer, OptimizerConfig, DEFAULT_MIN_ACCURACY, DEFAULT_PREFIX};
use report::{PlotReporter, Reporter, Stage};

/// Parsed command-line options
#[derive(Debug)]
struct Args {
    input: PathBuf,
    output: Option<PathBuf>,
    external_clustering: Option<PathBuf>,
    slot: Option<String>,
    min_acc: f64,
    prefix: String,
    cores: usize,
    boundary: Option<String>,
    iterations: usize,
    test_fraction: f64,
    seed: u64,
    optimise: bool,
    skip_assessment: bool,
    produce_rounds_summary: bool,
    rounds_summary_output: PathBuf,
    plot_rounds: Option<PathBuf>,
    roc_prefix: Option<String>,
    resolution: f64,
    max_rounds: Option<usize>,
    summary_csv: Option<PathBuf>,
    use_raw: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // If no arguments provided, show banner and exit
    if std::env::args().len() <= 1 {
        display_banner();
        std::process::exit(0);
    }

    let matches = setup_cli().get_matches();
    let args = Args {
        input: matches.get_one::<PathBuf>("input").cloned().unwrap_or_default(),
        output: matches.get_one::<PathBuf>("output").cloned(),
        external_clustering: matches.get_one::<PathBuf>("external_clustering").cloned(),
        slot: matches.get_one::<String>("slot").cloned(),
        min_acc: *matches.get_one::<f64>("min_acc").unwrap_or(&DEFAULT_MIN_ACCURACY),
        prefix: matches
            .get_one::<String>("prefix")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        cores: *matches.get_one::<usize>("cores").unwrap_or(&0),
        boundary: matches.get_one::<String>("boundary").cloned(),
        iterations: *matches.get_one::<usize>("iterations").unwrap_or(&DEFAULT_ITERATIONS),
        test_fraction: *matches
            .get_one::<f64>("test_fraction")
            .unwrap_or(&DEFAULT_HELD_OUT_FRACTION),
        seed: *matches.get_one::<u64>("seed").unwrap_or(&0),
        optimise: matches.get_flag("optimise"),
        skip_assessment: matches.get_flag("skip_assessment"),
        produce_rounds_summary: matches.get_flag("produce_rounds_summary"),
        rounds_summary_output: matches
            .get_one::<PathBuf>("rounds_summary_output")
            .cloned()
            .unwrap_or_else(|| PathBuf::from("rounds.txt")),
        plot_rounds: matches.get_one::<PathBuf>("plot_rounds").cloned(),
        roc_prefix: matches.get_one::<String>("roc_prefix").cloned(),
        resolution: *matches
            .get_one::<f64>("resolution")
            .unwrap_or(&clustering::DEFAULT_RESOLUTION),
        max_rounds: matches.get_one::<usize>("max_rounds").copied(),
        summary_csv: matches.get_one::<PathBuf>("summary_csv").cloned(),
        use_raw: matches.get_flag("use_raw"),
    };

    info!("Starting SCCAF v{}", env!("CARGO_PKG_VERSION"));

    let start_time = std::time::Instant::now();
    match run_pipeline(args) {
        Ok(_) => {
            let duration = start_time.elapsed();
            info!("Pipeline completed successfully in {:.2} seconds", duration.as_secs_f64());
        }
        Err(e) => {
            error!("Pipeline failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn display_banner() {
    println!(
        "{}",
        r#"
      ____   ____ ____    _    _____
     / ___| / ___/ ___|  / \  |  ___|
     \___ \| |  | |     / _ \ | |_
      ___) | |__| |___ / ___ \|  _|
     |____/ \____\____/_/   \_\_|

Single-Cell Clustering Assessment Framework
"#
        .bright_green()
        .bold()
    );
    println!("Assesses how well a classifier recovers a clustering from expression data,");
    println!("and merges the most confused clusters round by round until the clustering");
    println!("reaches a self-projection accuracy threshold.");
    println!();
    println!("USAGE:");
    println!("    sccaf --input <BUNDLE> --slot <COLUMN> [OPTIONS]");
    println!("    sccaf --input <BUNDLE> --external-clustering <FILE> --optimise --output <BUNDLE>");
    println!();
    println!("For full documentation, run:");
    println!("    sccaf --help");
    println!();
}

fn section(name: &str, help: &str) -> String {
    format!("{}: {}", name.bright_blue().bold(), help)
}

/// Setup the help menu and command line arguments
fn setup_cli() -> Command {
    Command::new("SCCAF")
        .version(env!("CARGO_PKG_VERSION"))
        .about(format!(
            "{}\n{}",
            "SCCAF: Single-Cell Clustering Assessment Framework".bright_green().bold(),
            "Self-projection assessment and round-based optimisation of cell clusterings".cyan()
        ))
        .arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .help("Input dataset bundle directory (matrix.csv, obs.csv, uns.json)")
                .required(true)
                .num_args(1)
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .help("Output dataset bundle directory, written when optimising")
                .num_args(1)
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("use_raw")
                .long("use-raw")
                .help("Classify on the raw.csv layer instead of matrix.csv")
                .action(ArgAction::SetTrue),
        )
        // Starting clustering group
        .group(
            ArgGroup::new("clustering_source")
                .arg("external_clustering")
                .arg("slot")
                .multiple(false),
        )
        .arg(
            Arg::new("external_clustering")
                .long("external-clustering")
                .help(section("Clustering", "Two-column cell/label table (.csv comma, otherwise tab)"))
                .num_args(1)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("slot")
                .long("slot")
                .help(section("Clustering", "Existing obs column holding the clustering"))
                .num_args(1)
                .value_name("COLUMN"),
        )
        .arg(
            Arg::new("resolution")
                .long("resolution")
                .help(section(
                    "Clustering",
                    "Louvain resolution for the initial clustering when none is supplied",
                ))
                .default_value("1.5")
                .num_args(1)
                .value_name("FLOAT")
                .value_parser(value_parser!(f64)),
        )
        // Assessment group
        .arg(
            Arg::new("skip_assessment")
                .long("skip-assessment")
                .help(section("Assessment", "Skip the initial assessment"))
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .help(section("Assessment", "Held-out splits averaged per confusion estimate"))
                .default_value("3")
                .num_args(1)
                .value_name("INT")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("test_fraction")
                .long("test-fraction")
                .help(section("Assessment", "Fraction of each cluster held out for testing"))
                .default_value("0.5")
                .num_args(1)
                .value_name("FLOAT")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help(section("Assessment", "Seed for the stratified splits"))
                .default_value("0")
                .num_args(1)
                .value_name("INT")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("cores")
                .long("cores")
                .help(section("Assessment", "Threads per classifier (0 = all available)"))
                .default_value("0")
                .num_args(1)
                .value_name("INT")
                .value_parser(value_parser!(usize)),
        )
        // Optimisation group
        .arg(
            Arg::new("optimise")
                .long("optimise")
                .help(section("Optimisation", "Merge clusters round by round until the accuracy threshold is met"))
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("min_acc")
                .long("min-acc")
                .help(section("Optimisation", "Cross-validation accuracy that ends the optimisation"))
                .default_value("0.955")
                .num_args(1)
                .value_name("FLOAT")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .help(section("Optimisation", "Prefix of the per-round obs columns"))
                .default_value("L1")
                .num_args(1)
                .value_name("STR"),
        )
        .arg(
            Arg::new("boundary")
                .long("boundary")
                .help(section("Optimisation", "Cluster that is never merged"))
                .num_args(1)
                .value_name("CLUSTER"),
        )
        .arg(
            Arg::new("max_rounds")
                .long("max-rounds")
                .help(section("Optimisation", "Stop after this many assessed rounds"))
                .num_args(1)
                .value_name("INT")
                .value_parser(value_parser!(usize)),
        )
        // Reporting group
        .arg(
            Arg::new("roc_prefix")
                .long("roc-prefix")
                .help(section("Reporting", "Path prefix for the ROC plots (default: next to the output)"))
                .num_args(1)
                .value_name("PREFIX"),
        )
        .arg(
            Arg::new("plot_rounds")
                .long("plot-rounds")
                .help(section("Reporting", "Zip archive with one ROC page per round"))
                .num_args(1)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("produce_rounds_summary")
                .long("produce-rounds-summary")
                .help(section("Reporting", "Write the round keys, one per line"))
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("rounds_summary_output")
                .long("rounds-summary-output")
                .help(section("Reporting", "Destination of the round key list"))
                .default_value("rounds.txt")
                .num_args(1)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("summary_csv")
                .long("summary-csv")
                .help(section("Reporting", "Per-round accuracy and merge table"))
                .num_args(1)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
}

/// Reject option combinations before any data is read.
fn validate_args(args: &Args) -> Result<(), SccafError> {
    let has_external = args.external_clustering.is_some();
    let has_slot = args.slot.is_some();
    if !args.skip_assessment && has_external == has_slot {
        return Err(SccafError::Config(
            "exactly one of --external-clustering or --slot is required unless --skip-assessment is set".to_string(),
        ));
    }
    if args.skip_assessment && !args.optimise {
        return Err(SccafError::Config(
            "--skip-assessment without --optimise leaves nothing to do".to_string(),
        ));
    }
    if args.optimise && args.output.is_none() {
        return Err(SccafError::Config("--optimise requires --output".to_string()));
    }
    if args.produce_rounds_summary && !args.optimise {
        warn!("--produce-rounds-summary has no rounds to list without --optimise");
    }
    EstimatorConfig {
        iterations: args.iterations,
        held_out_fraction: args.test_fraction,
        n_jobs: args.cores,
        seed: args.seed,
    }
    .validate()
}

/// Locations of the initial and optimised ROC plots.
fn roc_paths(args: &Args) -> (PathBuf, PathBuf) {
    match &args.roc_prefix {
        Some(prefix) => (
            PathBuf::from(format!("{}roc-initial.svg", prefix)),
            PathBuf::from(format!("{}roc-optimized.svg", prefix)),
        ),
        None => {
            let dir = args
                .output
                .as_deref()
                .and_then(Path::parent)
                .or_else(|| args.input.parent())
                .unwrap_or_else(|| Path::new(""));
            (dir.join("roc-initial.svg"), dir.join("roc-optimized.svg"))
        }
    }
}

fn starting_labels(args: &Args, data: &AnnotatedMatrix) -> Result<Labels, SccafError> {
    if let Some(path) = &args.external_clustering {
        info!("Reading external clustering from {}", path.display());
        return read_external_clustering(path, &data.cell_ids);
    }
    if let Some(slot) = &args.slot {
        return data.labels(slot).map_err(|_| {
            let available: Vec<&str> = data.obs_names().collect();
            SccafError::Config(format!(
                "obs column '{}' not found (available: {})",
                slot,
                available.join(", ")
            ))
        });
    }
    let config = ClusteringConfig {
        resolution: args.resolution,
        ..ClusteringConfig::default()
    };
    initial_clustering(data.matrix(args.use_raw)?, &config)
}

fn run_pipeline(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    validate_args(&args)?;

    info!("Loading dataset bundle from {}", args.input.display());
    let mut data = AnnotatedMatrix::load(&args.input)?;
    info!("Loaded {} cells x {} genes", data.n_cells(), data.gene_ids.len());

    let labels = starting_labels(&args, &data)?;
    let n_labelled = labels.iter().filter(|l| l.is_some()).count();
    info!(
        "Starting clustering: {} clusters over {} labelled cells",
        distinct_clusters(&labels).len(),
        n_labelled
    );

    let (initial_roc, optimized_roc) = roc_paths(&args);
    let mut reporter = PlotReporter::new().with_roc_plots(initial_roc, optimized_roc);
    if let Some(path) = &args.plot_rounds {
        reporter = reporter.with_round_archive(path)?;
    }
    if let Some(path) = &args.summary_csv {
        reporter = reporter.with_summary_csv(path)?;
    }

    let factory = LogisticRegressionFactory::default();
    let engine = AssessmentEngine::new(
        &factory,
        EstimatorConfig {
            iterations: args.iterations,
            held_out_fraction: args.test_fraction,
            n_jobs: args.cores,
            seed: args.seed,
        },
    );

    let x = data.matrix(args.use_raw)?;

    let mut starting = None;
    if !args.skip_assessment {
        info!("Assessing the starting clustering...");
        let result = engine.assess(x, &labels)?;
        info!(
            "Starting clustering: accuracy {:.4}, CV mean accuracy {:.4}",
            result.accuracy, result.cv_accuracy
        );
        reporter.assessment(Stage::Initial, &result)?;
        starting = Some(result);
    }

    if !args.optimise {
        reporter.finish()?;
        return Ok(());
    }

    let config = OptimizerConfig {
        prefix: args.prefix.clone(),
        min_accuracy: args.min_acc,
        protected: args.boundary.as_deref().map(ClusterId::new),
        max_rounds: args.max_rounds,
    };
    let mut optimizer = Optimizer::new(x, labels, &engine, &mut reporter, config)?;
    if let Some(result) = starting {
        // same labels and seed, so round 0 would reproduce this assessment
        optimizer = optimizer.with_initial_assessment(result)?;
    }
    let outcome = optimizer.run()?;
    if outcome.converged {
        info!(
            "Reached accuracy {:.4} after {} round(s)",
            outcome.final_accuracy,
            outcome.rounds.len()
        );
    } else {
        warn!(
            "Stopped at accuracy {:.4} ({:?}) after {} round(s)",
            outcome.final_accuracy,
            outcome.reason,
            outcome.rounds.len()
        );
    }
    reporter.assessment(Stage::Optimized, &outcome.final_assessment)?;

    for record in &outcome.rounds {
        data.set_labels(&record.key, &record.labels)?;
    }
    data.set_labels(&result_key(&args.prefix), &outcome.result_labels)?;

    let keys: Vec<&str> = outcome.rounds.iter().map(|r| r.key.as_str()).collect();
    let scores: Vec<serde_json::Value> = outcome
        .rounds
        .iter()
        .zip(&outcome.scores)
        .map(|(record, score)| {
            json!({
                "key": record.key,
                "clusters": score.n_clusters,
                "cv_accuracy": score.cv_accuracy,
                "accuracy": score.accuracy,
                "merged": record.merged.as_ref().map(|m| json!({
                    "kept": m.kept,
                    "absorbed": m.absorbed,
                    "rate": m.rate,
                })),
            })
        })
        .collect();
    data.uns.insert(
        format!("{}_rounds", args.prefix),
        json!({
            "rounds": order_rounds(&keys),
            "scores": scores,
            "min_accuracy": args.min_acc,
            "converged": outcome.converged,
        }),
    );

    if args.produce_rounds_summary {
        write_rounds(&args.rounds_summary_output, &keys)?;
        info!("Round list written to {}", args.rounds_summary_output.display());
    }

    reporter.finish()?;

    if let Some(output) = &args.output {
        data.persist(output)?;
        info!("Optimised dataset written to {}", output.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn args(input: &Path) -> Args {
        Args {
            input: input.to_path_buf(),
            output: None,
            external_clustering: None,
            slot: None,
            min_acc: DEFAULT_MIN_ACCURACY,
            prefix: DEFAULT_PREFIX.to_string(),
            cores: 1,
            boundary: None,
            iterations: DEFAULT_ITERATIONS,
            test_fraction: DEFAULT_HELD_OUT_FRACTION,
            seed: 0,
            optimise: false,
            skip_assessment: false,
            produce_rounds_summary: false,
            rounds_summary_output: PathBuf::from("rounds.txt"),
            plot_rounds: None,
            roc_prefix: None,
            resolution: clustering::DEFAULT_RESOLUTION,
            max_rounds: None,
            summary_csv: None,
            use_raw: false,
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        setup_cli().debug_assert();
    }

    #[test]
    fn both_or_neither_clustering_source_is_rejected() {
        let mut a = args(Path::new("in"));
        assert!(matches!(validate_args(&a), Err(SccafError::Config(_))));
        a.slot = Some("louvain".to_string());
        a.external_clustering = Some(PathBuf::from("clusters.tsv"));
        assert!(matches!(validate_args(&a), Err(SccafError::Config(_))));
        a.external_clustering = None;
        assert!(validate_args(&a).is_ok());
    }

    #[test]
    fn skip_assessment_without_source_needs_optimise() {
        let mut a = args(Path::new("in"));
        a.skip_assessment = true;
        assert!(validate_args(&a).is_err());
        a.optimise = true;
        a.output = Some(PathBuf::from("out"));
        assert!(validate_args(&a).is_ok());
    }

    #[test]
    fn missing_slot_is_a_configuration_error() {
        let data = AnnotatedMatrix::new(
            vec!["c1".to_string(), "c2".to_string()],
            vec!["g1".to_string()],
            Array2::zeros((2, 1)),
        )
        .unwrap();
        let mut a = args(Path::new("in"));
        a.slot = Some("louvain".to_string());
        assert!(matches!(starting_labels(&a, &data), Err(SccafError::Config(_))));
    }

    #[test]
    fn optimises_a_bundle_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");

        // three well separated groups; "3" is an arbitrary split of group "2"
        let mut cells = Vec::new();
        let mut rows = Vec::new();
        let mut slot = Vec::new();
        for i in 0..32 {
            let group = (i / 8).min(2);
            let jitter = (i % 4) as f64 * 0.05;
            cells.push(format!("c{}", i));
            let (gx, gy) = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)][group];
            rows.extend_from_slice(&[gx + jitter, gy - jitter]);
            slot.push(Some((i / 8).to_string()));
        }
        let x = Array2::from_shape_vec((32, 2), rows).unwrap();
        let mut data = AnnotatedMatrix::new(cells, vec!["g1".to_string(), "g2".to_string()], x).unwrap();
        data.set_obs_column("louvain", slot).unwrap();
        data.persist(&input).unwrap();

        let mut a = args(&input);
        a.slot = Some("louvain".to_string());
        a.optimise = true;
        a.output = Some(output.clone());
        a.produce_rounds_summary = true;
        a.rounds_summary_output = dir.path().join("rounds.txt");
        a.summary_csv = Some(dir.path().join("summary.csv"));
        a.plot_rounds = Some(dir.path().join("rounds.zip"));
        run_pipeline(a).unwrap();

        let result = AnnotatedMatrix::load(&output).unwrap();
        assert!(result.obs_column("L1_Round0").is_some());
        let final_labels = result.labels("L1_result").unwrap();
        assert!(distinct_clusters(&final_labels).len() < 4);
        assert!(result.uns.contains_key("L1_rounds"));

        let rounds = std::fs::read_to_string(dir.path().join("rounds.txt")).unwrap();
        assert!(rounds.starts_with("L1_Round0\n"));
        assert!(dir.path().join("roc-initial.svg").exists());
        assert!(dir.path().join("roc-optimized.svg").exists());
        assert!(dir.path().join("summary.csv").exists());
        assert!(dir.path().join("rounds.zip").exists());
    }
}
