use thiserror::Error;

#[derive(Error, Debug)]
pub enum SccafError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Column '{0}' not found in cell metadata")]
    MissingColumn(String),
    #[error("At least 2 distinct clusters are required, found {0}")]
    InsufficientClasses(usize),
    #[error("Cluster '{cluster}' has {size} cell(s), too few for a stratified split")]
    DegenerateCluster { cluster: String, size: usize },
    #[error("Empty input: {0}")]
    EmptyInput(String),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Malformed value in {file}: {detail}")]
    Parse { file: String, detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse delimited file: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to handle JSON metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Classifier failed: {0}")]
    Classifier(#[from] smartcore::error::Failed),
    #[error("Linear algebra failure: {0}")]
    Linalg(String),
    #[error("Plotting failed: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, SccafError>;
