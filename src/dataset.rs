//! Annotated expression matrix stored as a directory bundle.
//!
//! A bundle holds `matrix.csv` (cells × genes, first column is the cell id),
//! an optional `raw.csv` with the same layout, an optional `obs.csv` with one
//! metadata column per entry, and an optional `uns.json` object for
//! unstructured run metadata.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use log::{info, warn};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SccafError};

pub const MATRIX_FILE: &str = "matrix.csv";
pub const RAW_FILE: &str = "raw.csv";
pub const OBS_FILE: &str = "obs.csv";
pub const UNS_FILE: &str = "uns.json";

/// Categorical cluster label.
///
/// Two ids that both parse as unsigned integers compare numerically, so
/// `"2" < "10"`; numeric ids sort before non-numeric ones, which compare as
/// plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(label: impl Into<String>) -> Self {
        ClusterId(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ClusterId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ClusterId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(label: &str) -> Self {
        ClusterId(label.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(label: String) -> Self {
        ClusterId(label)
    }
}

/// One label per cell, `None` where the cell has no assignment.
pub type Labels = Vec<Option<ClusterId>>;

/// Sorted set of clusters present in `labels`, ignoring missing entries.
pub fn distinct_clusters(labels: &[Option<ClusterId>]) -> Vec<ClusterId> {
    labels
        .iter()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone)]
pub struct RawLayer {
    pub gene_ids: Vec<String>,
    pub x: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct AnnotatedMatrix {
    pub cell_ids: Vec<String>,
    pub gene_ids: Vec<String>,
    pub x: Array2<f64>,
    pub raw: Option<RawLayer>,
    obs: Vec<(String, Vec<Option<String>>)>,
    pub uns: Map<String, Value>,
}

impl AnnotatedMatrix {
    pub fn new(cell_ids: Vec<String>, gene_ids: Vec<String>, x: Array2<f64>) -> Result<Self> {
        if x.nrows() != cell_ids.len() || x.ncols() != gene_ids.len() {
            return Err(SccafError::ShapeMismatch(format!(
                "matrix is {}x{} but {} cell ids and {} gene ids were given",
                x.nrows(),
                x.ncols(),
                cell_ids.len(),
                gene_ids.len()
            )));
        }
        Ok(Self {
            cell_ids,
            gene_ids,
            x,
            raw: None,
            obs: Vec::new(),
            uns: Map::new(),
        })
    }

    /// Load a bundle directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let matrix_path = dir.join(MATRIX_FILE);
        if !matrix_path.exists() {
            return Err(SccafError::Config(format!(
                "Dataset bundle {} has no {}",
                dir.display(),
                MATRIX_FILE
            )));
        }

        let (cell_ids, gene_ids, x) = read_matrix(&matrix_path)?;
        info!("Loaded expression matrix: {} cells x {} genes", cell_ids.len(), gene_ids.len());
        let mut data = Self::new(cell_ids, gene_ids, x)?;

        let raw_path = dir.join(RAW_FILE);
        if raw_path.exists() {
            let (raw_cells, raw_genes, raw_x) = read_matrix(&raw_path)?;
            if raw_cells != data.cell_ids {
                return Err(SccafError::ShapeMismatch(format!(
                    "{} cells do not match {} cells",
                    RAW_FILE, MATRIX_FILE
                )));
            }
            info!("Loaded raw layer: {} genes", raw_genes.len());
            data.raw = Some(RawLayer { gene_ids: raw_genes, x: raw_x });
        }

        let obs_path = dir.join(OBS_FILE);
        if obs_path.exists() {
            data.obs = read_obs(&obs_path, &data.cell_ids)?;
            info!("Loaded {} metadata column(s)", data.obs.len());
        }

        let uns_path = dir.join(UNS_FILE);
        if uns_path.exists() {
            let text = fs::read_to_string(&uns_path)?;
            data.uns = match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map,
                _ => {
                    return Err(SccafError::Parse {
                        file: uns_path.display().to_string(),
                        detail: "top-level value must be an object".to_string(),
                    })
                }
            };
        }

        Ok(data)
    }

    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Expression values used for classification.
    pub fn matrix(&self, use_raw: bool) -> Result<ArrayView2<'_, f64>> {
        if use_raw {
            self.raw
                .as_ref()
                .map(|raw| raw.x.view())
                .ok_or_else(|| SccafError::Config(format!("Dataset has no {} layer", RAW_FILE)))
        } else {
            Ok(self.x.view())
        }
    }

    pub fn obs_names(&self) -> impl Iterator<Item = &str> {
        self.obs.iter().map(|(name, _)| name.as_str())
    }

    pub fn obs_column(&self, name: &str) -> Option<&[Option<String>]> {
        self.obs
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Insert or replace a metadata column.
    pub fn set_obs_column(&mut self, name: &str, values: Vec<Option<String>>) -> Result<()> {
        if values.len() != self.n_cells() {
            return Err(SccafError::ShapeMismatch(format!(
                "column '{}' has {} values for {} cells",
                name,
                values.len(),
                self.n_cells()
            )));
        }
        match self.obs.iter_mut().find(|(col, _)| col == name) {
            Some((_, existing)) => *existing = values,
            None => self.obs.push((name.to_string(), values)),
        }
        Ok(())
    }

    pub fn labels(&self, column: &str) -> Result<Labels> {
        let values = self
            .obs_column(column)
            .ok_or_else(|| SccafError::MissingColumn(column.to_string()))?;
        Ok(values.iter().map(|v| v.as_deref().map(ClusterId::from)).collect())
    }

    pub fn set_labels(&mut self, column: &str, labels: &[Option<ClusterId>]) -> Result<()> {
        let values = labels
            .iter()
            .map(|l| l.as_ref().map(|c| c.as_str().to_string()))
            .collect();
        self.set_obs_column(column, values)
    }

    /// Write the bundle to `dest`.
    ///
    /// Files are staged in a temporary sibling directory and moved into place
    /// only once every file is written, so `dest` is either the previous
    /// content or the complete new bundle.
    pub fn persist(&self, dest: &Path) -> Result<()> {
        if dest.is_file() {
            return Err(SccafError::Config(format!(
                "Output path {} is a file, expected a bundle directory",
                dest.display()
            )));
        }
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        fs::create_dir_all(&parent)?;

        let staging = tempfile::Builder::new().prefix(".sccaf-").tempdir_in(&parent)?;
        write_matrix(&staging.path().join(MATRIX_FILE), &self.cell_ids, &self.gene_ids, &self.x)?;
        if let Some(raw) = &self.raw {
            write_matrix(&staging.path().join(RAW_FILE), &self.cell_ids, &raw.gene_ids, &raw.x)?;
        }
        self.write_obs(&staging.path().join(OBS_FILE))?;
        fs::write(
            staging.path().join(UNS_FILE),
            serde_json::to_string_pretty(&Value::Object(self.uns.clone()))?,
        )?;

        replace_dir(&staging.keep(), dest)?;
        info!("Dataset written to {}", dest.display());
        Ok(())
    }

    fn write_obs(&self, path: &Path) -> Result<()> {
        let mut writer = WriterBuilder::new().from_path(path)?;
        let mut header = vec!["cell"];
        header.extend(self.obs_names());
        writer.write_record(&header)?;

        for (i, cell) in self.cell_ids.iter().enumerate() {
            let mut record = Vec::with_capacity(self.obs.len() + 1);
            record.push(cell.as_str());
            for (_, values) in &self.obs {
                record.push(values[i].as_deref().unwrap_or(""));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn read_matrix(path: &Path) -> Result<(Vec<String>, Vec<String>, Array2<f64>)> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let gene_ids: Vec<String> = reader.headers()?.iter().skip(1).map(str::to_string).collect();
    if gene_ids.is_empty() {
        return Err(SccafError::EmptyInput(format!("{} has no gene columns", path.display())));
    }

    let mut cell_ids = Vec::new();
    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != gene_ids.len() + 1 {
            return Err(SccafError::Parse {
                file: path.display().to_string(),
                detail: format!("row {} has {} fields, expected {}", row + 1, record.len(), gene_ids.len() + 1),
            });
        }
        cell_ids.push(record[0].to_string());
        for field in record.iter().skip(1) {
            let value = field.trim().parse::<f64>().map_err(|e| SccafError::Parse {
                file: path.display().to_string(),
                detail: format!("row {}: '{}' is not a number ({})", row + 1, field, e),
            })?;
            values.push(value);
        }
    }

    let x = Array2::from_shape_vec((cell_ids.len(), gene_ids.len()), values)
        .map_err(|e| SccafError::ShapeMismatch(e.to_string()))?;
    Ok((cell_ids, gene_ids, x))
}

/// Move the directory `staged` to `dest`. An existing `dest` is set aside
/// first and only deleted once the new one is in place; if the move fails it
/// is put back. `staged` is removed on failure.
fn replace_dir(staged: &Path, dest: &Path) -> Result<()> {
    let previous = if dest.exists() {
        warn!("Replacing existing bundle at {}", dest.display());
        let mut aside = staged.as_os_str().to_os_string();
        aside.push(".previous");
        let aside = PathBuf::from(aside);
        if let Err(e) = fs::rename(dest, &aside) {
            let _ = fs::remove_dir_all(staged);
            return Err(e.into());
        }
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(staged, dest) {
        let _ = fs::remove_dir_all(staged);
        if let Some(aside) = &previous {
            if let Err(restore) = fs::rename(aside, dest) {
                warn!(
                    "Could not restore previous bundle from {}: {}",
                    aside.display(),
                    restore
                );
            }
        }
        return Err(e.into());
    }

    if let Some(aside) = previous {
        if let Err(e) = fs::remove_dir_all(&aside) {
            warn!("Could not remove previous bundle at {}: {}", aside.display(), e);
        }
    }
    Ok(())
}

fn write_matrix(path: &Path, cell_ids: &[String], gene_ids: &[String], x: &Array2<f64>) -> Result<()> {
    let mut writer = WriterBuilder::new().from_path(path)?;
    let mut header = Vec::with_capacity(gene_ids.len() + 1);
    header.push("cell".to_string());
    header.extend(gene_ids.iter().cloned());
    writer.write_record(&header)?;

    for (cell, row) in cell_ids.iter().zip(x.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(cell.clone());
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_obs(path: &Path, cell_ids: &[String]) -> Result<Vec<(String, Vec<Option<String>>)>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let names: Vec<String> = reader.headers()?.iter().skip(1).map(str::to_string).collect();
    let index: HashMap<&str, usize> = cell_ids.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

    let mut columns: Vec<Vec<Option<String>>> = vec![vec![None; cell_ids.len()]; names.len()];
    let mut unknown = 0usize;
    for record in reader.records() {
        let record = record?;
        let Some(&row) = index.get(&record[0]) else {
            unknown += 1;
            continue;
        };
        for (col, field) in record.iter().skip(1).enumerate().take(names.len()) {
            if !field.is_empty() {
                columns[col][row] = Some(field.to_string());
            }
        }
    }
    if unknown > 0 {
        warn!("{} row(s) in {} refer to cells not in the matrix", unknown, path.display());
    }

    Ok(names.into_iter().zip(columns).collect())
}

/// Left-join a two-column (cell, cluster) table onto `cell_ids`.
///
/// `.csv` files are comma separated, anything else is read as tab separated.
/// Rows whose cell is not in the dataset (including a header row) are
/// ignored and cells absent from the table get `None`.
pub fn read_external_clustering(path: &Path, cell_ids: &[String]) -> Result<Labels> {
    let delimiter = match path.extension().and_then(|ext| ext.to_str()) {
        Some("csv") => b',',
        _ => b'\t',
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let index: HashMap<&str, usize> = cell_ids.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();
    let mut labels: Labels = vec![None; cell_ids.len()];
    let mut ignored = 0usize;
    let mut duplicates = 0usize;

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < 2 {
            return Err(SccafError::Parse {
                file: path.display().to_string(),
                detail: format!("row {} needs a cell id and a cluster label", row + 1),
            });
        }
        match index.get(record[0].trim()) {
            Some(&i) => {
                let label = record[1].trim();
                if labels[i].is_some() {
                    duplicates += 1;
                }
                labels[i] = if label.is_empty() { None } else { Some(ClusterId::from(label)) };
            }
            None => ignored += 1,
        }
    }

    let matched = labels.iter().filter(|l| l.is_some()).count();
    info!(
        "External clustering: {} of {} cells labelled, {} row(s) ignored",
        matched,
        cell_ids.len(),
        ignored
    );
    if duplicates > 0 {
        warn!("{} cell(s) listed more than once in {}, last label kept", duplicates, path.display());
    }
    if matched < cell_ids.len() {
        warn!("{} cell(s) have no cluster label and will be excluded", cell_ids.len() - matched);
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    fn labels(values: &[Option<&str>]) -> Labels {
        values.iter().map(|v| v.map(ClusterId::from)).collect()
    }

    fn toy() -> AnnotatedMatrix {
        AnnotatedMatrix::new(
            vec!["c1".into(), "c2".into(), "c3".into()],
            vec!["g1".into(), "g2".into()],
            array![[1.0, 0.5], [0.0, 2.25], [3.0, -1.0]],
        )
        .unwrap()
    }

    #[test]
    fn cluster_ids_order_numerically_then_by_string() {
        let mut ids: Vec<ClusterId> = ["10", "b", "2", "a", "0"].iter().map(|&s| s.into()).collect();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(ClusterId::as_str).collect();
        assert_eq!(sorted, vec!["0", "2", "10", "a", "b"]);
    }

    #[test]
    fn distinct_clusters_skips_missing() {
        let assigned = labels(&[Some("3"), None, Some("1"), Some("3")]);
        assert_eq!(distinct_clusters(&assigned), vec![ClusterId::from("1"), ClusterId::from("3")]);
    }

    #[test]
    fn bundle_round_trip_keeps_columns_and_uns() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        let mut data = toy();
        data.set_labels("L1_Round0", &labels(&[Some("0"), None, Some("1")])).unwrap();
        data.uns.insert("note".into(), Value::String("kept".into()));
        data.persist(&dest).unwrap();

        let back = AnnotatedMatrix::load(&dest).unwrap();
        assert_eq!(back.cell_ids, data.cell_ids);
        assert_eq!(back.gene_ids, data.gene_ids);
        assert_eq!(back.x, data.x);
        assert_eq!(back.labels("L1_Round0").unwrap(), labels(&[Some("0"), None, Some("1")]));
        assert_eq!(back.uns.get("note"), Some(&Value::String("kept".into())));
    }

    #[test]
    fn persist_replaces_existing_bundle_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let mut data = toy();
        data.persist(&dest).unwrap();
        data.set_obs_column("extra", vec![Some("x".into()), Some("y".into()), None]).unwrap();
        data.persist(&dest).unwrap();

        let back = AnnotatedMatrix::load(&dest).unwrap();
        assert!(back.obs_column("extra").is_some());
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1, "staging directory should have been moved into place");
    }

    #[test]
    fn failed_replace_keeps_the_previous_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        toy().persist(&dest).unwrap();

        // a staging directory that vanished makes the final rename fail
        let missing = dir.path().join(".sccaf-gone");
        assert!(replace_dir(&missing, &dest).is_err());

        let back = AnnotatedMatrix::load(&dest).unwrap();
        assert_eq!(back.cell_ids, toy().cell_ids);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "the set-aside bundle should have been moved back");
    }

    #[test]
    fn missing_column_is_reported() {
        let data = toy();
        assert!(matches!(data.labels("louvain"), Err(SccafError::MissingColumn(c)) if c == "louvain"));
    }

    #[test]
    fn set_obs_column_rejects_wrong_length() {
        let mut data = toy();
        assert!(data.set_obs_column("short", vec![None]).is_err());
    }

    #[test]
    fn external_clustering_leaves_unknown_cells_unlabelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "cell\tcluster").unwrap();
        writeln!(file, "c1\t0").unwrap();
        writeln!(file, "c3\t1").unwrap();
        writeln!(file, "c9\t2").unwrap();

        let data = toy();
        let joined = read_external_clustering(&path, &data.cell_ids).unwrap();
        assert_eq!(joined, labels(&[Some("0"), None, Some("1")]));
    }

    #[test]
    fn malformed_matrix_value_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MATRIX_FILE), "cell,g1\nc1,abc\n").unwrap();
        assert!(matches!(AnnotatedMatrix::load(dir.path()), Err(SccafError::Parse { .. })));
    }
}
