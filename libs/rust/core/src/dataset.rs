//! Numeric CSV samples with a 0/1 label in the last column.
//!
//! Feature engineering is out of scope: every non-label column must already
//! parse as a number. A first line that does not parse is treated as a header.

use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::debug;

use crate::error::FlError;
use crate::partition::partition;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<f32>,
}

impl Dataset {
    pub fn new(features: Vec<Vec<f32>>, labels: Vec<f32>) -> Result<Self, FlError> {
        if features.len() != labels.len() {
            return Err(FlError::Dataset(format!("{} rows but {} labels", features.len(), labels.len())));
        }
        if let Some(dim) = features.first().map(Vec::len) {
            if let Some(bad) = features.iter().position(|r| r.len() != dim) {
                return Err(FlError::Dataset(format!("row {bad} has {} features, expected {dim}", features[bad].len())));
            }
        }
        Ok(Self { features, labels })
    }

    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }
    pub fn dim(&self) -> usize { self.features.first().map_or(0, Vec::len) }

    pub fn slice(&self, range: Range<usize>) -> Self {
        Self { features: self.features[range.clone()].to_vec(), labels: self.labels[range].to_vec() }
    }

    pub fn parse_csv(text: &str) -> Result<Self, FlError> {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() { continue; }
            let parsed: Result<Vec<f32>, _> = line.split(',').map(|c| c.trim().parse::<f32>()).collect();
            let mut row = match parsed {
                Ok(r) => r,
                Err(_) if line_no == 0 => continue,
                Err(e) => return Err(FlError::Dataset(format!("line {}: {e}", line_no + 1))),
            };
            let label = row.pop().ok_or_else(|| FlError::Dataset(format!("line {}: no columns", line_no + 1)))?;
            if label != 0.0 && label != 1.0 {
                return Err(FlError::Dataset(format!("line {}: label {label} is not 0 or 1", line_no + 1)));
            }
            features.push(row);
            labels.push(label);
        }
        Self::new(features, labels)
    }

    pub fn load_csv(path: &Path) -> Result<Self, FlError> {
        let text = fs::read_to_string(path).map_err(|e| FlError::Dataset(format!("{}: {e}", path.display())))?;
        let ds = Self::parse_csv(&text)?;
        debug!(path=%path.display(), rows = ds.len(), dim = ds.dim(), "dataset_loaded");
        Ok(ds)
    }

    /// Load the file and keep only partition `index` of `workers`.
    pub fn load_partition(path: &Path, workers: usize, index: usize) -> Result<Self, FlError> {
        let full = Self::load_csv(path)?;
        let range = partition(full.len(), workers, index)?;
        Ok(full.slice(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_header() {
        let ds = Dataset::parse_csv("a,b,label\n1,2,0\n3,4,1\n").unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.dim(), 2);
        assert_eq!(ds.labels, vec![0.0, 1.0]);
        assert_eq!(Dataset::parse_csv("0.5,1\n").unwrap().features, vec![vec![0.5]]);
    }

    #[test]
    fn rejects_bad_rows() {
        assert!(Dataset::parse_csv("1,2,0\nx,2,1\n").is_err());
        assert!(Dataset::parse_csv("1,2,3\n").is_err());
        assert!(Dataset::parse_csv("1,2,0\n1,1\n").is_err());
    }

    #[test]
    fn loads_only_the_requested_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        let rows: String = (0..10).map(|i| format!("{i},{}\n", i % 2)).collect();
        fs::write(&path, rows).unwrap();
        let part = Dataset::load_partition(&path, 3, 3).unwrap();
        assert_eq!(part.features, vec![vec![6.0], vec![7.0], vec![8.0], vec![9.0]]);
        assert!(matches!(Dataset::load_partition(&path, 11, 1), Err(FlError::InvalidPartition { .. })));
    }
}
