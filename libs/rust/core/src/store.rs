//! Metrics history and checkpoint persistence.
//!
//! Layout:
//! - `<metrics_dir>/metrics_<algorithm>.json`: JSON array of [`EvaluationRecord`], ascending round
//! - `<checkpoint_dir>/<algorithm>/model_round_<r>.json`: one [`Checkpoint`] per round
//!
//! Every write goes to a temp file in the target directory and is renamed into
//! place, so readers only ever see a complete file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::FlError;
use crate::federated_learning::Algorithm;
use crate::params::ModelParameters;

const CHECKPOINT_PREFIX: &str = "model_round_";
const CHECKPOINT_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub round: u64,
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `[[tn, fp], [fn, tp]]`
    pub confusion_matrix: [[u64; 2]; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub round: u64,
    pub parameters: ModelParameters,
}

#[derive(Debug, Clone)]
pub struct ExperimentStore {
    metrics_dir: PathBuf,
    checkpoint_dir: PathBuf,
}

impl ExperimentStore {
    pub fn new(metrics_dir: impl Into<PathBuf>, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self { metrics_dir: metrics_dir.into(), checkpoint_dir: checkpoint_dir.into() }
    }

    pub fn metrics_path(&self, algorithm: Algorithm) -> PathBuf {
        self.metrics_dir.join(format!("metrics_{algorithm}.json"))
    }

    pub fn checkpoint_dir(&self, algorithm: Algorithm) -> PathBuf { self.checkpoint_dir.join(algorithm.as_str()) }

    pub fn has_metrics(&self, algorithm: Algorithm) -> bool { self.metrics_path(algorithm).exists() }

    /// Stored history; a missing file is an empty history.
    pub fn load_metrics(&self, algorithm: Algorithm) -> Result<Vec<EvaluationRecord>, FlError> {
        let path = self.metrics_path(algorithm);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert `record`, replacing any entry for the same round. Round 0 starts a
    /// fresh history. Returns the sequence as persisted.
    pub fn append_or_replace(&self, algorithm: Algorithm, record: EvaluationRecord) -> Result<Vec<EvaluationRecord>, FlError> {
        let mut history = if record.round == 0 {
            debug!(%algorithm, "metrics_history_reset");
            Vec::new()
        } else {
            match self.load_metrics(algorithm) {
                Ok(h) => h,
                Err(e) => {
                    warn!(%algorithm, error=%e, "metrics_history_unreadable_starting_empty");
                    Vec::new()
                }
            }
        };
        history.retain(|r| r.round != record.round);
        history.push(record);
        history.sort_by_key(|r| r.round);
        let bytes = serde_json::to_vec_pretty(&history)?;
        write_atomic(&self.metrics_path(algorithm), &bytes)?;
        Ok(history)
    }

    pub fn save_checkpoint(&self, algorithm: Algorithm, checkpoint: &Checkpoint) -> Result<PathBuf, FlError> {
        let path = self.checkpoint_dir(algorithm).join(checkpoint_file_name(checkpoint.round));
        let bytes = serde_json::to_vec(checkpoint)?;
        write_atomic(&path, &bytes)?;
        debug!(%algorithm, round = checkpoint.round, path=%path.display(), "checkpoint_saved");
        Ok(path)
    }

    /// Checkpoint files for `algorithm` with the round parsed from their names.
    pub fn list_checkpoints(&self, algorithm: Algorithm) -> Result<Vec<(u64, PathBuf)>, FlError> {
        let dir = self.checkpoint_dir(algorithm);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(round) = name.to_str().and_then(parse_checkpoint_round) {
                found.push((round, entry.path()));
            }
        }
        found.sort_by_key(|(r, _)| *r);
        Ok(found)
    }

    /// Highest-round checkpoint, or `None` if there is none or it cannot be read.
    pub fn latest_checkpoint(&self, algorithm: Algorithm) -> Option<Checkpoint> {
        let listed = match self.list_checkpoints(algorithm) {
            Ok(l) => l,
            Err(e) => {
                warn!(%algorithm, error=%e, "checkpoint_listing_failed_cold_start");
                return None;
            }
        };
        let (round, path) = listed.into_iter().last()?;
        let loaded = fs::read(&path).map_err(FlError::from).and_then(|b| serde_json::from_slice::<Checkpoint>(&b).map_err(FlError::from));
        match loaded {
            Ok(ckpt) if ckpt.round == round => match ckpt.parameters.validate() {
                Ok(()) => {
                    info!(%algorithm, round, path=%path.display(), "checkpoint_found");
                    Some(ckpt)
                }
                Err(e) => {
                    warn!(%algorithm, round, path=%path.display(), error=%e, "checkpoint_invalid_cold_start");
                    None
                }
            },
            Ok(ckpt) => {
                warn!(%algorithm, file_round = round, embedded_round = ckpt.round, "checkpoint_round_mismatch_cold_start");
                None
            }
            Err(e) => {
                warn!(%algorithm, path=%path.display(), error=%e, "checkpoint_load_failed_cold_start");
                None
            }
        }
    }

    /// Delete every checkpoint file of `algorithm`. Returns how many were removed.
    pub fn clear_checkpoints(&self, algorithm: Algorithm) -> Result<usize, FlError> {
        let listed = self.list_checkpoints(algorithm)?;
        for (_, path) in &listed {
            fs::remove_file(path)?;
        }
        if !listed.is_empty() {
            info!(%algorithm, removed = listed.len(), "checkpoints_cleared");
        }
        Ok(listed.len())
    }

    /// Move every metrics file and the checkpoint tree into `<backup_root>/<stamp>`.
    /// Individual move failures are logged and skipped.
    pub fn archive(&self, backup_root: &Path, stamp: &str) -> Result<PathBuf, FlError> {
        let target = backup_root.join(stamp);
        fs::create_dir_all(&target)?;
        info!(backup=%target.display(), "archive_created");
        if self.checkpoint_dir.exists() {
            match fs::rename(&self.checkpoint_dir, target.join("checkpoints")) {
                Ok(()) => info!("checkpoints_archived"),
                Err(e) => warn!(error=%e, "checkpoint_archive_failed"),
            }
        }
        for algorithm in Algorithm::ALL {
            let src = self.metrics_path(algorithm);
            if !src.exists() { continue; }
            let Some(name) = src.file_name() else { continue };
            match fs::rename(&src, target.join(name)) {
                Ok(()) => info!(%algorithm, "metrics_archived"),
                Err(e) => warn!(%algorithm, error=%e, "metrics_archive_failed"),
            }
        }
        Ok(target)
    }
}

pub fn checkpoint_file_name(round: u64) -> String { format!("{CHECKPOINT_PREFIX}{round}{CHECKPOINT_SUFFIX}") }

pub fn parse_checkpoint_round(file_name: &str) -> Option<u64> {
    file_name.strip_prefix(CHECKPOINT_PREFIX)?.strip_suffix(CHECKPOINT_SUFFIX)?.parse().ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FlError> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| FlError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Tensor;

    fn record(round: u64, accuracy: f64) -> EvaluationRecord {
        EvaluationRecord { round, loss: 1.0 - accuracy, accuracy, precision: 0.5, recall: 0.5, f1: 0.5, confusion_matrix: [[1, 0], [0, 1]] }
    }

    fn store() -> (tempfile::TempDir, ExperimentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(dir.path().join("metrics"), dir.path().join("checkpoints"));
        (dir, store)
    }

    #[test]
    fn round_zero_resets_history() {
        let (_d, s) = store();
        for r in 0..4 { s.append_or_replace(Algorithm::FedAvg, record(r, 0.5)).unwrap(); }
        assert_eq!(s.load_metrics(Algorithm::FedAvg).unwrap().len(), 4);
        let h = s.append_or_replace(Algorithm::FedAvg, record(0, 0.1)).unwrap();
        assert_eq!(h, vec![record(0, 0.1)]);
        assert_eq!(s.load_metrics(Algorithm::FedAvg).unwrap(), h);
    }

    #[test]
    fn same_round_is_replaced_not_duplicated() {
        let (_d, s) = store();
        for r in 0..3 { s.append_or_replace(Algorithm::FedProx, record(r, 0.5)).unwrap(); }
        let h = s.append_or_replace(Algorithm::FedProx, record(1, 0.9)).unwrap();
        assert_eq!(h.iter().map(|r| r.round).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(h[1].accuracy, 0.9);
    }

    #[test]
    fn histories_are_kept_per_algorithm() {
        let (_d, s) = store();
        s.append_or_replace(Algorithm::FedAvg, record(0, 0.5)).unwrap();
        s.append_or_replace(Algorithm::FedProx, record(0, 0.6)).unwrap();
        s.append_or_replace(Algorithm::FedAvg, record(0, 0.7)).unwrap();
        assert_eq!(s.load_metrics(Algorithm::FedProx).unwrap()[0].accuracy, 0.6);
    }

    #[test]
    fn latest_checkpoint_picks_highest_parsed_round() {
        let (_d, s) = store();
        let params = ModelParameters::new(vec![Tensor::zeros(vec![2])]);
        for r in [2u64, 10, 9] { s.save_checkpoint(Algorithm::FedAvg, &Checkpoint { round: r, parameters: params.clone() }).unwrap(); }
        // lexical order would pick 9
        assert_eq!(s.latest_checkpoint(Algorithm::FedAvg).unwrap().round, 10);
        assert!(s.latest_checkpoint(Algorithm::FedProx).is_none());
    }

    #[test]
    fn corrupt_checkpoint_degrades_to_none() {
        let (_d, s) = store();
        let dir = s.checkpoint_dir(Algorithm::FedProx);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(checkpoint_file_name(4)), b"{not json").unwrap();
        fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        assert!(s.latest_checkpoint(Algorithm::FedProx).is_none());
    }

    #[test]
    fn checkpoint_with_inconsistent_tensor_is_ignored() {
        let (_d, s) = store();
        let broken = ModelParameters::new(vec![Tensor { shape: vec![2], values: vec![1.0, 2.0, 3.0] }]);
        s.save_checkpoint(Algorithm::FedAvg, &Checkpoint { round: 5, parameters: broken }).unwrap();
        assert!(s.latest_checkpoint(Algorithm::FedAvg).is_none());
    }

    #[test]
    fn clear_checkpoints_only_touches_one_algorithm() {
        let (_d, s) = store();
        let params = ModelParameters::new(vec![Tensor::zeros(vec![2])]);
        for r in [0u64, 1, 40] { s.save_checkpoint(Algorithm::FedAvg, &Checkpoint { round: r, parameters: params.clone() }).unwrap(); }
        s.save_checkpoint(Algorithm::FedProx, &Checkpoint { round: 3, parameters: params }).unwrap();
        let notes = s.checkpoint_dir(Algorithm::FedAvg).join("notes.txt");
        fs::write(&notes, b"kept").unwrap();
        assert_eq!(s.clear_checkpoints(Algorithm::FedAvg).unwrap(), 3);
        assert!(s.list_checkpoints(Algorithm::FedAvg).unwrap().is_empty());
        assert!(notes.exists());
        assert_eq!(s.latest_checkpoint(Algorithm::FedProx).unwrap().round, 3);
        assert_eq!(s.clear_checkpoints(Algorithm::FedAvg).unwrap(), 0);
    }

    #[test]
    fn parses_checkpoint_names() {
        assert_eq!(parse_checkpoint_round("model_round_12.json"), Some(12));
        assert_eq!(parse_checkpoint_round("model_round_x.json"), None);
        assert_eq!(parse_checkpoint_round("model_round_3.pth"), None);
    }

    #[test]
    fn archive_moves_everything_out() {
        let (d, s) = store();
        s.append_or_replace(Algorithm::FedAvg, record(0, 0.5)).unwrap();
        s.save_checkpoint(Algorithm::FedAvg, &Checkpoint { round: 0, parameters: ModelParameters::default() }).unwrap();
        let target = s.archive(&d.path().join("backups"), "2026-01-01_00-00-00").unwrap();
        assert!(!s.has_metrics(Algorithm::FedAvg));
        assert!(s.latest_checkpoint(Algorithm::FedAvg).is_none());
        assert!(target.join("metrics_fedavg.json").exists());
        assert!(target.join("checkpoints").join("fedavg").join("model_round_0.json").exists());
    }
}
