//! Dataset manifest: the authoritative record of split assignment.
//!
//! The manifest lives at `<output_dir>/manifest.json`. It is written once per
//! run; an existing manifest that disagrees with the current split is never
//! replaced unless the caller asks for it explicitly.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::splitting::DatasetSplit;
use crate::config::{validate_modalities, ConfigurationError, SplitProportions};
use crate::core::loaders::Modality;
use crate::core::writers::{write_text_atomic, WriteError};

/// File name of the manifest inside the output directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Errors that can occur while building, writing or reading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error("failed to read manifest '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(
        "manifest '{0}' already exists with a different split; \
         refusing to overwrite without explicit intent"
    )]
    Conflict(PathBuf),

    #[error("manifest is inconsistent: {0}")]
    Inconsistent(String),
}

/// Static metadata combined with the split.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetMetadata {
    pub name: String,
    pub modalities: Vec<Modality>,
    pub seed: u64,
    pub proportions: SplitProportions,
}

/// Serialized manifest record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub dataset: String,
    pub total_patients: usize,
    pub modalities: Vec<Modality>,
    pub seed: u64,
    pub proportions: SplitProportions,
    pub split: DatasetSplit,
}

/// What [`write_manifest`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestStatus {
    Written,
    Unchanged,
    Replaced,
}

impl Manifest {
    /// Build a manifest from metadata and a split.
    pub fn new(metadata: &DatasetMetadata, split: &DatasetSplit) -> Result<Self, ManifestError> {
        if metadata.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyDatasetName.into());
        }
        validate_modalities(&metadata.modalities)?;

        let manifest = Self {
            dataset: metadata.name.clone(),
            total_patients: split.len(),
            modalities: metadata.modalities.clone(),
            seed: metadata.seed,
            proportions: metadata.proportions,
            split: split.clone(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Location of the manifest for a given output directory.
    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(MANIFEST_FILENAME)
    }

    /// Check that the splits are disjoint, non-empty and add up to
    /// `total_patients`.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if let Some(id) = self.split.first_duplicate() {
            return Err(ManifestError::Inconsistent(format!(
                "patient '{}' is assigned more than once",
                id
            )));
        }
        if self.split.len() != self.total_patients {
            return Err(ManifestError::Inconsistent(format!(
                "total_patients is {} but splits hold {}",
                self.total_patients,
                self.split.len()
            )));
        }
        let (train, val, test) = self.split.sizes();
        if train == 0 || val == 0 || test == 0 {
            return Err(ManifestError::Inconsistent(format!(
                "empty split (sizes {}/{}/{})",
                train, val, test
            )));
        }
        Ok(())
    }

    /// True when every patient in `patient_ids` is assigned and nothing else.
    pub fn covers_exactly(&self, patient_ids: &[String]) -> bool {
        let expected: HashSet<&str> = patient_ids.iter().map(String::as_str).collect();
        let assigned: HashSet<&str> = self
            .split
            .train
            .iter()
            .chain(&self.split.val)
            .chain(&self.split.test)
            .map(String::as_str)
            .collect();
        expected.len() == patient_ids.len() && expected == assigned
    }

    /// Serialize as pretty JSON with two-space indentation.
    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Write `manifest` to `<output_dir>/manifest.json`.
///
/// - No manifest yet: written.
/// - Identical manifest present: left alone.
/// - Different manifest present: `Conflict`, unless `overwrite` is set.
///
/// An unreadable existing file counts as different.
pub fn write_manifest(
    manifest: &Manifest,
    output_dir: &Path,
    overwrite: bool,
) -> Result<ManifestStatus, ManifestError> {
    let path = Manifest::path_in(output_dir);

    let status = if path.exists() {
        match Manifest::load(&path) {
            Ok(existing) if existing == *manifest => {
                log::info!("Manifest unchanged: {}", path.display());
                return Ok(ManifestStatus::Unchanged);
            }
            Ok(_) | Err(_) if !overwrite => return Err(ManifestError::Conflict(path)),
            _ => {
                log::warn!("Replacing existing manifest: {}", path.display());
                ManifestStatus::Replaced
            }
        }
    } else {
        ManifestStatus::Written
    };

    write_text_atomic(&path, &manifest.to_json()?)?;
    log::info!("Manifest -> {}", path.display());

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::splitting::split_dataset;
    use tempfile::tempdir;

    fn metadata(seed: u64) -> DatasetMetadata {
        DatasetMetadata {
            name: "BraTS2021".to_string(),
            modalities: Modality::ALL.to_vec(),
            seed,
            proportions: SplitProportions::default(),
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("BraTS2021_{:05}", i)).collect()
    }

    fn manifest(seed: u64) -> Manifest {
        let split = split_dataset(&ids(10), &SplitProportions::default(), seed).unwrap();
        Manifest::new(&metadata(seed), &split).unwrap()
    }

    #[test]
    fn test_manifest_fields() {
        let m = manifest(42);
        assert_eq!(m.dataset, "BraTS2021");
        assert_eq!(m.total_patients, 10);
        assert_eq!(m.seed, 42);
        assert!(m.covers_exactly(&ids(10)));
        assert!(!m.covers_exactly(&ids(11)));
    }

    #[test]
    fn test_manifest_json_layout() {
        let json = manifest(42).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["dataset"], "BraTS2021");
        assert_eq!(value["total_patients"], 10);
        assert_eq!(
            value["modalities"],
            serde_json::json!(["t1", "t1ce", "t2", "flair"])
        );
        assert_eq!(value["split"]["train"].as_array().unwrap().len(), 7);
        assert!(json.contains("\n  \"dataset\""));
    }

    #[test]
    fn test_write_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let m = manifest(42);

        let status = write_manifest(&m, dir.path(), false).unwrap();
        assert_eq!(status, ManifestStatus::Written);

        let loaded = Manifest::load(&Manifest::path_in(dir.path())).unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn test_rewrite_identical_is_unchanged() {
        let dir = tempdir().unwrap();
        write_manifest(&manifest(42), dir.path(), false).unwrap();
        let status = write_manifest(&manifest(42), dir.path(), false).unwrap();
        assert_eq!(status, ManifestStatus::Unchanged);
    }

    #[test]
    fn test_different_split_conflicts_without_overwrite() {
        let dir = tempdir().unwrap();
        write_manifest(&manifest(42), dir.path(), false).unwrap();

        let err = write_manifest(&manifest(7), dir.path(), false).unwrap_err();
        assert!(matches!(err, ManifestError::Conflict(_)));

        let loaded = Manifest::load(&Manifest::path_in(dir.path())).unwrap();
        assert_eq!(loaded.seed, 42);
    }

    #[test]
    fn test_overwrite_replaces() {
        let dir = tempdir().unwrap();
        write_manifest(&manifest(42), dir.path(), false).unwrap();

        let status = write_manifest(&manifest(7), dir.path(), true).unwrap();
        assert_eq!(status, ManifestStatus::Replaced);
        let loaded = Manifest::load(&Manifest::path_in(dir.path())).unwrap();
        assert_eq!(loaded.seed, 7);
    }

    #[test]
    fn test_corrupt_existing_manifest_conflicts() {
        let dir = tempdir().unwrap();
        fs::write(Manifest::path_in(dir.path()), "{ not json").unwrap();

        let err = write_manifest(&manifest(42), dir.path(), false).unwrap_err();
        assert!(matches!(err, ManifestError::Conflict(_)));
    }

    #[test]
    fn test_missing_modalities_is_config_error() {
        let split = split_dataset(&ids(10), &SplitProportions::default(), 42).unwrap();
        let mut meta = metadata(42);
        meta.modalities.clear();

        let err = Manifest::new(&meta, &split).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::Config(ConfigurationError::MissingModalities)
        ));
    }

    #[test]
    fn test_validate_detects_overlap() {
        let mut m = manifest(42);
        let leaked = m.split.train[0].clone();
        m.split.test.push(leaked);
        m.total_patients += 1;

        assert!(matches!(m.validate(), Err(ManifestError::Inconsistent(_))));
    }
}
