//! Volume loading for BraTS patient directories.
//!
//! This module defines the in-memory data model for one patient and the
//! [`VolumeLoader`] seam the processors read through. [`NiftiLoader`] is the
//! on-disk implementation for the `{patient_id}/{patient_id}_{suffix}.{ext}`
//! layout.
//!
//! The loader is where the skull-stripped precondition is enforced: every
//! voxel must be finite and non-negative, so background is exactly zero and
//! foreground is strictly positive.

use std::fmt;
use std::path::{Path, PathBuf};

use ndarray::{Array3, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DatasetConfig;

/// A single MRI modality volume, indexed `[x, y, z]` with z the axial axis.
pub type Volume = Array3<f32>;

/// Segmentation labels with the same shape as the patient's volumes.
pub type SegmentationMask = Array3<u8>;

/// File suffix of the segmentation mask.
pub const MASK_SUFFIX: &str = "seg";

/// Errors that can occur while loading a patient's volumes.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("missing source file: {0}")]
    MissingData(PathBuf),

    #[error("failed to read NIfTI file '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("expected a 3D volume in '{path}', got shape {shape:?}")]
    InvalidDimensions { path: PathBuf, shape: Vec<usize> },

    #[error("voxel {index:?} in '{path}' is {value}; volumes must be finite and non-negative")]
    InvalidIntensity {
        path: PathBuf,
        index: [usize; 3],
        value: f32,
    },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// One of the four MRI acquisition sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    T1,
    T1ce,
    T2,
    Flair,
}

impl Modality {
    /// Default channel order of the stacked tensor.
    pub const ALL: [Modality; 4] = [Modality::T1, Modality::T1ce, Modality::T2, Modality::Flair];

    /// File-name suffix of this modality.
    pub fn suffix(self) -> &'static str {
        match self {
            Modality::T1 => "t1",
            Modality::T1ce => "t1ce",
            Modality::T2 => "t2",
            Modality::Flair => "flair",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// All source data for one patient.
///
/// Built transiently during processing; only its derivatives are persisted.
#[derive(Debug, Clone)]
pub struct PatientRecord {
    pub patient_id: String,
    /// Volumes in the same order as `modalities`.
    pub volumes: Vec<Volume>,
    pub modalities: Vec<Modality>,
    pub mask: SegmentationMask,
}

impl PatientRecord {
    /// Load every modality in `modalities` plus the mask through `loader`.
    ///
    /// Fails on the first missing or unreadable file.
    pub fn load<L: VolumeLoader + ?Sized>(
        loader: &L,
        patient_id: &str,
        modalities: &[Modality],
    ) -> Result<Self> {
        let volumes = modalities
            .iter()
            .map(|&m| loader.load_volume(patient_id, m))
            .collect::<Result<Vec<_>>>()?;
        let mask = loader.load_mask(patient_id)?;

        Ok(Self {
            patient_id: patient_id.to_string(),
            volumes,
            modalities: modalities.to_vec(),
            mask,
        })
    }

    /// Returns the volume of `modality`, if it was loaded.
    pub fn volume(&self, modality: Modality) -> Option<&Volume> {
        self.modalities
            .iter()
            .position(|&m| m == modality)
            .map(|i| &self.volumes[i])
    }
}

/// Source of raw patient volumes.
///
/// Implementations must be shareable across worker threads.
pub trait VolumeLoader: Sync {
    /// Load one modality volume for a patient.
    fn load_volume(&self, patient_id: &str, modality: Modality) -> Result<Volume>;

    /// Load the segmentation mask for a patient.
    fn load_mask(&self, patient_id: &str) -> Result<SegmentationMask>;
}

/// Loads NIfTI volumes from `<raw_dir>/<id>/<id>_<suffix>.<extension>`.
#[derive(Debug, Clone)]
pub struct NiftiLoader {
    raw_dir: PathBuf,
    extension: String,
}

impl NiftiLoader {
    /// Creates a loader rooted at `raw_dir` reading files with `extension`.
    pub fn new<P: Into<PathBuf>>(raw_dir: P, extension: impl Into<String>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            extension: extension.into(),
        }
    }

    /// Creates a loader using the extension from the dataset config.
    pub fn from_config<P: Into<PathBuf>>(raw_dir: P, config: &DatasetConfig) -> Self {
        Self::new(raw_dir, config.extension.clone())
    }

    /// Root directory holding one subdirectory per patient.
    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    /// Path of a patient's file with the given suffix.
    pub fn file_path(&self, patient_id: &str, suffix: &str) -> PathBuf {
        self.raw_dir
            .join(patient_id)
            .join(format!("{}_{}.{}", patient_id, suffix, self.extension))
    }

    fn read_array3(&self, path: &Path) -> Result<Array3<f32>> {
        if !path.is_file() {
            return Err(LoaderError::MissingData(path.to_path_buf()));
        }

        let unreadable = |e: nifti::NiftiError| LoaderError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        };

        let obj = ReaderOptions::new().read_file(path).map_err(unreadable)?;
        let data = obj.into_volume().into_ndarray::<f32>().map_err(unreadable)?;

        let shape = data.shape().to_vec();
        data.into_dimensionality::<Ix3>()
            .map_err(|_| LoaderError::InvalidDimensions {
                path: path.to_path_buf(),
                shape,
            })
    }
}

impl VolumeLoader for NiftiLoader {
    fn load_volume(&self, patient_id: &str, modality: Modality) -> Result<Volume> {
        let path = self.file_path(patient_id, modality.suffix());
        let volume = self.read_array3(&path)?;
        check_background_precondition(&path, &volume)?;
        Ok(volume)
    }

    fn load_mask(&self, patient_id: &str) -> Result<SegmentationMask> {
        let path = self.file_path(patient_id, MASK_SUFFIX);
        let labels = self.read_array3(&path)?;
        labels_to_mask(&path, &labels)
    }
}

/// Reject volumes that break the zero-background assumption.
///
/// Skull-stripped data has exactly-zero background and strictly positive
/// tissue. A negative or non-finite voxel would be silently misclassified
/// by the foreground mask, so it is reported instead.
pub fn check_background_precondition(path: &Path, volume: &Volume) -> Result<()> {
    match volume
        .indexed_iter()
        .find(|(_, &v)| !v.is_finite() || v < 0.0)
    {
        Some(((x, y, z), &value)) => Err(LoaderError::InvalidIntensity {
            path: path.to_path_buf(),
            index: [x, y, z],
            value,
        }),
        None => Ok(()),
    }
}

/// Convert decoded label values to `u8`, rejecting anything that is not a
/// small non-negative integer.
fn labels_to_mask(path: &Path, labels: &Array3<f32>) -> Result<SegmentationMask> {
    if let Some(((x, y, z), &value)) = labels
        .indexed_iter()
        .find(|(_, &v)| !v.is_finite() || v < 0.0 || v > u8::MAX as f32 || v.fract() != 0.0)
    {
        return Err(LoaderError::InvalidIntensity {
            path: path.to_path_buf(),
            index: [x, y, z],
            value,
        });
    }

    Ok(labels.mapv(|v| v as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use nifti::writer::WriterOptions;
    use tempfile::tempdir;

    fn write_volume(loader: &NiftiLoader, patient_id: &str, suffix: &str, data: &Array3<f32>) {
        let path = loader.file_path(patient_id, suffix);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        WriterOptions::new(&path).write_nifti(data).unwrap();
    }

    fn write_mask(loader: &NiftiLoader, patient_id: &str, data: &Array3<u8>) {
        let path = loader.file_path(patient_id, MASK_SUFFIX);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        WriterOptions::new(&path).write_nifti(data).unwrap();
    }

    #[test]
    fn test_modality_suffixes_and_order() {
        let suffixes: Vec<&str> = Modality::ALL.iter().map(|m| m.suffix()).collect();
        assert_eq!(suffixes, vec!["t1", "t1ce", "t2", "flair"]);
        assert_eq!(Modality::T1ce.to_string(), "t1ce");
    }

    #[test]
    fn test_file_path_layout() {
        let loader = NiftiLoader::new("/data/raw", "nii.gz");
        let path = loader.file_path("BraTS2021_00000", "flair");
        assert_eq!(
            path,
            PathBuf::from("/data/raw/BraTS2021_00000/BraTS2021_00000_flair.nii.gz")
        );
    }

    #[test]
    fn test_load_volume_and_mask() {
        let dir = tempdir().unwrap();
        let loader = NiftiLoader::new(dir.path(), "nii");
        let volume = Array3::from_shape_fn((4, 3, 6), |(x, y, z)| (x + y + z) as f32);
        let mask = Array3::from_shape_fn((4, 3, 6), |(x, _, _)| (x % 3) as u8);

        write_volume(&loader, "BraTS2021_00001", "t1", &volume);
        write_mask(&loader, "BraTS2021_00001", &mask);

        let loaded = loader.load_volume("BraTS2021_00001", Modality::T1).unwrap();
        assert_eq!(loaded.shape(), &[4, 3, 6]);
        assert_eq!(loaded[[1, 2, 3]], 6.0);

        let loaded_mask = loader.load_mask("BraTS2021_00001").unwrap();
        assert_eq!(loaded_mask, mask);
    }

    #[test]
    fn test_missing_file_is_missing_data() {
        let dir = tempdir().unwrap();
        let loader = NiftiLoader::new(dir.path(), "nii");

        let err = loader
            .load_volume("BraTS2021_00002", Modality::Flair)
            .unwrap_err();
        match err {
            LoaderError::MissingData(path) => {
                assert!(path.ends_with("BraTS2021_00002/BraTS2021_00002_flair.nii"));
            }
            other => panic!("Expected MissingData, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_file_is_unreadable() {
        let dir = tempdir().unwrap();
        let loader = NiftiLoader::new(dir.path(), "nii");
        let path = loader.file_path("BraTS2021_00003", "t2");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a nifti file").unwrap();

        let err = loader.load_volume("BraTS2021_00003", Modality::T2).unwrap_err();
        assert!(matches!(err, LoaderError::Unreadable { .. }));
    }

    #[test]
    fn test_negative_voxel_rejected() {
        let mut volume = Array3::<f32>::zeros((2, 2, 2));
        volume[[1, 0, 1]] = -3.5;

        let err = check_background_precondition(Path::new("x.nii"), &volume).unwrap_err();
        match err {
            LoaderError::InvalidIntensity { index, value, .. } => {
                assert_eq!(index, [1, 0, 1]);
                assert_eq!(value, -3.5);
            }
            other => panic!("Expected InvalidIntensity, got {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_voxel_rejected() {
        let mut volume = Array3::<f32>::ones((2, 2, 2));
        volume[[0, 1, 0]] = f32::NAN;
        assert!(check_background_precondition(Path::new("x.nii"), &volume).is_err());
    }

    #[test]
    fn test_fractional_mask_label_rejected() {
        let dir = tempdir().unwrap();
        let loader = NiftiLoader::new(dir.path(), "nii");
        let mut labels = Array3::<f32>::zeros((3, 3, 5));
        labels[[2, 1, 4]] = 1.5;
        write_volume(&loader, "BraTS2021_00005", MASK_SUFFIX, &labels);

        let err = loader.load_mask("BraTS2021_00005").unwrap_err();
        match err {
            LoaderError::InvalidIntensity { index, value, .. } => {
                assert_eq!(index, [2, 1, 4]);
                assert_eq!(value, 1.5);
            }
            other => panic!("Expected InvalidIntensity, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_mask_label_rejected() {
        let dir = tempdir().unwrap();
        let loader = NiftiLoader::new(dir.path(), "nii");
        let mut labels = Array3::<f32>::zeros((3, 3, 5));
        labels[[0, 0, 1]] = 300.0;
        write_volume(&loader, "BraTS2021_00006", MASK_SUFFIX, &labels);

        assert!(matches!(
            loader.load_mask("BraTS2021_00006"),
            Err(LoaderError::InvalidIntensity { value, .. }) if value == 300.0
        ));
    }

    #[test]
    fn test_labels_to_mask_bounds() {
        let path = Path::new("seg.nii");
        let mut labels = Array3::<f32>::zeros((2, 2, 2));
        labels[[1, 1, 1]] = 255.0;
        labels[[0, 1, 0]] = 4.0;
        let mask = labels_to_mask(path, &labels).unwrap();
        assert_eq!(mask[[1, 1, 1]], 255);
        assert_eq!(mask[[0, 1, 0]], 4);

        labels[[1, 0, 0]] = -1.0;
        assert!(matches!(
            labels_to_mask(path, &labels),
            Err(LoaderError::InvalidIntensity { index: [1, 0, 0], .. })
        ));
    }

    #[test]
    fn test_patient_record_stops_at_first_missing_modality() {
        let dir = tempdir().unwrap();
        let loader = NiftiLoader::new(dir.path(), "nii");
        let volume = Array3::<f32>::ones((2, 2, 5));
        write_volume(&loader, "BraTS2021_00004", "t1", &volume);

        let err = PatientRecord::load(&loader, "BraTS2021_00004", &Modality::ALL).unwrap_err();
        match err {
            LoaderError::MissingData(path) => {
                assert!(path.to_string_lossy().ends_with("_t1ce.nii"));
            }
            other => panic!("Expected MissingData, got {other:?}"),
        }
    }
}
