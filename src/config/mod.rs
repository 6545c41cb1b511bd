//! Configuration types for the BraTS preprocessing pipeline.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::loaders::Modality;

/// Tolerance used when checking that split proportions sum to one.
pub const PROPORTION_TOLERANCE: f64 = 1e-6;

/// Errors raised by invalid or unreadable configuration.
///
/// These are fatal: they abort a run before any patient is processed.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("split proportions must sum to 1.0, got {train} + {val} + {test} = {sum}")]
    ProportionSum {
        train: f64,
        val: f64,
        test: f64,
        sum: f64,
    },

    #[error("split proportion '{name}' must lie strictly between 0 and 1, got {value}")]
    ProportionRange { name: &'static str, value: f64 },

    #[error("crop fractions must satisfy 0 <= lower < upper <= 1, got lower={lower}, upper={upper}")]
    CropFractions { lower: f64, upper: f64 },

    #[error("normalization epsilon must be finite and positive, got {0}")]
    Epsilon(f64),

    #[error("modality list is empty")]
    MissingModalities,

    #[error("modality list must name each of t1, t1ce, t2, flair exactly once, got {0:?}")]
    InvalidModalities(Vec<Modality>),

    #[error("dataset name must not be empty")]
    EmptyDatasetName,
}

/// Dataset identity and on-disk naming conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset identifier recorded in the manifest
    #[serde(default = "default_dataset_name")]
    pub name: String,

    /// Prefix of patient directory names (followed by five digits)
    #[serde(default = "default_patient_prefix")]
    pub patient_prefix: String,

    /// Volume file extension, without the leading dot
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Channel order of the stacked tensor
    #[serde(default = "default_modalities")]
    pub modalities: Vec<Modality>,
}

fn default_dataset_name() -> String {
    "BraTS2021".to_string()
}

fn default_patient_prefix() -> String {
    "BraTS2021_".to_string()
}

fn default_extension() -> String {
    "nii.gz".to_string()
}

fn default_modalities() -> Vec<Modality> {
    Modality::ALL.to_vec()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: default_dataset_name(),
            patient_prefix: default_patient_prefix(),
            extension: default_extension(),
            modalities: default_modalities(),
        }
    }
}

/// Configuration for background-aware z-score normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Added to the foreground standard deviation before dividing
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_epsilon() -> f64 {
    1e-8
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
        }
    }
}

/// Configuration for axial cropping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropConfig {
    /// Fraction of slices discarded from the bottom of the volume
    #[serde(default = "default_lower_fraction")]
    pub lower_fraction: f64,

    /// Fraction of the depth at which the kept range ends (exclusive)
    #[serde(default = "default_upper_fraction")]
    pub upper_fraction: f64,
}

fn default_lower_fraction() -> f64 {
    0.2
}

fn default_upper_fraction() -> f64 {
    0.8
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            lower_fraction: default_lower_fraction(),
            upper_fraction: default_upper_fraction(),
        }
    }
}

/// Train/validation/test proportions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitProportions {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl SplitProportions {
    /// Check that each proportion lies in (0, 1) and that they sum to one.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, value) in [("train", self.train), ("val", self.val), ("test", self.test)] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigurationError::ProportionRange { name, value });
            }
        }

        let sum = self.train + self.val + self.test;
        if (sum - 1.0).abs() > PROPORTION_TOLERANCE {
            return Err(ConfigurationError::ProportionSum {
                train: self.train,
                val: self.val,
                test: self.test,
                sum,
            });
        }

        Ok(())
    }
}

impl Default for SplitProportions {
    fn default() -> Self {
        Self {
            train: 0.70,
            val: 0.15,
            test: 0.15,
        }
    }
}

/// Configuration for the dataset split and its manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default)]
    pub proportions: SplitProportions,

    /// Seed for the split RNG, recorded in the manifest
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Replace an existing manifest that disagrees with this run
    #[serde(default)]
    pub overwrite_manifest: bool,
}

fn default_seed() -> u64 {
    42
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            proportions: SplitProportions::default(),
            seed: default_seed(),
            overwrite_manifest: false,
        }
    }
}

/// Configuration for the per-patient processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Only process the first N discovered patients (all when unset)
    #[serde(default)]
    pub limit: Option<usize>,

    /// Process patients on a rayon thread pool
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Worker thread count (rayon default when unset)
    #[serde(default)]
    pub num_threads: Option<usize>,

    /// Skip patients whose outputs already exist
    #[serde(default)]
    pub skip_existing: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            limit: None,
            parallel: default_parallel(),
            num_threads: None,
            skip_existing: false,
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub normalization: NormalizationConfig,

    #[serde(default)]
    pub crop: CropConfig,

    #[serde(default)]
    pub split: SplitConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|e| ConfigurationError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Validate every section. Called before any patient is touched.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.dataset.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyDatasetName);
        }
        validate_modalities(&self.dataset.modalities)?;

        let eps = self.normalization.epsilon;
        if !(eps.is_finite() && eps > 0.0) {
            return Err(ConfigurationError::Epsilon(eps));
        }

        let (lower, upper) = (self.crop.lower_fraction, self.crop.upper_fraction);
        if !(0.0..1.0).contains(&lower) || !(upper > lower && upper <= 1.0) {
            return Err(ConfigurationError::CropFractions { lower, upper });
        }

        self.split.proportions.validate()
    }
}

/// A modality order must be a permutation of the four supported modalities.
pub fn validate_modalities(modalities: &[Modality]) -> Result<(), ConfigurationError> {
    if modalities.is_empty() {
        return Err(ConfigurationError::MissingModalities);
    }

    let is_permutation = modalities.len() == Modality::ALL.len()
        && Modality::ALL.iter().all(|m| modalities.contains(m));

    if !is_permutation {
        return Err(ConfigurationError::InvalidModalities(modalities.to_vec()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.dataset.name, "BraTS2021");
        assert_eq!(config.dataset.modalities, Modality::ALL.to_vec());
        assert_eq!(config.split.seed, 42);
        assert_eq!(config.processing.limit, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proportions_must_sum_to_one() {
        let proportions = SplitProportions {
            train: 0.7,
            val: 0.2,
            test: 0.2,
        };
        assert!(matches!(
            proportions.validate(),
            Err(ConfigurationError::ProportionSum { .. })
        ));
    }

    #[test]
    fn test_proportions_tolerate_rounding() {
        let proportions = SplitProportions {
            train: 0.1 + 0.6,
            val: 0.15,
            test: 0.15,
        };
        assert!(proportions.validate().is_ok());
    }

    #[test]
    fn test_zero_proportion_rejected() {
        let proportions = SplitProportions {
            train: 0.85,
            val: 0.15,
            test: 0.0,
        };
        assert!(matches!(
            proportions.validate(),
            Err(ConfigurationError::ProportionRange { name: "test", .. })
        ));
    }

    #[test]
    fn test_modality_list_validation() {
        assert!(matches!(
            validate_modalities(&[]),
            Err(ConfigurationError::MissingModalities)
        ));
        assert!(matches!(
            validate_modalities(&[Modality::T1, Modality::T1, Modality::T2, Modality::Flair]),
            Err(ConfigurationError::InvalidModalities(_))
        ));
        assert!(validate_modalities(&[
            Modality::Flair,
            Modality::T2,
            Modality::T1ce,
            Modality::T1
        ])
        .is_ok());
    }

    #[test]
    fn test_invalid_crop_fractions() {
        let mut config = PipelineConfig::default();
        config.crop.lower_fraction = 0.8;
        config.crop.upper_fraction = 0.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::CropFractions { .. })
        ));
    }

    #[test]
    fn test_yaml_roundtrip_with_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "split:\n  seed: 7\ndataset:\n  extension: nii\n").unwrap();

        let config = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(config.split.seed, 7);
        assert_eq!(config.dataset.extension, "nii");
        assert_eq!(config.dataset.name, "BraTS2021");
        assert_eq!(config.split.proportions, SplitProportions::default());

        let out = dir.path().join("written.yaml");
        config.to_yaml(&out).unwrap();
        let reloaded = PipelineConfig::from_yaml(&out).unwrap();
        assert_eq!(reloaded.split.seed, 7);
    }
}
