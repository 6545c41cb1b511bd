//! Preprocessing pipeline for BraTS multi-modal brain MRI.
//!
//! This crate provides tools for:
//! - Loading the four MRI modalities and segmentation mask of each patient
//! - Background-aware z-score normalization
//! - Cropping every volume and the mask to the same middle axial range
//! - Stacking modalities into a `(4, H, W, D)` tensor saved as `.npy`
//! - A seeded, reproducible train/val/test split recorded in a manifest
//!
//! # Example
//!
//! ```no_run
//! use brats_pipeline::{
//!     core::loaders::NiftiLoader,
//!     processors::{discover_patients, process_patients},
//!     PipelineConfig,
//! };
//! use std::path::Path;
//!
//! let config = PipelineConfig::default();
//! let raw = Path::new("raw");
//! let patients = discover_patients(raw, &config.dataset.patient_prefix).unwrap();
//! let loader = NiftiLoader::from_config(raw, &config.dataset);
//! let summary = process_patients(&patients, &loader, Path::new("processed"), &config, |_| {});
//! println!("{} ok, {} failed", summary.succeeded.len(), summary.failed.len());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod visualization;

pub use config::{
    ConfigurationError, CropConfig, DatasetConfig, NormalizationConfig, PipelineConfig,
    ProcessingConfig, SplitConfig, SplitProportions,
};
pub use crate::core::loaders::{Modality, PatientRecord};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
