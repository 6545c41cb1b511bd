//! Core data types, transforms and I/O.

pub mod loaders;
pub mod transforms;
pub mod writers;

pub use loaders::{Modality, NiftiLoader, PatientRecord, SegmentationMask, Volume, VolumeLoader};
pub use transforms::{
    crop_depth, middle_slice_range, stack_modalities, zscore_normalize, InvalidVolumeError,
};
pub use writers::{write_npy_atomic, write_report_csv, WriteError};
