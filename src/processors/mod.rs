//! Dataset-level processing stages.

pub mod discovery;
pub mod manifest;
pub mod patient;
pub mod splitting;

// Re-export key types for convenience
pub use discovery::{discover_patients, DiscoveryError};
pub use manifest::{write_manifest, DatasetMetadata, Manifest, ManifestError, ManifestStatus};
pub use patient::{
    process_patient, process_patients, transform_patient, PatientError, PatientOutput,
    ProcessError, ProcessingSummary,
};
pub use splitting::{split_dataset, split_sizes, DatasetSplit, SplitError};
