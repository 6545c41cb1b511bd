//! Per-patient processing: load, normalize, crop, stack, persist.
//!
//! Each patient is independent. [`process_patients`] fans the work out over
//! rayon and isolates failures, so one unreadable patient never stops the
//! rest of the run.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rayon::prelude::*;
use thiserror::Error;

use crate::config::{CropConfig, PipelineConfig};
use crate::core::loaders::{LoaderError, Modality, PatientRecord, VolumeLoader};
use crate::core::transforms::{
    check_same_shape, crop_depth, middle_slice_range, stack_modalities, zscore_normalize,
    InvalidVolumeError,
};
use crate::core::writers::{write_npy_atomic, ReportRow, WriteError};

/// Why a single patient could not be processed.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error("{modality}: {source}")]
    Normalize {
        modality: Modality,
        #[source]
        source: InvalidVolumeError,
    },

    #[error(transparent)]
    InvalidVolume(#[from] InvalidVolumeError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

/// A failure tagged with the patient it belongs to.
#[derive(Debug, Error)]
#[error("patient {patient_id}: {source}")]
pub struct PatientError {
    pub patient_id: String,
    #[source]
    pub source: ProcessError,
}

impl PatientError {
    fn new(patient_id: &str, source: impl Into<ProcessError>) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            source: source.into(),
        }
    }
}

/// Output file names for one patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientPaths {
    pub data: PathBuf,
    pub seg: PathBuf,
}

impl PatientPaths {
    /// `<output_dir>/<id>_data.npy` and `<output_dir>/<id>_seg.npy`.
    pub fn new(output_dir: &Path, patient_id: &str) -> Self {
        Self {
            data: output_dir.join(format!("{}_data.npy", patient_id)),
            seg: output_dir.join(format!("{}_seg.npy", patient_id)),
        }
    }

    /// True when both final outputs are present.
    pub fn exist(&self) -> bool {
        self.data.is_file() && self.seg.is_file()
    }
}

/// Result of a successfully processed patient.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientOutput {
    pub patient_id: String,
    pub paths: PatientPaths,
    /// Shape of the stacked tensor, `(channels, H, W, cropped depth)`.
    pub data_shape: [usize; 4],
    pub crop: Range<usize>,
    /// Outputs already existed and were left untouched.
    pub skipped: bool,
}

/// Stacked tensor and cropped mask for one patient, before persisting.
#[derive(Debug, Clone)]
pub struct ProcessedPatient {
    pub data: ndarray::Array4<f32>,
    pub mask: ndarray::Array3<u8>,
    pub crop: Range<usize>,
}

/// Turn a loaded patient into its stacked tensor and cropped mask.
///
/// Steps: check all shapes agree, normalize each modality over the full
/// volume, compute the crop once from the first modality's depth, crop the
/// volumes and the mask identically, and stack in record order.
pub fn transform_patient(
    record: &PatientRecord,
    epsilon: f64,
    crop: &CropConfig,
) -> Result<ProcessedPatient, ProcessError> {
    let reference = record
        .volumes
        .first()
        .ok_or(InvalidVolumeError::NoVolumes)?;
    let shape = reference.shape();

    for (modality, volume) in record.modalities.iter().zip(&record.volumes).skip(1) {
        check_same_shape(modality.suffix(), shape, volume.shape())?;
    }
    check_same_shape("seg", shape, record.mask.shape())?;

    let range = middle_slice_range(shape[2], crop.lower_fraction, crop.upper_fraction)?;

    let mut cropped = Vec::with_capacity(record.volumes.len());
    for (&modality, volume) in record.modalities.iter().zip(&record.volumes) {
        let normalized = zscore_normalize(volume, epsilon)
            .map_err(|source| ProcessError::Normalize { modality, source })?;
        cropped.push(crop_depth(&normalized, range.clone())?);
    }

    let data = stack_modalities(&cropped)?;
    let mask = crop_depth(&record.mask, range.clone())?;

    Ok(ProcessedPatient {
        data,
        mask,
        crop: range,
    })
}

/// Process one patient end to end and write its two output arrays.
pub fn process_patient<L: VolumeLoader + ?Sized>(
    patient_id: &str,
    loader: &L,
    output_dir: &Path,
    config: &PipelineConfig,
) -> Result<PatientOutput, PatientError> {
    let record = PatientRecord::load(loader, patient_id, &config.dataset.modalities)
        .map_err(|e| PatientError::new(patient_id, e))?;

    let processed = transform_patient(&record, config.normalization.epsilon, &config.crop)
        .map_err(|e| PatientError::new(patient_id, e))?;
    drop(record);

    let paths = PatientPaths::new(output_dir, patient_id);
    write_npy_atomic(&paths.data, &processed.data).map_err(|e| PatientError::new(patient_id, e))?;
    write_npy_atomic(&paths.seg, &processed.mask).map_err(|e| PatientError::new(patient_id, e))?;

    let s = processed.data.shape();
    log::debug!(
        "{}: wrote {:?} (slices {}..{})",
        patient_id,
        s,
        processed.crop.start,
        processed.crop.end
    );

    Ok(PatientOutput {
        patient_id: patient_id.to_string(),
        paths,
        data_shape: [s[0], s[1], s[2], s[3]],
        crop: processed.crop,
        skipped: false,
    })
}

/// Summary statistics of a written stacked tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    /// Mean over non-zero voxels; close to 0 after normalization.
    pub nonzero_mean: f64,
}

/// Read back a patient's stacked tensor and summarize it.
pub fn inspect_output(paths: &PatientPaths) -> anyhow::Result<OutputStats> {
    let data: ndarray::Array4<f32> = ndarray_npy::read_npy(&paths.data)
        .with_context(|| format!("Failed to read {}", paths.data.display()))?;

    let (min, max) = data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let (count, sum) = data
        .iter()
        .filter(|&&v| v != 0.0)
        .fold((0usize, 0.0f64), |(n, acc), &v| (n + 1, acc + v as f64));

    Ok(OutputStats {
        shape: data.shape().to_vec(),
        min,
        max,
        nonzero_mean: if count > 0 { sum / count as f64 } else { 0.0 },
    })
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct ProcessingSummary {
    pub succeeded: Vec<PatientOutput>,
    pub failed: Vec<PatientError>,
}

impl ProcessingSummary {
    /// IDs of patients that failed, in input order.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|e| e.patient_id.as_str()).collect()
    }

    /// Total number of patients attempted.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Rows for the CSV processing report, sorted by patient ID.
    pub fn report_rows(&self) -> Vec<ReportRow> {
        let mut rows: Vec<ReportRow> = self
            .succeeded
            .iter()
            .map(|o| ReportRow {
                patient_id: o.patient_id.clone(),
                status: if o.skipped { "skipped" } else { "ok" },
                cropped_depth: (!o.skipped).then(|| o.crop.len()),
                error: None,
            })
            .chain(self.failed.iter().map(|e| ReportRow {
                patient_id: e.patient_id.clone(),
                status: "failed",
                cropped_depth: None,
                error: Some(e.source.to_string()),
            }))
            .collect();
        rows.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        rows
    }
}

/// Process every patient in `patient_ids`.
///
/// Failures are logged with the patient ID and collected; they never abort
/// other patients. `on_done` is called once per patient as it finishes, from
/// whichever worker thread handled it. Output order in the summary follows
/// `patient_ids`.
pub fn process_patients<L, F>(
    patient_ids: &[String],
    loader: &L,
    output_dir: &Path,
    config: &PipelineConfig,
    on_done: F,
) -> ProcessingSummary
where
    L: VolumeLoader + ?Sized,
    F: Fn(&str) + Sync,
{
    let run_one = |patient_id: &String| {
        let result = if config.processing.skip_existing
            && PatientPaths::new(output_dir, patient_id).exist()
        {
            log::info!("{}: outputs exist, skipping", patient_id);
            Ok(PatientOutput {
                patient_id: patient_id.clone(),
                paths: PatientPaths::new(output_dir, patient_id),
                data_shape: [0; 4],
                crop: 0..0,
                skipped: true,
            })
        } else {
            process_patient(patient_id, loader, output_dir, config)
        };

        if let Err(e) = &result {
            log::error!("{}", e);
        }
        on_done(patient_id);
        result
    };

    let results: Vec<Result<PatientOutput, PatientError>> = if config.processing.parallel {
        patient_ids.par_iter().map(run_one).collect()
    } else {
        patient_ids.iter().map(run_one).collect()
    };

    let mut summary = ProcessingSummary::default();
    for result in results {
        match result {
            Ok(output) => summary.succeeded.push(output),
            Err(e) => summary.failed.push(e),
        }
    }
    summary
}
