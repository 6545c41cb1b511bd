//! Per-volume transformations: normalization, axial cropping and stacking.
//!
//! All functions here are pure. They take arrays by reference and return new
//! arrays; nothing is mutated in place.

use std::ops::Range;

use ndarray::{s, stack, Array3, Array4, ArrayView3, Axis};
use thiserror::Error;

use super::loaders::Volume;

/// Smallest axial depth accepted by [`middle_slice_range`].
pub const MIN_DEPTH: usize = 5;

/// Errors raised by volumes that cannot be transformed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidVolumeError {
    #[error("volume has no foreground voxels (all intensities <= 0)")]
    EmptyForeground,

    #[error("shape mismatch: {label} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        label: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("volume depth {depth} is below the minimum of {minimum} axial slices")]
    TooFewSlices { depth: usize, minimum: usize },

    #[error("crop range {start}..{end} is empty for depth {depth}")]
    DegenerateCrop {
        start: usize,
        end: usize,
        depth: usize,
    },

    #[error("crop range {start}..{end} exceeds depth {depth}")]
    CropOutOfBounds {
        start: usize,
        end: usize,
        depth: usize,
    },

    #[error("nothing to stack")]
    NoVolumes,
}

/// Result type for transform operations.
pub type Result<T> = std::result::Result<T, InvalidVolumeError>;

/// Foreground statistics of a single volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForegroundStats {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation (ddof = 0).
    pub std: f64,
}

/// Mean and standard deviation over voxels with strictly positive intensity.
///
/// Returns `EmptyForeground` when no voxel is positive.
pub fn foreground_stats(volume: &Volume) -> Result<ForegroundStats> {
    let mut count = 0usize;
    let mut sum = 0.0f64;
    for &v in volume.iter().filter(|&&v| v > 0.0) {
        count += 1;
        sum += v as f64;
    }

    if count == 0 {
        return Err(InvalidVolumeError::EmptyForeground);
    }

    let mean = sum / count as f64;
    let sq_dev: f64 = volume
        .iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum();

    Ok(ForegroundStats {
        count,
        mean,
        std: (sq_dev / count as f64).sqrt(),
    })
}

/// Background-aware z-score normalization.
///
/// Foreground voxels (intensity > 0) become `(x - mean) / (std + epsilon)`
/// using statistics of the foreground only. Background voxels are exactly
/// zero in the output.
///
/// # Errors
///
/// Returns `EmptyForeground` for a volume without positive voxels instead of
/// producing NaN.
///
/// # Example
///
/// ```
/// use brats_pipeline::core::transforms::zscore_normalize;
/// use ndarray::array;
///
/// let volume = array![[[0.0f32, 1.0], [2.0, 3.0]]];
/// let normalized = zscore_normalize(&volume, 1e-8).unwrap();
/// assert_eq!(normalized[[0, 0, 0]], 0.0);
/// ```
pub fn zscore_normalize(volume: &Volume, epsilon: f64) -> Result<Array3<f32>> {
    let stats = foreground_stats(volume)?;
    let denom = stats.std + epsilon;

    Ok(volume.mapv(|v| {
        if v > 0.0 {
            ((v as f64 - stats.mean) / denom) as f32
        } else {
            0.0
        }
    }))
}

/// Half-open axial range `[floor(lower * depth), floor(upper * depth))`.
///
/// With the default fractions (0.2, 0.8) this keeps the middle 60% of slices.
/// A depth of 155 yields `31..124`.
///
/// # Errors
///
/// - `TooFewSlices` when `depth < MIN_DEPTH`
/// - `DegenerateCrop` when the fractions leave no slice
pub fn middle_slice_range(depth: usize, lower: f64, upper: f64) -> Result<Range<usize>> {
    if depth < MIN_DEPTH {
        return Err(InvalidVolumeError::TooFewSlices {
            depth,
            minimum: MIN_DEPTH,
        });
    }

    let start = (depth as f64 * lower).floor() as usize;
    let end = ((depth as f64 * upper).floor() as usize).min(depth);

    if start >= end {
        return Err(InvalidVolumeError::DegenerateCrop { start, end, depth });
    }

    Ok(start..end)
}

/// Keep only `range` along the depth (third) axis.
///
/// The first two dimensions are unchanged. The result is in standard layout.
pub fn crop_depth<A: Clone>(array: &Array3<A>, range: Range<usize>) -> Result<Array3<A>> {
    let depth = array.len_of(Axis(2));
    if range.start >= range.end {
        return Err(InvalidVolumeError::DegenerateCrop {
            start: range.start,
            end: range.end,
            depth,
        });
    }
    if range.end > depth {
        return Err(InvalidVolumeError::CropOutOfBounds {
            start: range.start,
            end: range.end,
            depth,
        });
    }

    Ok(array
        .slice(s![.., .., range])
        .as_standard_layout()
        .into_owned())
}

/// Stack equally shaped volumes along a new leading channel axis.
///
/// Channel `i` of the result is `volumes[i]`.
pub fn stack_modalities(volumes: &[Array3<f32>]) -> Result<Array4<f32>> {
    let first = volumes.first().ok_or(InvalidVolumeError::NoVolumes)?;
    for (i, volume) in volumes.iter().enumerate().skip(1) {
        check_same_shape(&format!("channel {}", i), first.shape(), volume.shape())?;
    }

    let views: Vec<ArrayView3<f32>> = volumes.iter().map(|v| v.view()).collect();
    stack(Axis(0), &views).map_err(|_| InvalidVolumeError::ShapeMismatch {
        label: "stack".to_string(),
        expected: first.shape().to_vec(),
        found: Vec::new(),
    })
}

/// Fail with `ShapeMismatch` unless `found == expected`.
pub fn check_same_shape(label: &str, expected: &[usize], found: &[usize]) -> Result<()> {
    if expected != found {
        return Err(InvalidVolumeError::ShapeMismatch {
            label: label.to_string(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}
