//! Quick-look rendering of a patient's volumes.
//!
//! Renders the middle axial slice of each modality and of the segmentation
//! mask side by side into a PNG using the plotters library. Slices are shown
//! transposed with the origin at the lower left, the usual radiological
//! quick-look orientation.

use std::path::Path;

use ndarray::{ArrayView2, Axis};
use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::core::loaders::{PatientRecord, Volume};

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("Nothing to render")]
    EmptyRecord,

    #[error("{label} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        label: String,
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Gap between panels in pixels.
const PANEL_GAP: u32 = 8;

/// Background color behind the panels.
const CANVAS_COLOR: RGBColor = RGBColor(16, 16, 16);

/// Label colors for the mask panel, indexed by label value.
const LABEL_COLORS: &[(u8, u8, u8)] = &[
    (0, 0, 0),       // background
    (228, 26, 28),   // necrotic core
    (77, 175, 74),   // edema
    (55, 126, 184),  // unused in BraTS 2021
    (255, 215, 0),   // enhancing tumor
];

/// Basic intensity statistics of a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeStats {
    pub shape: [usize; 3],
    pub min: f32,
    pub max: f32,
}

impl VolumeStats {
    pub fn of(volume: &Volume) -> Self {
        let (min, max) = volume
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let s = volume.shape();
        Self {
            shape: [s[0], s[1], s[2]],
            min,
            max,
        }
    }
}

/// Map a slice to 8-bit gray levels using its own min/max.
fn to_gray(slice: ArrayView2<f32>) -> Vec<Vec<u8>> {
    let (lo, hi) = slice
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = if hi > lo { hi - lo } else { 1.0 };

    slice
        .outer_iter()
        .map(|row| {
            row.iter()
                .map(|&v| (((v - lo) / span) * 255.0).round().clamp(0.0, 255.0) as u8)
                .collect()
        })
        .collect()
}

/// Draw a slice indexed `[x][y]` into `area`, transposed with origin lower.
fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    pixels: &[Vec<RGBColor>],
) -> Result<()> {
    let ny = pixels.first().map_or(0, |col| col.len());
    for (x, column) in pixels.iter().enumerate() {
        for (y, color) in column.iter().enumerate() {
            let row = (ny - 1 - y) as i32;
            area.draw_pixel((x as i32, row), color)
                .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;
        }
    }
    Ok(())
}

/// Render the middle axial slice of every modality and the mask to a PNG.
///
/// Returns the slice index that was drawn.
///
/// # Arguments
///
/// * `output_path` - Path to save the PNG image
/// * `record` - Loaded patient volumes and mask
pub fn render_patient_preview(output_path: &Path, record: &PatientRecord) -> Result<usize> {
    let reference = record.volumes.first().ok_or(VisualizationError::EmptyRecord)?;
    let (nx, ny, nz) = reference.dim();
    if nx == 0 || ny == 0 || nz == 0 {
        return Err(VisualizationError::EmptyRecord);
    }
    let shapes = record
        .modalities
        .iter()
        .map(|m| m.to_string())
        .zip(record.volumes.iter().map(|v| v.dim()))
        .chain(std::iter::once(("seg".to_string(), record.mask.dim())));
    for (label, found) in shapes {
        if found != reference.dim() {
            return Err(VisualizationError::ShapeMismatch {
                label,
                expected: reference.dim(),
                found,
            });
        }
    }
    let slice_idx = nz / 2;

    let mut panels: Vec<Vec<Vec<RGBColor>>> = Vec::with_capacity(record.volumes.len() + 1);
    for volume in &record.volumes {
        let gray = to_gray(volume.index_axis(Axis(2), slice_idx));
        panels.push(
            gray.into_iter()
                .map(|col| col.into_iter().map(|g| RGBColor(g, g, g)).collect())
                .collect(),
        );
    }

    panels.push(
        record
            .mask
            .index_axis(Axis(2), slice_idx)
            .outer_iter()
            .map(|col| {
                col.iter()
                    .map(|&label| {
                        let (r, g, b) = LABEL_COLORS
                            .get(label as usize)
                            .copied()
                            .unwrap_or((255, 255, 255));
                        RGBColor(r, g, b)
                    })
                    .collect()
            })
            .collect(),
    );

    let n_panels = panels.len() as u32;
    let width = n_panels * nx as u32 + (n_panels + 1) * PANEL_GAP;
    let height = ny as u32 + 2 * PANEL_GAP;

    let root = BitMapBackend::new(output_path, (width, height)).into_drawing_area();
    root.fill(&CANVAS_COLOR)
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    for (i, pixels) in panels.iter().enumerate() {
        let left = PANEL_GAP + i as u32 * (nx as u32 + PANEL_GAP);
        let area = root
            .clone()
            .shrink((left as i32, PANEL_GAP as i32), (nx as i32, ny as i32));
        draw_panel(&area, pixels)?;
    }

    root.present()
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    Ok(slice_idx)
}
