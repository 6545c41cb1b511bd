//! Output writers for processed arrays and run reports.
//!
//! This module provides:
//! - `.npy` array output written to a temporary name and renamed on success
//! - atomic text output (used for the manifest)
//! - a CSV report of per-patient outcomes

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{ArrayBase, Data, Dimension};
use ndarray_npy::{WritableElement, WriteNpyExt};
use thiserror::Error;

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Array serialization error.
    #[error("NPY write error for '{path}': {source}")]
    NpyError {
        path: String,
        #[source]
        source: ndarray_npy::WriteNpyError,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// Failed to move the finished temporary file into place.
    #[error("failed to rename '{from}' to '{to}': {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Hidden sibling used while `path` is being written.
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Run `write` against a temporary sibling of `path`, then rename it into
/// place. The temporary file is removed if writing fails.
fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    ensure_parent_dirs(path)?;
    let tmp = temp_path(path);

    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        WriteError::Rename {
            from: tmp.display().to_string(),
            to: path.display().to_string(),
            source: e,
        }
    })
}

/// Write an array to a `.npy` file.
///
/// The data lands under a temporary name first, so a crash never leaves a
/// truncated file at `path`.
///
/// # Example
///
/// ```no_run
/// use brats_pipeline::core::writers::write_npy_atomic;
/// use ndarray::Array3;
/// use std::path::Path;
///
/// let mask = Array3::<u8>::zeros((240, 240, 93));
/// write_npy_atomic(Path::new("BraTS2021_00000_seg.npy"), &mask).unwrap();
/// ```
pub fn write_npy_atomic<A, S, D>(path: &Path, array: &ArrayBase<S, D>) -> Result<()>
where
    A: WritableElement,
    S: Data<Elem = A>,
    D: Dimension,
{
    write_atomically(path, |tmp| {
        let mut writer = create_buffered_writer(tmp)?;
        array
            .write_npy(&mut writer)
            .map_err(|e| WriteError::NpyError {
                path: path.display().to_string(),
                source: e,
            })?;
        writer.flush().map_err(|e| WriteError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })
    })
}

/// Write a text document to `path` atomically.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    write_atomically(path, |tmp| {
        let mut writer = create_buffered_writer(tmp)?;
        let path_str = path.display().to_string();
        writer
            .write_all(content.as_bytes())
            .map_err(|e| WriteError::WriteFile {
                path: path_str.clone(),
                source: e,
            })?;
        writer.flush().map_err(|e| WriteError::WriteFile {
            path: path_str,
            source: e,
        })
    })
}

/// One row of the processing report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub patient_id: String,
    pub status: &'static str,
    pub cropped_depth: Option<usize>,
    pub error: Option<String>,
}

/// Write the per-patient processing report as CSV.
///
/// Columns: `patient_id,status,cropped_depth,error`.
pub fn write_report_csv(path: &Path, rows: &[ReportRow]) -> Result<()> {
    ensure_parent_dirs(path)?;

    let buf_writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(buf_writer);

    let path_str = path.display().to_string();

    csv_writer
        .write_record(["patient_id", "status", "cropped_depth", "error"])
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;

    for row in rows {
        csv_writer
            .write_record(&[
                row.patient_id.clone(),
                row.status.to_string(),
                row.cropped_depth.map(|d| d.to_string()).unwrap_or_default(),
                row.error.clone().unwrap_or_default(),
            ])
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use ndarray_npy::read_npy;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_write_npy_atomic_roundtrip_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("BraTS2021_00000_data.npy");
        let data = Array4::from_shape_fn((4, 3, 2, 5), |(c, x, y, z)| (c * 100 + x * 10 + y + z) as f32);

        write_npy_atomic(&path, &data).unwrap();

        let loaded: Array4<f32> = read_npy(&path).unwrap();
        assert_eq!(loaded, data);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_write_npy_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processed").join("nested").join("mask.npy");
        let mask = Array3::<u8>::ones((2, 2, 2));

        write_npy_atomic(&path, &mask).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/out/manifest.json"));
        assert_eq!(tmp, PathBuf::from("/out/.manifest.json.tmp"));
    }

    #[test]
    fn test_write_text_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        write_text_atomic(&path, "first").unwrap();
        write_text_atomic(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_write_report_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processing_report.csv");
        let rows = vec![
            ReportRow {
                patient_id: "BraTS2021_00000".to_string(),
                status: "ok",
                cropped_depth: Some(93),
                error: None,
            },
            ReportRow {
                patient_id: "BraTS2021_00001".to_string(),
                status: "failed",
                cropped_depth: None,
                error: Some("missing source file".to_string()),
            },
        ];

        write_report_csv(&path, &rows).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "patient_id,status,cropped_depth,error");
        assert_eq!(lines[1], "BraTS2021_00000,ok,93,");
        assert_eq!(lines[2], "BraTS2021_00001,failed,,missing source file");
        assert_eq!(lines.len(), 3);
    }
}
