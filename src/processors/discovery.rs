//! Patient discovery in a raw dataset directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("No patient directories matching '{prefix}#####' in {dir}")]
    NoPatientsFound { dir: PathBuf, prefix: String },
}

/// Build the pattern for patient directory names: `prefix` plus five digits.
pub fn patient_id_pattern(prefix: &str) -> Regex {
    // The escaped prefix is always a valid pattern.
    Regex::new(&format!(r"^{}\d{{5}}$", regex::escape(prefix))).unwrap()
}

/// List patient IDs under `raw_dir`, sorted lexicographically.
///
/// Only directories whose name is `prefix` followed by exactly five digits
/// count as patients; stray files and other folders are ignored.
///
/// # Errors
///
/// Fails if `raw_dir` is not a readable directory or holds no patients.
pub fn discover_patients(raw_dir: &Path, prefix: &str) -> Result<Vec<String>> {
    if !raw_dir.is_dir() {
        return Err(DiscoveryError::DirectoryNotFound(raw_dir.to_path_buf()).into());
    }

    let pattern = patient_id_pattern(prefix);

    let mut patients: Vec<String> = fs::read_dir(raw_dir)
        .with_context(|| format!("Failed to read directory: {}", raw_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| pattern.is_match(name))
        .collect();

    if patients.is_empty() {
        return Err(DiscoveryError::NoPatientsFound {
            dir: raw_dir.to_path_buf(),
            prefix: prefix.to_string(),
        }
        .into());
    }

    patients.sort();
    log::info!("Found {} patients in {}", patients.len(), raw_dir.display());

    Ok(patients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_patient_id_pattern() {
        let pattern = patient_id_pattern("BraTS2021_");
        assert!(pattern.is_match("BraTS2021_00000"));
        assert!(pattern.is_match("BraTS2021_01666"));
        assert!(!pattern.is_match("BraTS2021_0000"));
        assert!(!pattern.is_match("BraTS2021_000001"));
        assert!(!pattern.is_match("BraTS2020_00000"));
        assert!(!pattern.is_match("xBraTS2021_00000"));
    }

    #[test]
    fn test_discover_patients_sorted_and_filtered() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["BraTS2021_00010", "BraTS2021_00002", "BraTS2021_00005", "notes"] {
            fs::create_dir_all(temp_dir.path().join(name)).unwrap();
        }
        fs::write(temp_dir.path().join("BraTS2021_00099"), b"a file, not a patient").unwrap();

        let patients = discover_patients(temp_dir.path(), "BraTS2021_").unwrap();
        assert_eq!(
            patients,
            vec!["BraTS2021_00002", "BraTS2021_00005", "BraTS2021_00010"]
        );
    }

    #[test]
    fn test_discover_patients_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let result = discover_patients(&temp_dir.path().join("missing"), "BraTS2021_");
        assert!(result.is_err());
    }

    #[test]
    fn test_discover_patients_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        let err = discover_patients(temp_dir.path(), "BraTS2021_").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiscoveryError>(),
            Some(DiscoveryError::NoPatientsFound { .. })
        ));
    }
}
