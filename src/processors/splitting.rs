//! Reproducible train/validation/test partitioning of patient IDs.
//!
//! The split is a two-stage uniform draw without replacement. A
//! `ChaCha8Rng` seeded from the configured seed drives both stages, so the
//! same ID list in the same order always yields the same assignment.
//!
//! Split sizes, for `N` patients and proportions `(train, val, test)`:
//!
//! ```text
//! held_out = ceil((val + test) * N)         train = N - held_out
//! n_test   = ceil(test / (val + test) * held_out)
//! n_val    = held_out - n_test
//! ```
//!
//! With 10 patients and 70/15/15 this gives 7 / 1 / 2.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigurationError, SplitProportions};

/// Slack applied before rounding up, so that e.g. `0.3 * 10` counts as 3.
const ROUNDING_SLACK: f64 = 1e-9;

/// Errors that can occur while splitting.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error("patient ID '{0}' appears more than once")]
    DuplicateId(String),

    #[error(
        "{total} patients cannot fill train/val/test with proportions {proportions:?} \
         (sizes would be {train}/{val}/{test})"
    )]
    TooFewPatients {
        total: usize,
        proportions: SplitProportions,
        train: usize,
        val: usize,
        test: usize,
    },
}

/// Three disjoint ID lists whose union is the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

impl DatasetSplit {
    /// Total number of assigned IDs.
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    /// True when no ID is assigned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(train, val, test)` sizes.
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.train.len(), self.val.len(), self.test.len())
    }

    /// First ID that appears in more than one split (or twice in one).
    pub fn first_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::with_capacity(self.len());
        self.train
            .iter()
            .chain(&self.val)
            .chain(&self.test)
            .find(|id| !seen.insert(id.as_str()))
            .map(String::as_str)
    }
}

/// `ceil(fraction * n)`, tolerant of floating-point noise, capped at `n`.
fn ceil_count(fraction: f64, n: usize) -> usize {
    let raw = (fraction * n as f64 - ROUNDING_SLACK).ceil();
    (raw.max(0.0) as usize).min(n)
}

/// Compute `(train, val, test)` sizes for `total` patients.
pub fn split_sizes(total: usize, proportions: &SplitProportions) -> (usize, usize, usize) {
    let held_fraction = proportions.val + proportions.test;
    let held_out = ceil_count(held_fraction, total);
    let n_test = ceil_count(proportions.test / held_fraction, held_out);
    (total - held_out, held_out - n_test, n_test)
}

/// Partition `patient_ids` into train/val/test.
///
/// # Errors
///
/// - `Config` when the proportions are invalid
/// - `DuplicateId` when an ID occurs twice in the input
/// - `TooFewPatients` when any split would be empty
pub fn split_dataset(
    patient_ids: &[String],
    proportions: &SplitProportions,
    seed: u64,
) -> Result<DatasetSplit, SplitError> {
    proportions.validate()?;

    let mut seen = HashSet::with_capacity(patient_ids.len());
    if let Some(dup) = patient_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(SplitError::DuplicateId(dup.clone()));
    }

    let total = patient_ids.len();
    let (n_train, n_val, n_test) = split_sizes(total, proportions);
    if n_train == 0 || n_val == 0 || n_test == 0 {
        return Err(SplitError::TooFewPatients {
            total,
            proportions: *proportions,
            train: n_train,
            val: n_val,
            test: n_test,
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    // Stage 1: train vs. held-out.
    let mut shuffled = patient_ids.to_vec();
    shuffled.shuffle(&mut rng);
    let mut held_out = shuffled.split_off(n_train);
    let train = shuffled;

    // Stage 2: held-out into val vs. test.
    held_out.shuffle(&mut rng);
    let test = held_out.split_off(n_val);
    let val = held_out;

    log::info!(
        "Dataset split (seed {}): {} train | {} val | {} test",
        seed,
        train.len(),
        val.len(),
        test.len()
    );

    Ok(DatasetSplit { train, val, test })
}
