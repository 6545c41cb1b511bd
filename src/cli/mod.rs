//! Command-line interface for the BraTS preprocessing pipeline.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::loaders::{NiftiLoader, PatientRecord};
use crate::processors::manifest::{write_manifest, DatasetMetadata, Manifest, ManifestStatus};
use crate::processors::{discovery, patient, splitting};
use crate::PipelineConfig;

/// File name of the per-patient CSV report inside the output directory.
const REPORT_FILENAME: &str = "processing_report.csv";

#[derive(Parser)]
#[command(name = "brats-pipeline")]
#[command(about = "BraTS MRI preprocessing and dataset split pipeline", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize, crop and stack every patient, then split and write the manifest
    Run {
        /// Directory with one subdirectory per patient
        raw_dir: PathBuf,
        /// Output directory for .npy files, report and manifest
        output_dir: PathBuf,
        /// Only process the first N patients (the split still covers all)
        #[arg(long)]
        limit: Option<usize>,
        /// Seed for the dataset split
        #[arg(long)]
        seed: Option<u64>,
        /// Replace an existing manifest with a different split
        #[arg(long)]
        force: bool,
        /// Number of worker threads
        #[arg(long)]
        threads: Option<usize>,
        /// Process patients one at a time
        #[arg(long)]
        sequential: bool,
        /// Skip patients whose outputs already exist
        #[arg(long)]
        skip_existing: bool,
    },

    /// Split the discovered patients and write the manifest only
    Split {
        /// Directory with one subdirectory per patient
        raw_dir: PathBuf,
        /// Directory that receives manifest.json
        output_dir: PathBuf,
        /// Seed for the dataset split
        #[arg(long)]
        seed: Option<u64>,
        /// Replace an existing manifest with a different split
        #[arg(long)]
        force: bool,
    },

    /// Render the middle axial slice of one patient to PNG
    Preview {
        /// Directory with one subdirectory per patient
        raw_dir: PathBuf,
        /// Patient identifier, e.g. BraTS2021_00000
        patient_id: String,
        /// Output PNG file path (defaults to <patient_id>_preview.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the default configuration as YAML
    InitConfig {
        /// Destination YAML file
        path: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Create a bar for per-patient progress
fn create_progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Exit with an error message
fn fail(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    eprintln!("error: {}", message);
    std::process::exit(1);
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // A config that cannot be read is fatal: the run could not be trusted.
    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => fail(e),
        },
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            raw_dir,
            output_dir,
            limit,
            seed,
            force,
            threads,
            sequential,
            skip_existing,
        } => {
            let mut config = config;
            if limit.is_some() {
                config.processing.limit = limit;
            }
            if let Some(seed) = seed {
                config.split.seed = seed;
            }
            if threads.is_some() {
                config.processing.num_threads = threads;
            }
            config.split.overwrite_manifest |= force;
            config.processing.parallel &= !sequential;
            config.processing.skip_existing |= skip_existing;
            cmd_run(&raw_dir, &output_dir, &config);
        }
        Commands::Split {
            raw_dir,
            output_dir,
            seed,
            force,
        } => {
            let mut config = config;
            if let Some(seed) = seed {
                config.split.seed = seed;
            }
            config.split.overwrite_manifest |= force;
            cmd_split(&raw_dir, &output_dir, &config);
        }
        Commands::Preview {
            raw_dir,
            patient_id,
            output,
        } => {
            cmd_preview(&raw_dir, &patient_id, output, &config);
        }
        Commands::InitConfig { path } => {
            cmd_init_config(&path);
        }
    }
}

/// Validate config, discover patients and build the manifest.
///
/// Everything here is fatal on error and happens before any patient is
/// processed.
fn prepare(raw_dir: &Path, output_dir: &Path, config: &PipelineConfig) -> (Vec<String>, Manifest) {
    if let Err(e) = config.validate() {
        fail(format!("Invalid configuration: {}", e));
    }

    let patients = match discovery::discover_patients(raw_dir, &config.dataset.patient_prefix) {
        Ok(p) => p,
        Err(e) => fail(format!("Patient discovery failed: {:#}", e)),
    };
    println!("Found {} patients", patients.len());

    let split = match splitting::split_dataset(
        &patients,
        &config.split.proportions,
        config.split.seed,
    ) {
        Ok(s) => s,
        Err(e) => fail(format!("Dataset split failed: {}", e)),
    };

    let metadata = DatasetMetadata {
        name: config.dataset.name.clone(),
        modalities: config.dataset.modalities.clone(),
        seed: config.split.seed,
        proportions: config.split.proportions,
    };
    let manifest = match Manifest::new(&metadata, &split) {
        Ok(m) => m,
        Err(e) => fail(format!("Invalid manifest: {}", e)),
    };

    // Refuse early rather than after hours of processing.
    let path = Manifest::path_in(output_dir);
    if !config.split.overwrite_manifest && path.exists() {
        let same = Manifest::load(&path).map(|m| m == manifest).unwrap_or(false);
        if !same {
            fail(format!(
                "{} already exists with a different split; pass --force to replace it",
                path.display()
            ));
        }
    }

    (patients, manifest)
}

fn write_manifest_or_exit(manifest: &Manifest, output_dir: &Path, config: &PipelineConfig) -> ManifestStatus {
    match write_manifest(manifest, output_dir, config.split.overwrite_manifest) {
        Ok(status) => status,
        Err(e) => fail(format!("Failed to write manifest: {}", e)),
    }
}

fn cmd_run(raw_dir: &Path, output_dir: &Path, config: &PipelineConfig) {
    let start = Instant::now();

    let (patients, manifest) = prepare(raw_dir, output_dir, config);

    let to_process: &[String] = match config.processing.limit {
        Some(n) if n < patients.len() => {
            warn!(
                "Processing only the first {} of {} patients; the manifest still lists all of them",
                n,
                patients.len()
            );
            &patients[..n]
        }
        _ => &patients,
    };

    println!("Input directory: {}", raw_dir.display());
    println!("Output directory: {}", output_dir.display());
    println!("Processing {} patients...", to_process.len());

    let loader = NiftiLoader::from_config(raw_dir, &config.dataset);
    let pb = create_progress_bar(to_process.len());
    let on_done = |id: &str| {
        pb.set_message(id.to_string());
        pb.inc(1);
    };

    let summary = match config.processing.num_threads {
        Some(n) if config.processing.parallel => {
            match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => pool.install(|| {
                    patient::process_patients(to_process, &loader, output_dir, config, on_done)
                }),
                Err(e) => fail(format!("Failed to build thread pool: {}", e)),
            }
        }
        _ => patient::process_patients(to_process, &loader, output_dir, config, on_done),
    };

    pb.finish_and_clear();

    let report_path = output_dir.join(REPORT_FILENAME);
    if let Err(e) = crate::core::writers::write_report_csv(&report_path, &summary.report_rows()) {
        warn!("Failed to write processing report: {}", e);
    }

    if let Some(first) = summary.succeeded.first() {
        match patient::inspect_output(&first.paths) {
            Ok(stats) => {
                println!("Sample {}: shape {:?}", first.patient_id, stats.shape);
                println!("Sample min: {:.3}, max: {:.3}", stats.min, stats.max);
                println!("Mean of non-zero voxels (~0): {:.3}", stats.nonzero_mean);
            }
            Err(e) => warn!("Could not inspect {}: {:#}", first.patient_id, e),
        }
    }

    let status = write_manifest_or_exit(&manifest, output_dir, config);
    let (n_train, n_val, n_test) = manifest.split.sizes();

    print_summary(
        "Preprocessing Complete",
        &[
            ("Patients found", patients.len().to_string()),
            ("Processed", summary.total().to_string()),
            ("Succeeded", summary.succeeded.len().to_string()),
            ("Failed", summary.failed.len().to_string()),
            ("Split", format!("{} train | {} val | {} test", n_train, n_val, n_test)),
            ("Seed", config.split.seed.to_string()),
            ("Manifest", format!("{:?}", status)),
            ("Report", report_path.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    if !summary.failed.is_empty() {
        println!("Failed patients:");
        for e in &summary.failed {
            println!("  {}", e);
        }
        std::process::exit(1);
    }
}

fn cmd_split(raw_dir: &Path, output_dir: &Path, config: &PipelineConfig) {
    let start = Instant::now();

    let spinner = create_spinner("Discovering patients and splitting...");
    let (patients, manifest) = prepare(raw_dir, output_dir, config);
    let status = write_manifest_or_exit(&manifest, output_dir, config);
    spinner.finish_and_clear();

    let (n_train, n_val, n_test) = manifest.split.sizes();
    print_summary(
        "Dataset Split Complete",
        &[
            ("Patients", patients.len().to_string()),
            ("Train", n_train.to_string()),
            ("Val", n_val.to_string()),
            ("Test", n_test.to_string()),
            ("Seed", config.split.seed.to_string()),
            ("Manifest", Manifest::path_in(output_dir).display().to_string()),
            ("Status", format!("{:?}", status)),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_preview(raw_dir: &Path, patient_id: &str, output: Option<PathBuf>, config: &PipelineConfig) {
    use crate::visualization::{self, VolumeStats};

    let start = Instant::now();

    let output_path = output.unwrap_or_else(|| PathBuf::from(format!("{}_preview.png", patient_id)));

    let spinner = create_spinner("Loading volumes...");
    let loader = NiftiLoader::from_config(raw_dir, &config.dataset);
    let record = match PatientRecord::load(&loader, patient_id, &config.dataset.modalities) {
        Ok(r) => r,
        Err(e) => {
            spinner.finish_and_clear();
            fail(format!("patient {}: {}", patient_id, e));
        }
    };
    spinner.finish_and_clear();

    for (modality, volume) in record.modalities.iter().zip(&record.volumes) {
        let stats = VolumeStats::of(volume);
        println!(
            "{}: shape={:?}, min={:.1}, max={:.1}",
            modality, stats.shape, stats.min, stats.max
        );
    }
    println!("seg: shape={:?}", record.mask.shape());

    match visualization::render_patient_preview(&output_path, &record) {
        Ok(slice_idx) => {
            print_summary(
                "Preview Complete",
                &[
                    ("Patient", patient_id.to_string()),
                    ("Axial slice", slice_idx.to_string()),
                    ("Output PNG", output_path.display().to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => fail(format!("Preview failed: {}", e)),
    }
}

fn cmd_init_config(path: &Path) {
    match PipelineConfig::default().to_yaml(path) {
        Ok(()) => println!("Wrote default config to {}", path.display()),
        Err(e) => fail(e),
    }
}
