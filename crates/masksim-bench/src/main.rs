//! masksim-bench: CLI tool for grouping experiments and diagnostics.
//!
//! Runs the grouping pipeline on a segmented screenshot and the original
//! screenshot with configurable parameters, printing per-stage
//! diagnostics and the resulting groups. Useful for:
//!
//! - Tuning the SSIM and size similarity thresholds
//! - Seeing how many masks each refinement stage drops
//! - Measuring per-stage durations to identify bottlenecks
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin masksim-bench -- [OPTIONS] <SEGMENTED> <ORIGINAL>
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use image::DynamicImage;
use masksim_pipeline::diagnostics::{PipelineDiagnostics, SystemClock};
use masksim_pipeline::{
    BoundingBox, MinMaskSize, PipelineConfig, Point, ProcessResult, SimilarityMatrix,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Grouping experiments and diagnostics for masksim.
///
/// Finds repeated UI components in a screenshot given its color
/// segmentation, and prints detailed per-stage timing and count
/// diagnostics.
#[derive(Parser)]
#[command(name = "masksim-bench", version)]
struct Cli {
    /// Path to the color-segmented image (PNG, JPEG, BMP, WebP).
    segmented: PathBuf,

    /// Path to the original screenshot, same size as the segmented image.
    original: PathBuf,

    /// Minimum mask height in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MIN_MASK_SIZE.height)]
    min_mask_height: u32,

    /// Minimum mask width in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MIN_MASK_SIZE.width)]
    min_mask_width: u32,

    /// Border band thickness as a percentage of each dimension (0-50).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BORDER_THRESHOLD_PERCENT)]
    border_threshold: f64,

    /// Side of the square structuring element (odd).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MORPH_KERNEL_SIZE)]
    morph_kernel_size: u32,

    /// Number of erosion/dilation passes.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MORPH_ITERATIONS)]
    morph_iterations: u32,

    /// Minimum SSIM for grouping (-1.0 to 1.0).
    #[arg(
        long,
        default_value_t = PipelineConfig::DEFAULT_MIN_SSIM,
        allow_negative_numbers = true
    )]
    min_ssim: f64,

    /// Minimum size similarity for grouping (0.0-1.0).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SIZE_SIMILARITY_THRESHOLD)]
    size_threshold: f64,

    /// Compute SSIM for every pair, even when sizes already disqualify it.
    #[arg(long)]
    no_short_circuit: bool,

    /// SSIM window side (odd, 3 to 255).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SSIM_WINDOW)]
    ssim_window: u32,

    /// Compare luma instead of averaging R, G, B scores.
    #[arg(long)]
    grayscale: bool,

    /// Fail if more than this many regions survive refinement.
    #[arg(long)]
    max_regions: Option<usize>,

    /// Write groups, regions, and similarity matrices as JSON to this file.
    #[arg(long)]
    groups_json: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored. Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(PipelineConfig {
        min_mask_size: MinMaskSize {
            height: cli.min_mask_height,
            width: cli.min_mask_width,
        },
        border_threshold_percent: cli.border_threshold,
        morph_kernel_size: cli.morph_kernel_size,
        morph_iterations: cli.morph_iterations,
        min_ssim: cli.min_ssim,
        size_similarity_threshold: cli.size_threshold,
        short_circuit_ssim: !cli.no_short_circuit,
        ssim_window: cli.ssim_window,
        grayscale: cli.grayscale,
        max_regions: cli.max_regions,
    })
}

/// Read and decode one image file.
fn load_image(path: &Path) -> Result<DynamicImage, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    eprintln!("Image: {} ({} bytes)", path.display(), bytes.len());
    masksim_pipeline::decode::decode(&bytes)
        .map_err(|e| format!("Error decoding {}: {e}", path.display()))
}

/// Per-region entry in the `--groups-json` output.
#[derive(Serialize)]
struct RegionSummary {
    index: usize,
    bounding_box: BoundingBox,
    centroid: Point,
    width: u32,
    height: u32,
}

/// Shape of the `--groups-json` output.
#[derive(Serialize)]
struct GroupsReport<'a> {
    width: u32,
    height: u32,
    groups: &'a [Vec<usize>],
    ungrouped: &'a [usize],
    regions: Vec<RegionSummary>,
    ssim: &'a SimilarityMatrix,
    size_similarity: &'a SimilarityMatrix,
}

impl<'a> GroupsReport<'a> {
    fn new(result: &'a ProcessResult) -> Self {
        let regions = result
            .regions
            .iter()
            .enumerate()
            .map(|(index, region)| RegionSummary {
                index,
                bounding_box: region.bounding_box,
                centroid: region.centroid(),
                width: region.image.width(),
                height: region.image.height(),
            })
            .collect();
        Self {
            width: result.dimensions.width,
            height: result.dimensions.height,
            groups: &result.grouping.groups,
            ungrouped: &result.grouping.ungrouped,
            regions,
            ssim: &result.grouping.ssim,
            size_similarity: &result.grouping.size_similarity,
        }
    }
}

/// Print the groups with each member's bounding box.
fn print_groups(result: &ProcessResult) {
    let describe = |i: usize| {
        let b = &result.regions[i].bounding_box;
        format!(
            "#{i} @({},{}) {}x{}",
            b.left,
            b.top,
            b.pixel_width(),
            b.pixel_height()
        )
    };

    println!();
    println!("Groups ({})", result.grouping.groups.len());
    println!("{}", "-".repeat(40));
    for (n, group) in result.grouping.groups.iter().enumerate() {
        let members: Vec<String> = group.iter().map(|&i| describe(i)).collect();
        println!("{n:>3}: {}", members.join("  "));
    }
    let ungrouped: Vec<String> = result
        .grouping
        .ungrouped
        .iter()
        .map(|&i| describe(i))
        .collect();
    println!("Ungrouped: {}", ungrouped.join("  "));
}

fn write_groups_json(path: &Path, result: &ProcessResult) -> Result<(), String> {
    let json = serde_json::to_string_pretty(&GroupsReport::new(result))
        .map_err(|e| format!("Error serializing groups: {e}"))?;
    std::fs::write(path, &json)
        .map_err(|e| format!("Error writing groups to {}: {e}", path.display()))?;
    eprintln!(
        "Groups written to {} ({} bytes)",
        path.display(),
        json.len()
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let (segmented, original) = match (load_image(&cli.segmented), load_image(&cli.original)) {
        (Ok(s), Ok(o)) => (s, o),
        (Err(msg), _) | (_, Err(msg)) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match masksim_pipeline::diagnostics::process_with_diagnostics(
            &segmented,
            &original,
            &config,
            &SystemClock,
        ) {
            Ok((result, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                    if run == 0 {
                        print_groups(&result);
                    }
                }

                // Write groups on the first run only.
                if run == 0
                    && let Some(ref path) = cli.groups_json
                    && let Err(msg) = write_groups_json(path, &result)
                {
                    eprintln!("{msg}");
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    debug_assert!(!all_diagnostics.is_empty(), "no diagnostics to summarize");

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-stage means, in pipeline order.
    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let names = all_diagnostics[0].stages().map(|(name, _)| name);
    for (stage, name) in names.iter().enumerate() {
        let total: f64 = all_diagnostics
            .iter()
            .map(|d| d.stages()[stage].1.duration.as_secs_f64() * 1000.0)
            .sum();
        let stage_mean = total / all_diagnostics.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
