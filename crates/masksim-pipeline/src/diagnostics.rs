//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! These diagnostics are permanent instrumentation intended for tuning
//! the refinement and similarity parameters against real screenshots.
//! [`process_with_diagnostics`] drives the incremental
//! [`Pipeline`](crate::Pipeline) and records every stage.
//!
//! Duration measurements use [`std::time::Duration`] (platform-agnostic).
//! Timestamps come from a [`Clock`]; [`SystemClock`] uses the `web-time`
//! crate, which uses `performance.now()` on WASM and
//! `std::time::Instant` on native.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::Pipeline;
use crate::types::{Mask, PipelineConfig, PipelineError, ProcessResult};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// The current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] backed by [`web_time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = web_time::Instant;

    fn now(&self) -> web_time::Instant {
        web_time::Instant::now()
    }

    fn elapsed(&self, since: &web_time::Instant) -> Duration {
        since.elapsed()
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 0: config validation and RGBA conversion.
    pub prepare: StageDiagnostics,
    /// Stage 1: per-color mask extraction.
    pub extract: StageDiagnostics,
    /// Stage 2: border mask removal.
    pub border_filter: StageDiagnostics,
    /// Stage 3: morphological opening.
    pub thin_filter: StageDiagnostics,
    /// Stage 4: hole filling.
    pub hole_fill: StageDiagnostics,
    /// Stage 5: minimum size filter.
    pub size_filter: StageDiagnostics,
    /// Stage 6: contained mask removal.
    pub containment: StageDiagnostics,
    /// Stage 7: masked cropping.
    pub region_extraction: StageDiagnostics,
    /// Stage 8: pairwise scoring and grouping.
    pub similarity: StageDiagnostics,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Input validation metrics.
    Prepare {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
        /// Total pixel count (`width * height`).
        pixel_count: u64,
    },
    /// Mask extraction metrics.
    Extract {
        /// Number of distinct colors, one mask each.
        mask_count: usize,
    },
    /// Metrics for a stage that only drops masks.
    MaskFilter {
        /// Masks before the stage.
        masks_in: usize,
        /// Masks after the stage.
        masks_out: usize,
    },
    /// Hole filling metrics.
    HoleFill {
        /// Number of masks processed.
        mask_count: usize,
        /// On pixels added across all masks.
        pixels_filled: u64,
    },
    /// Region extraction metrics.
    RegionExtraction {
        /// Number of regions cropped.
        region_count: usize,
        /// Total pixels across all crops.
        total_region_pixels: u64,
    },
    /// Similarity and grouping metrics.
    Similarity {
        /// Number of regions compared.
        region_count: usize,
        /// Unordered pairs with an SSIM score.
        pairs_compared: usize,
        /// Unordered pairs whose SSIM was skipped.
        pairs_short_circuited: usize,
        /// Number of groups formed.
        group_count: usize,
        /// Regions in no group.
        ungrouped_count: usize,
    },
}

/// High-level summary counts for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Masks before refinement.
    pub raw_mask_count: usize,
    /// Masks after refinement (also the region count).
    pub refined_mask_count: usize,
    /// Number of groups formed.
    pub group_count: usize,
    /// Regions in no group.
    pub ungrouped_count: usize,
}

impl PipelineDiagnostics {
    /// Per-stage diagnostics in pipeline order, with display names.
    #[must_use]
    pub fn stages(&self) -> [(&'static str, &StageDiagnostics); 9] {
        [
            ("Prepare", &self.prepare),
            ("Extract", &self.extract),
            ("Border Filter", &self.border_filter),
            ("Thin Filter", &self.thin_filter),
            ("Hole Fill", &self.hole_fill),
            ("Size Filter", &self.size_filter),
            ("Containment", &self.containment),
            ("Region Extraction", &self.region_extraction),
            ("Similarity", &self.similarity),
        ]
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in self.stages() {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Masks: {} -> {}  |  Groups: {}  |  Ungrouped: {}",
            self.summary.raw_mask_count,
            self.summary.refined_mask_count,
            self.summary.group_count,
            self.summary.ungrouped_count,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Prepare {
            width,
            height,
            pixel_count,
        } => format!("{width}x{height} ({pixel_count} px)"),
        StageMetrics::Extract { mask_count } => format!("{mask_count} masks"),
        StageMetrics::MaskFilter {
            masks_in,
            masks_out,
        } => format!(
            "{masks_in}->{masks_out} masks ({} dropped)",
            masks_in.saturating_sub(*masks_out),
        ),
        StageMetrics::HoleFill {
            mask_count,
            pixels_filled,
        } => format!("{mask_count} masks, +{pixels_filled} px"),
        StageMetrics::RegionExtraction {
            region_count,
            total_region_pixels,
        } => format!("{region_count} regions, {total_region_pixels} px"),
        StageMetrics::Similarity {
            pairs_compared,
            pairs_short_circuited,
            group_count,
            ungrouped_count,
            ..
        } => format!(
            "{pairs_compared} ssim, {pairs_short_circuited} skipped, {group_count} groups, {ungrouped_count} ungrouped",
        ),
    }
}

fn total_on_pixels(masks: &[Mask]) -> u64 {
    masks.iter().map(Mask::count_on).sum()
}

fn timed<C: Clock, T>(clock: &C, f: impl FnOnce() -> T) -> (T, Duration) {
    let start = clock.now();
    let out = f();
    (out, clock.elapsed(&start))
}

const fn filter_metrics(masks_in: usize, masks_out: usize) -> StageMetrics {
    StageMetrics::MaskFilter {
        masks_in,
        masks_out,
    }
}

/// Run the full pipeline, recording per-stage timing and counts.
///
/// Produces the same [`ProcessResult`] as [`crate::process`].
///
/// # Errors
///
/// See [`crate::process`].
#[allow(clippy::too_many_lines)]
pub fn process_with_diagnostics<C: Clock>(
    segmented: &DynamicImage,
    original: &DynamicImage,
    config: &PipelineConfig,
    clock: &C,
) -> Result<(ProcessResult, PipelineDiagnostics), PipelineError> {
    let run_start = clock.now();

    let (prepared, d) = timed(clock, || {
        Pipeline::new(segmented, original, config.clone()).prepare()
    });
    let prepared = prepared?;
    let dims = prepared.dimensions();
    let pixel_count = u64::from(dims.width) * u64::from(dims.height);
    let prepare = StageDiagnostics {
        duration: d,
        metrics: StageMetrics::Prepare {
            width: dims.width,
            height: dims.height,
            pixel_count,
        },
    };

    let (extracted, d) = timed(clock, || prepared.extract());
    let extracted = extracted?;
    let raw_mask_count = extracted.masks().len();
    let extract = StageDiagnostics {
        duration: d,
        metrics: StageMetrics::Extract {
            mask_count: raw_mask_count,
        },
    };

    let (border, d) = timed(clock, || extracted.remove_border_masks());
    let border_filter = StageDiagnostics {
        duration: d,
        metrics: filter_metrics(raw_mask_count, border.masks().len()),
    };

    let masks_in = border.masks().len();
    let (opened, d) = timed(clock, || border.open());
    let opened = opened?;
    let thin_filter = StageDiagnostics {
        duration: d,
        metrics: filter_metrics(masks_in, opened.masks().len()),
    };

    let pixels_before = total_on_pixels(opened.masks());
    let (filled, d) = timed(clock, || opened.fill_holes());
    let hole_fill = StageDiagnostics {
        duration: d,
        metrics: StageMetrics::HoleFill {
            mask_count: filled.masks().len(),
            pixels_filled: total_on_pixels(filled.masks()).saturating_sub(pixels_before),
        },
    };

    let masks_in = filled.masks().len();
    let (sized, d) = timed(clock, || filled.filter_by_size());
    let size_filter = StageDiagnostics {
        duration: d,
        metrics: filter_metrics(masks_in, sized.masks().len()),
    };

    let masks_in = sized.masks().len();
    let (refined, d) = timed(clock, || sized.remove_contained());
    let refined_mask_count = refined.masks().len();
    let containment = StageDiagnostics {
        duration: d,
        metrics: filter_metrics(masks_in, refined_mask_count),
    };

    let (with_regions, d) = timed(clock, || refined.extract_regions());
    let with_regions = with_regions?;
    let region_extraction = StageDiagnostics {
        duration: d,
        metrics: StageMetrics::RegionExtraction {
            region_count: with_regions.regions().len(),
            total_region_pixels: with_regions
                .regions()
                .iter()
                .map(|r| u64::from(r.image.width()) * u64::from(r.image.height()))
                .sum(),
        },
    };

    let (grouped, d) = timed(clock, || with_regions.group());
    let grouped = grouped?;
    let grouping = grouped.grouping();
    let n = grouping.ssim.len();
    let pairs = n * n.saturating_sub(1) / 2;
    let skipped = grouping.ssim.nan_pairs();
    let group_count = grouping.groups.len();
    let ungrouped_count = grouping.ungrouped.len();
    let similarity = StageDiagnostics {
        duration: d,
        metrics: StageMetrics::Similarity {
            region_count: n,
            pairs_compared: pairs - skipped,
            pairs_short_circuited: skipped,
            group_count,
            ungrouped_count,
        },
    };

    let result = grouped.into_result();
    let total_duration = clock.elapsed(&run_start);
    debug!(
        total_ms = duration_ms(total_duration),
        "collected pipeline diagnostics"
    );

    let diagnostics = PipelineDiagnostics {
        prepare,
        extract,
        border_filter,
        thin_filter,
        hole_fill,
        size_filter,
        containment,
        region_extraction,
        similarity,
        total_duration,
        summary: PipelineSummary {
            image_width: dims.width,
            image_height: dims.height,
            pixel_count,
            raw_mask_count,
            refined_mask_count,
            group_count,
            ungrouped_count,
        },
    };
    Ok((result, diagnostics))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::cast_possible_truncation)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Advances one millisecond every time it is read.
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.0.get() - since)
        }
    }

    /// Two 30x30 cards sharing one color and a 60x20 bar on a white page.
    fn page() -> (DynamicImage, DynamicImage) {
        let segmented = image::RgbaImage::from_fn(120, 100, |x, y| {
            let card = (10..40).contains(&y) && ((10..40).contains(&x) || (60..90).contains(&x));
            let bar = (60..80).contains(&y) && (20..80).contains(&x);
            if card {
                image::Rgba([0, 0, 255, 255])
            } else if bar {
                image::Rgba([255, 0, 0, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        });
        let original = image::RgbaImage::from_fn(120, 100, |x, y| {
            image::Rgba([((x % 30) * 8) as u8, ((y % 30) * 8) as u8, 50, 255])
        });
        (
            DynamicImage::ImageRgba8(segmented),
            DynamicImage::ImageRgba8(original),
        )
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        let ms = duration_ms(d);
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let start = clock.now();
        assert!(clock.elapsed(&start) < Duration::from_secs(60));
    }

    #[test]
    fn diagnostics_match_plain_process() {
        let (segmented, original) = page();
        let config = PipelineConfig::default();
        let (result, diag) =
            process_with_diagnostics(&segmented, &original, &config, &TickClock(Cell::new(0)))
                .unwrap();
        let plain = crate::process(&segmented, &original, &config).unwrap();
        assert_eq!(result.masks, plain.masks);
        assert_eq!(result.grouping, plain.grouping);

        assert_eq!(diag.summary.image_width, 120);
        assert_eq!(diag.summary.raw_mask_count, 3);
        assert_eq!(diag.summary.refined_mask_count, result.masks.len());
        assert_eq!(diag.summary.group_count, result.grouping.groups.len());
        assert_eq!(
            diag.border_filter.metrics,
            StageMetrics::MaskFilter {
                masks_in: 3,
                masks_out: 2,
            }
        );
    }

    #[test]
    fn every_stage_is_timed() {
        let (segmented, original) = page();
        let (_, diag) = process_with_diagnostics(
            &segmented,
            &original,
            &PipelineConfig::default(),
            &TickClock(Cell::new(0)),
        )
        .unwrap();
        for (name, stage) in diag.stages() {
            assert_eq!(stage.duration, Duration::from_millis(1), "{name}");
        }
        assert!(diag.total_duration >= Duration::from_millis(9));
    }

    #[test]
    fn similarity_metrics_count_pairs() {
        let (segmented, original) = page();
        let (result, diag) = process_with_diagnostics(
            &segmented,
            &original,
            &PipelineConfig::default(),
            &TickClock(Cell::new(0)),
        )
        .unwrap();
        let StageMetrics::Similarity {
            region_count,
            pairs_compared,
            pairs_short_circuited,
            ..
        } = diag.similarity.metrics
        else {
            panic!("expected similarity metrics");
        };
        assert_eq!(region_count, result.regions.len());
        assert_eq!(
            pairs_compared + pairs_short_circuited,
            region_count * region_count.saturating_sub(1) / 2
        );
    }

    #[test]
    fn errors_propagate() {
        let segmented = DynamicImage::ImageRgba8(image::RgbaImage::new(4, 4));
        let original = DynamicImage::ImageRgba8(image::RgbaImage::new(5, 4));
        let result = process_with_diagnostics(
            &segmented,
            &original,
            &PipelineConfig::default(),
            &SystemClock,
        );
        assert!(matches!(result, Err(PipelineError::InvalidImage(_))));
    }

    #[test]
    fn report_produces_nonempty_string() {
        let stage = |ms, metrics| StageDiagnostics {
            duration: Duration::from_millis(ms),
            metrics,
        };
        let diag = PipelineDiagnostics {
            prepare: stage(
                1,
                StageMetrics::Prepare {
                    width: 100,
                    height: 80,
                    pixel_count: 8000,
                },
            ),
            extract: stage(2, StageMetrics::Extract { mask_count: 12 }),
            border_filter: stage(1, filter_metrics(12, 11)),
            thin_filter: stage(20, filter_metrics(11, 7)),
            hole_fill: stage(
                5,
                StageMetrics::HoleFill {
                    mask_count: 7,
                    pixels_filled: 320,
                },
            ),
            size_filter: stage(1, filter_metrics(7, 5)),
            containment: stage(1, filter_metrics(5, 4)),
            region_extraction: stage(
                1,
                StageMetrics::RegionExtraction {
                    region_count: 4,
                    total_region_pixels: 2400,
                },
            ),
            similarity: stage(
                30,
                StageMetrics::Similarity {
                    region_count: 4,
                    pairs_compared: 4,
                    pairs_short_circuited: 2,
                    group_count: 1,
                    ungrouped_count: 2,
                },
            ),
            total_duration: Duration::from_millis(62),
            summary: PipelineSummary {
                image_width: 100,
                image_height: 80,
                pixel_count: 8000,
                raw_mask_count: 12,
                refined_mask_count: 4,
                group_count: 1,
                ungrouped_count: 2,
            },
        };

        let report = diag.report();
        assert!(report.contains("Pipeline Diagnostics Report"));
        assert!(report.contains("Thin Filter"));
        assert!(report.contains("11->7 masks (4 dropped)"));
        assert!(report.contains("Masks: 12 -> 4"));
    }

    #[test]
    fn diagnostics_serde_round_trip() {
        let (segmented, original) = page();
        let (_, diag) = process_with_diagnostics(
            &segmented,
            &original,
            &PipelineConfig::default(),
            &TickClock(Cell::new(0)),
        )
        .unwrap();
        let json = serde_json::to_string(&diag).unwrap();
        let back: PipelineDiagnostics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.similarity.metrics, diag.similarity.metrics);
        assert_eq!(back.total_duration, diag.total_duration);
    }
}
