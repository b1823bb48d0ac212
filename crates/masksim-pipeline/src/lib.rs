//! masksim-pipeline: Pure UI-component grouping pipeline (sans-IO).
//!
//! Takes a color-segmented screenshot and the original screenshot, and
//! finds visually repeated components (buttons, cards, list rows) through:
//! per-color mask extraction -> mask refinement (border filter, opening,
//! hole filling, size filter, containment removal) -> masked cropping ->
//! pairwise size similarity and SSIM -> greedy grouping.
//!
//! This crate has **no I/O dependencies**; it operates on in-memory
//! images and returns structured data. Reading files lives in
//! `masksim-bench`.

pub mod cache;
pub mod decode;
pub mod diagnostics;
pub mod extract;
pub mod pipeline;
pub mod refine;
pub mod region;
pub mod similarity;
pub mod types;

pub use cache::PipelineCache;
pub use pipeline::Pipeline;
pub use refine::RefineConfig;
pub use region::Region;
pub use similarity::{GroupingResult, SimilarityConfig, SimilarityMatrix, SsimMode};
pub use types::{
    BoundingBox, Dimensions, Mask, MinMaskSize, PipelineConfig, PipelineError, Point,
    ProcessResult,
};

use image::DynamicImage;
use tracing::info;

/// Run the full grouping pipeline.
///
/// # Pipeline steps
///
/// 1. Validate the configuration and both images
/// 2. Extract one mask per segment color
/// 3. Refine the masks (see [`refine`])
/// 4. Crop the original to each refined mask
/// 5. Score every pair of regions and group the similar ones
///
/// An input where every mask is filtered out yields an empty result, not
/// an error.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `config` is out of range
/// or more regions survive than `config.max_regions`.
/// Returns [`PipelineError::InvalidImage`] if either image has zero area
/// or the two images differ in size.
pub fn process(
    segmented: &DynamicImage,
    original: &DynamicImage,
    config: &PipelineConfig,
) -> Result<ProcessResult, PipelineError> {
    let result = Pipeline::new(segmented, original, config.clone())
        .prepare()?
        .extract()?
        .remove_border_masks()
        .open()?
        .fill_holes()
        .filter_by_size()
        .remove_contained()
        .extract_regions()?
        .group()?
        .into_result();

    info!(
        width = result.dimensions.width,
        height = result.dimensions.height,
        regions = result.regions.len(),
        groups = result.grouping.groups.len(),
        ungrouped = result.grouping.ungrouped.len(),
        "processed screenshot"
    );
    Ok(result)
}
