//! Mask refinement: drop background artifacts, noise, and duplicates.
//!
//! Raw color masks contain the whole-frame background, thin separators,
//! anti-aliasing speckle, and regions nested inside other regions.
//! [`refine_masks`] runs five ordered stages to reduce them to a set of
//! solid, non-overlapping UI components:
//!
//! 1. [`remove_border_masks`]: drop masks touching all four borders
//! 2. [`filter_thin_ragged_masks`]: morphological opening
//! 3. [`fill_holes`]: fill enclosed background
//! 4. [`filter_masks_by_size`]: drop small masks
//! 5. [`remove_contained_masks`]: drop masks inside other masks
//!
//! Every stage only ever removes masks (or grows a surviving mask in the
//! hole-filling step), so an empty result is possible and is not an error.

use std::collections::HashSet;

use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::region::bounding_box;
use crate::types::{MASK_ON, Mask, MinMaskSize, PipelineConfig, PipelineError};

/// Parameters for [`refine_masks`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Border band thickness as a percentage of each dimension.
    pub border_threshold_percent: f64,
    /// Side of the square structuring element. Must be odd.
    pub morph_kernel_size: u32,
    /// Number of erosion (then dilation) passes.
    pub morph_iterations: u32,
    /// Minimum inclusive extent of a surviving mask.
    pub min_mask_size: MinMaskSize,
}

impl Default for RefineConfig {
    fn default() -> Self {
        PipelineConfig::default().refine()
    }
}

impl RefineConfig {
    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the border percentage
    /// is outside `[0, 50]`, the kernel side is even, or the opening
    /// radius exceeds [`MAX_OPENING_RADIUS`].
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=50.0).contains(&self.border_threshold_percent) {
            return Err(PipelineError::InvalidConfig(format!(
                "border_threshold_percent must be in [0, 50], got {}",
                self.border_threshold_percent,
            )));
        }
        opening_radius(self.morph_kernel_size, self.morph_iterations).map(|_| ())
    }
}

/// Run all refinement stages in order.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `config` is out of range.
/// Returns [`PipelineError::InvalidImage`] if the masks do not all share
/// the same dimensions.
pub fn refine_masks(masks: Vec<Mask>, config: &RefineConfig) -> Result<Vec<Mask>, PipelineError> {
    config.validate()?;
    check_uniform_dimensions(&masks)?;
    let input = masks.len();

    let masks = remove_border_masks(masks, config.border_threshold_percent);
    let masks =
        filter_thin_ragged_masks(masks, config.morph_kernel_size, config.morph_iterations)?;
    let masks: Vec<Mask> = masks.iter().map(fill_holes).collect();
    let masks = filter_masks_by_size(masks, config.min_mask_size);
    let masks = remove_contained_masks(masks);

    debug!(input, output = masks.len(), "refined masks");
    Ok(masks)
}

/// Ensure every mask has the same dimensions as the first.
pub(crate) fn check_uniform_dimensions(masks: &[Mask]) -> Result<(), PipelineError> {
    let Some(first) = masks.first() else {
        return Ok(());
    };
    let expected = first.dimensions();
    for (index, mask) in masks.iter().enumerate().skip(1) {
        let actual = mask.dimensions();
        if actual != expected {
            return Err(PipelineError::InvalidImage(format!(
                "mask {index} is {}x{}, expected {}x{}",
                actual.width, actual.height, expected.width, expected.height,
            )));
        }
    }
    Ok(())
}

/// Drop masks whose on pixels fall inside all four border bands.
///
/// Band thickness is `floor(dimension * threshold_percent / 100)` pixels.
/// A zero-thickness band is never considered touched, so tiny images
/// or a zero threshold keep every mask.
#[must_use = "returns the surviving masks"]
pub fn remove_border_masks(masks: Vec<Mask>, threshold_percent: f64) -> Vec<Mask> {
    let input = masks.len();
    let kept: Vec<Mask> = masks
        .into_iter()
        .filter(|mask| !is_close_to_all_borders(mask, threshold_percent))
        .collect();
    debug!(input, output = kept.len(), "removed border masks");
    kept
}

/// Whether `mask` has on pixels within the border band on every side.
///
/// A band is touched iff the mask's on-pixel extent reaches into it, so
/// the check reduces to comparing the bounding box against the bands.
#[must_use]
pub fn is_close_to_all_borders(mask: &Mask, threshold_percent: f64) -> bool {
    let rows = band_pixels(mask.height(), threshold_percent);
    let cols = band_pixels(mask.width(), threshold_percent);
    if rows == 0 || cols == 0 {
        return false;
    }
    let Some(bbox) = bounding_box(mask) else {
        return false;
    };

    let bottom = bbox.top + bbox.height;
    let right = bbox.left + bbox.width;
    bbox.top < rows
        && bottom >= mask.height().saturating_sub(rows)
        && bbox.left < cols
        && right >= mask.width().saturating_sub(cols)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn band_pixels(dimension: u32, threshold_percent: f64) -> u32 {
    (f64::from(dimension) * (threshold_percent / 100.0)).floor() as u32
}

/// Largest usable opening radius. `imageproc` saturates distances at
/// 255 and erosion keeps pixels strictly farther than the radius, so a
/// radius of 255 would erase every mask.
pub const MAX_OPENING_RADIUS: u8 = u8::MAX - 1;

/// L-infinity radius equivalent to `iterations` passes of a square
/// `kernel_size` structuring element.
fn opening_radius(kernel_size: u32, iterations: u32) -> Result<u8, PipelineError> {
    if kernel_size % 2 == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "morph_kernel_size must be odd, got {kernel_size}"
        )));
    }
    (kernel_size / 2)
        .checked_mul(iterations)
        .and_then(|r| u8::try_from(r).ok())
        .filter(|&r| r <= MAX_OPENING_RADIUS)
        .ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "opening radius (morph_kernel_size / 2) * morph_iterations must be at most \
                 {MAX_OPENING_RADIUS}, got {kernel_size} / 2 * {iterations}",
            ))
        })
}

/// Morphological opening with a square structuring element.
///
/// Erodes each mask `iterations` times with a `kernel_size` square, then
/// dilates the result the same amount. Masks that vanish under erosion
/// (thin lines, speckle) are dropped; survivors are replaced by their
/// reconstruction, which also trims ragged protrusions. Pixels outside
/// the image do not erode the mask, so regions touching the frame edge
/// are not penalised for it.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `kernel_size` is even or
/// the equivalent radius exceeds [`MAX_OPENING_RADIUS`].
pub fn filter_thin_ragged_masks(
    masks: Vec<Mask>,
    kernel_size: u32,
    iterations: u32,
) -> Result<Vec<Mask>, PipelineError> {
    let radius = opening_radius(kernel_size, iterations)?;
    let input = masks.len();

    let kept: Vec<Mask> = masks
        .into_iter()
        .filter_map(|mask| {
            if radius == 0 {
                return (!mask.is_empty()).then_some(mask);
            }
            let eroded = imageproc::morphology::erode(mask.as_gray(), Norm::LInf, radius);
            let eroded = Mask::from_gray(eroded);
            if eroded.is_empty() {
                return None;
            }
            let dilated = imageproc::morphology::dilate(eroded.as_gray(), Norm::LInf, radius);
            Some(Mask::from_gray(dilated))
        })
        .collect();

    debug!(input, output = kept.len(), radius, "filtered thin and ragged masks");
    Ok(kept)
}

/// Fill background pixels that are fully enclosed by the mask.
///
/// Background is connected 4-wise; any background component that does
/// not reach the image border is a hole.
#[must_use = "returns the filled mask"]
pub fn fill_holes(mask: &Mask) -> Mask {
    let (width, height) = (mask.width(), mask.height());
    if width == 0 || height == 0 {
        return mask.clone();
    }
    let inverted = image::GrayImage::from_fn(width, height, |x, y| {
        image::Luma([if mask.get(x, y) { 0 } else { MASK_ON }])
    });
    let labels = connected_components(&inverted, Connectivity::Four, image::Luma([0u8]));

    let mut outside: HashSet<u32> = HashSet::new();
    for x in 0..width {
        outside.insert(labels.get_pixel(x, 0).0[0]);
        outside.insert(labels.get_pixel(x, height - 1).0[0]);
    }
    for y in 0..height {
        outside.insert(labels.get_pixel(0, y).0[0]);
        outside.insert(labels.get_pixel(width - 1, y).0[0]);
    }

    Mask::from_fn(width, height, |x, y| {
        let label = labels.get_pixel(x, y).0[0];
        mask.get(x, y) || (label != 0 && !outside.contains(&label))
    })
}

/// Keep masks whose inclusive on-pixel extent is at least `min_size`.
///
/// Extent here is the number of rows/columns spanned (`max - min + 1`).
/// Empty masks are dropped.
#[must_use = "returns the surviving masks"]
pub fn filter_masks_by_size(masks: Vec<Mask>, min_size: MinMaskSize) -> Vec<Mask> {
    let input = masks.len();
    let kept: Vec<Mask> = masks
        .into_iter()
        .filter(|mask| {
            bounding_box(mask).is_some_and(|bbox| {
                bbox.pixel_height() >= min_size.height && bbox.pixel_width() >= min_size.width
            })
        })
        .collect();
    debug!(input, output = kept.len(), "filtered masks by size");
    kept
}

/// Drop every mask that is a pixel subset of another mask.
///
/// Mask `i` is dropped if some `j != i` satisfies `i AND j == i`. When
/// two masks are identical only the one with the lower index survives,
/// so the result does not depend on anything but input order.
#[must_use = "returns the surviving masks"]
pub fn remove_contained_masks(masks: Vec<Mask>) -> Vec<Mask> {
    let input = masks.len();
    let counts: Vec<u64> = masks.iter().map(Mask::count_on).collect();

    let contained: Vec<bool> = (0..masks.len())
        .map(|i| {
            (0..masks.len()).any(|j| {
                j != i
                    && counts[i] <= counts[j]
                    && masks[i].is_subset_of(&masks[j])
                    && (counts[i] < counts[j] || j < i)
            })
        })
        .collect();

    let kept: Vec<Mask> = masks
        .into_iter()
        .zip(contained)
        .filter_map(|(mask, drop)| (!drop).then_some(mask))
        .collect();
    debug!(input, output = kept.len(), "removed contained masks");
    kept
}
