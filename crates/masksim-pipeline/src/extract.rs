//! Mask extraction: one boolean mask per segment color.
//!
//! A segmentation model paints every region of a screenshot in a flat
//! color. This is the first pipeline step: segmented image in, one
//! [`Mask`] per distinct RGB value out. Grouping is by color, not by
//! connectivity, so two disjoint patches painted the same color end up
//! in the same mask.

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{Mask, PipelineError, RgbaImage};

/// Extract one mask per distinct RGB color in `segmented`.
///
/// The alpha channel is ignored. Masks are returned in ascending
/// `(r, g, b)` order so the output is deterministic for a given image.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidImage`] if the image has zero area.
pub fn extract_masks(segmented: &RgbaImage) -> Result<Vec<Mask>, PipelineError> {
    let (width, height) = segmented.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidImage(format!(
            "segmented image has zero area ({width}x{height})"
        )));
    }

    let mut by_color: BTreeMap<[u8; 3], Mask> = BTreeMap::new();
    for (x, y, pixel) in segmented.enumerate_pixels() {
        let [r, g, b, _] = pixel.0;
        by_color
            .entry([r, g, b])
            .or_insert_with(|| Mask::new(width, height))
            .set(x, y, true);
    }

    debug!(colors = by_color.len(), "extracted masks from segmented image");
    Ok(by_color.into_values().collect())
}
