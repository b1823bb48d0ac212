//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::process`] which runs the entire pipeline in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use masksim_pipeline::{Pipeline, PipelineConfig, PipelineError};
//! # fn run(segmented: image::DynamicImage, original: image::DynamicImage) -> Result<(), PipelineError> {
//! let result = Pipeline::new(&segmented, &original, PipelineConfig::default())
//!     .prepare()?
//!     .extract()?
//!     .remove_border_masks()
//!     .open()?
//!     .fill_holes()
//!     .filter_by_size()
//!     .remove_contained()
//!     .extract_regions()?
//!     .group()?
//!     .into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state
//! (or `Result` for fallible stages). Skipping a stage or calling stages
//! out of order is a compile-time error, and the mask stages mirror the
//! ordered steps of [`crate::refine::refine_masks`].
//!
//! Every stage up to [`RegionsExtracted`] keeps the RGBA copy of the
//! original screenshot; [`Grouped::into_result`] releases it.

use image::DynamicImage;

use crate::region::Region;
use crate::similarity::GroupingResult;
use crate::types::{Dimensions, Mask, PipelineConfig, PipelineError, ProcessResult, RgbaImage};

/// State carried through every stage after [`Pending`].
struct Context {
    config: PipelineConfig,
    original: RgbaImage,
}

impl Context {
    fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.original.width(),
            height: self.original.height(),
        }
    }
}

/// Accessors shared by the stages that hold a mask list.
macro_rules! mask_stage_accessors {
    ($stage:ident) => {
        impl $stage {
            /// The masks produced by this stage.
            #[must_use]
            pub fn masks(&self) -> &[Mask] {
                &self.masks
            }

            /// The original screenshot as RGBA.
            #[must_use]
            pub const fn original(&self) -> &RgbaImage {
                &self.ctx.original
            }

            /// The validated configuration.
            #[must_use]
            pub const fn config(&self) -> &PipelineConfig {
                &self.ctx.config
            }
        }
    };
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`prepare`](Self::prepare) to validate the inputs.
#[must_use = "pipeline stages are consumed by advancing: call .prepare() to continue"]
pub struct Pending<'a> {
    config: PipelineConfig,
    segmented: &'a DynamicImage,
    original: &'a DynamicImage,
}

impl Pending<'_> {
    /// Validate the configuration and both images, and convert the
    /// images to RGBA.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the configuration is
    /// out of range. Returns [`PipelineError::InvalidImage`] if either
    /// image has zero area or their dimensions differ.
    pub fn prepare(self) -> Result<Prepared, PipelineError> {
        self.config.validate()?;
        let segmented = crate::decode::to_rgba(self.segmented)?;
        let original = crate::decode::to_rgba(self.original)?;
        if segmented.dimensions() != original.dimensions() {
            return Err(PipelineError::InvalidImage(format!(
                "segmented image is {}x{}, original image is {}x{}",
                segmented.width(),
                segmented.height(),
                original.width(),
                original.height(),
            )));
        }
        Ok(Prepared {
            ctx: Context {
                config: self.config,
                original,
            },
            segmented,
        })
    }
}

// ───────────────────────── Stage 1: Prepared ─────────────────────────

/// Both images validated and converted to RGBA.
#[must_use = "pipeline stages are consumed by advancing: call .extract() to continue"]
pub struct Prepared {
    ctx: Context,
    segmented: RgbaImage,
}

impl Prepared {
    /// The segmented image as RGBA.
    #[must_use]
    pub const fn segmented(&self) -> &RgbaImage {
        &self.segmented
    }

    /// The original screenshot as RGBA.
    #[must_use]
    pub const fn original(&self) -> &RgbaImage {
        &self.ctx.original
    }

    /// Shared dimensions of both images.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        self.ctx.dimensions()
    }

    /// Extract one mask per segment color.
    ///
    /// # Errors
    ///
    /// See [`crate::extract::extract_masks`].
    pub fn extract(self) -> Result<Extracted, PipelineError> {
        let masks = crate::extract::extract_masks(&self.segmented)?;
        Ok(Extracted {
            ctx: self.ctx,
            masks,
        })
    }
}

// ───────────────────────── Stage 2: Extracted ────────────────────────

/// Raw per-color masks.
#[must_use = "pipeline stages are consumed by advancing: call .remove_border_masks() to continue"]
pub struct Extracted {
    ctx: Context,
    masks: Vec<Mask>,
}

mask_stage_accessors!(Extracted);

impl Extracted {
    /// Drop masks touching all four border bands.
    pub fn remove_border_masks(self) -> BorderFiltered {
        let masks = crate::refine::remove_border_masks(
            self.masks,
            self.ctx.config.border_threshold_percent,
        );
        BorderFiltered {
            ctx: self.ctx,
            masks,
        }
    }
}

// ───────────────────────── Stage 3: BorderFiltered ───────────────────

/// Masks that do not span the whole frame.
#[must_use = "pipeline stages are consumed by advancing: call .open() to continue"]
pub struct BorderFiltered {
    ctx: Context,
    masks: Vec<Mask>,
}

mask_stage_accessors!(BorderFiltered);

impl BorderFiltered {
    /// Morphological opening: drop thin masks and trim ragged edges.
    ///
    /// # Errors
    ///
    /// See [`crate::refine::filter_thin_ragged_masks`]. Unreachable with
    /// a configuration that passed [`Pending::prepare`].
    pub fn open(self) -> Result<Opened, PipelineError> {
        let masks = crate::refine::filter_thin_ragged_masks(
            self.masks,
            self.ctx.config.morph_kernel_size,
            self.ctx.config.morph_iterations,
        )?;
        Ok(Opened {
            ctx: self.ctx,
            masks,
        })
    }
}

// ───────────────────────── Stage 4: Opened ───────────────────────────

/// Masks that survived the opening, replaced by their opened form.
#[must_use = "pipeline stages are consumed by advancing: call .fill_holes() to continue"]
pub struct Opened {
    ctx: Context,
    masks: Vec<Mask>,
}

mask_stage_accessors!(Opened);

impl Opened {
    /// Fill enclosed background in every mask.
    pub fn fill_holes(self) -> HolesFilled {
        let masks = self.masks.iter().map(crate::refine::fill_holes).collect();
        HolesFilled {
            ctx: self.ctx,
            masks,
        }
    }
}

// ───────────────────────── Stage 5: HolesFilled ──────────────────────

/// Solid masks.
#[must_use = "pipeline stages are consumed by advancing: call .filter_by_size() to continue"]
pub struct HolesFilled {
    ctx: Context,
    masks: Vec<Mask>,
}

mask_stage_accessors!(HolesFilled);

impl HolesFilled {
    /// Drop masks smaller than `min_mask_size`.
    pub fn filter_by_size(self) -> SizeFiltered {
        let masks =
            crate::refine::filter_masks_by_size(self.masks, self.ctx.config.min_mask_size);
        SizeFiltered {
            ctx: self.ctx,
            masks,
        }
    }
}

// ───────────────────────── Stage 6: SizeFiltered ─────────────────────

/// Masks at least `min_mask_size` in extent.
#[must_use = "pipeline stages are consumed by advancing: call .remove_contained() to continue"]
pub struct SizeFiltered {
    ctx: Context,
    masks: Vec<Mask>,
}

mask_stage_accessors!(SizeFiltered);

impl SizeFiltered {
    /// Drop masks contained in another mask.
    pub fn remove_contained(self) -> Refined {
        let masks = crate::refine::remove_contained_masks(self.masks);
        Refined {
            ctx: self.ctx,
            masks,
        }
    }
}

// ───────────────────────── Stage 7: Refined ──────────────────────────

/// Final refined masks, one per UI component.
#[must_use = "pipeline stages are consumed by advancing: call .extract_regions() to continue"]
pub struct Refined {
    ctx: Context,
    masks: Vec<Mask>,
}

mask_stage_accessors!(Refined);

impl Refined {
    /// Crop the original screenshot to every refined mask.
    ///
    /// # Errors
    ///
    /// See [`crate::region::extract_regions`]. Refined masks are never
    /// empty, so this only fails on inconsistent dimensions.
    pub fn extract_regions(self) -> Result<RegionsExtracted, PipelineError> {
        let regions = crate::region::extract_regions(&self.ctx.original, &self.masks)?;
        Ok(RegionsExtracted {
            ctx: self.ctx,
            masks: self.masks,
            regions,
        })
    }
}

// ───────────────────────── Stage 8: RegionsExtracted ─────────────────

/// Masked crops, index-aligned with the refined masks.
#[must_use = "pipeline stages are consumed by advancing: call .group() to continue"]
pub struct RegionsExtracted {
    ctx: Context,
    masks: Vec<Mask>,
    regions: Vec<Region>,
}

mask_stage_accessors!(RegionsExtracted);

impl RegionsExtracted {
    /// The cropped regions.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Score every pair of regions and group the similar ones.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if there are more regions
    /// than `max_regions`. See [`crate::similarity::find_similar_regions`].
    pub fn group(self) -> Result<Grouped, PipelineError> {
        let images: Vec<&RgbaImage> = self.regions.iter().map(|r| &r.image).collect();
        let grouping =
            crate::similarity::find_similar_regions(&images, &self.ctx.config.similarity())?;
        Ok(Grouped {
            dimensions: self.ctx.dimensions(),
            masks: self.masks,
            regions: self.regions,
            grouping,
        })
    }
}

// ───────────────────────── Stage 9: Grouped ──────────────────────────

/// Final pipeline state.
#[must_use = "call .into_result() to extract the ProcessResult"]
pub struct Grouped {
    dimensions: Dimensions,
    masks: Vec<Mask>,
    regions: Vec<Region>,
    grouping: GroupingResult,
}

impl Grouped {
    /// Groups, ungrouped indices, and similarity matrices.
    #[must_use]
    pub const fn grouping(&self) -> &GroupingResult {
        &self.grouping
    }

    /// The cropped regions the grouping refers to.
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Consume the pipeline and return the full result.
    #[must_use]
    pub fn into_result(self) -> ProcessResult {
        ProcessResult {
            masks: self.masks,
            regions: self.regions,
            grouping: self.grouping,
            dimensions: self.dimensions,
        }
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Entry point for the incremental pipeline.
///
/// Each stage method consumes the current state and returns the next,
/// making it a compile-time error to skip stages or call them out of
/// order.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline over a segmented image and the screenshot it
    /// was segmented from.
    ///
    /// No processing is performed; the inputs and config are simply
    /// stored. Call [`.prepare()`](Pending::prepare) to begin.
    #[allow(clippy::new_ret_no_self)]
    pub const fn new<'a>(
        segmented: &'a DynamicImage,
        original: &'a DynamicImage,
        config: PipelineConfig,
    ) -> Pending<'a> {
        Pending {
            config,
            segmented,
            original,
        }
    }
}
