//! Shared types for the masksim grouping pipeline.

use serde::{Deserialize, Serialize};

use crate::refine::RefineConfig;
use crate::region::Region;
use crate::similarity::{GroupingResult, SimilarityConfig, SsimMode};

/// Re-export `GrayImage` so downstream crates can reference mask
/// rasters without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage` so downstream crates can reference region
/// images without depending on `image` directly.
pub use image::RgbaImage;

/// Pixel value used for "on" mask pixels.
pub const MASK_ON: u8 = 255;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// The centroid reported for an empty mask.
    #[must_use]
    pub const fn nan() -> Self {
        Self::new(f64::NAN, f64::NAN)
    }

    /// Returns `true` if either coordinate is NaN.
    #[must_use]
    pub const fn is_nan(self) -> bool {
        self.x.is_nan() || self.y.is_nan()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Returns `true` if either side is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Boolean region-membership map over an image.
///
/// Backed by a [`GrayImage`] where `0` is off and [`MASK_ON`] is on, so
/// masks can be handed straight to `imageproc` morphology and labelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask(GrayImage);

impl Mask {
    /// Create an all-off mask.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self(GrayImage::new(width, height))
    }

    /// Build a mask from a per-pixel predicate.
    #[must_use]
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        Self(GrayImage::from_fn(width, height, |x, y| {
            image::Luma([if f(x, y) { MASK_ON } else { 0 }])
        }))
    }

    /// Wrap a grayscale raster, treating any non-zero pixel as on.
    #[must_use]
    pub fn from_gray(mut gray: GrayImage) -> Self {
        for p in gray.pixels_mut() {
            if p.0[0] != 0 {
                p.0[0] = MASK_ON;
            }
        }
        Self(gray)
    }

    /// Mask width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    /// Mask height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Mask dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.0.width(),
            height: self.0.height(),
        }
    }

    /// Whether the pixel at `(x, y)` is on.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y).0[0] != 0
    }

    /// Set the pixel at `(x, y)`.
    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        self.0.put_pixel(x, y, image::Luma([if on { MASK_ON } else { 0 }]));
    }

    /// Number of on pixels.
    #[must_use]
    pub fn count_on(&self) -> u64 {
        self.0.as_raw().iter().map(|&v| u64::from(v != 0)).sum()
    }

    /// Returns `true` if no pixel is on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.as_raw().iter().all(|&v| v == 0)
    }

    /// Returns `true` if every on pixel of `self` is also on in `other`
    /// (`self AND other == self`). Masks of different sizes are never
    /// subsets of each other.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.dimensions() == other.dimensions()
            && self
                .0
                .as_raw()
                .iter()
                .zip(other.0.as_raw())
                .all(|(&a, &b)| a == 0 || b != 0)
    }

    /// Iterate over the `(x, y)` coordinates of on pixels in row-major order.
    pub fn on_pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] != 0)
            .map(|(x, y, _)| (x, y))
    }

    /// The underlying raster.
    #[must_use]
    pub const fn as_gray(&self) -> &GrayImage {
        &self.0
    }

}

impl Serialize for Mask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.0.width(), self.0.height(), self.0.as_raw()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Mask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (width, height, raw) = <(u32, u32, Vec<u8>)>::deserialize(deserializer)?;
        GrayImage::from_raw(width, height, raw)
            .map(Self::from_gray)
            .ok_or_else(|| serde::de::Error::custom("invalid mask dimensions"))
    }
}

/// Axis-aligned bounding box of a mask's on pixels.
///
/// `height` and `width` are `max - min` of the on-pixel rows/columns,
/// NOT the inclusive pixel count. A single-pixel mask has a `0 x 0` box.
/// Use [`pixel_height`](Self::pixel_height) and
/// [`pixel_width`](Self::pixel_width) for the inclusive extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// First on-pixel row.
    pub top: u32,
    /// First on-pixel column.
    pub left: u32,
    /// Last on-pixel row minus first on-pixel row.
    pub height: u32,
    /// Last on-pixel column minus first on-pixel column.
    pub width: u32,
}

impl BoundingBox {
    /// Number of pixel rows spanned by the box (`height + 1`).
    #[must_use]
    pub const fn pixel_height(&self) -> u32 {
        self.height + 1
    }

    /// Number of pixel columns spanned by the box (`width + 1`).
    #[must_use]
    pub const fn pixel_width(&self) -> u32 {
        self.width + 1
    }

    /// Center of the box: `(left + width / 2, top + height / 2)`.
    #[must_use]
    pub fn centroid(&self) -> Point {
        Point::new(
            f64::from(self.left) + f64::from(self.width) / 2.0,
            f64::from(self.top) + f64::from(self.height) / 2.0,
        )
    }
}

/// Minimum inclusive on-pixel extent a mask must have to survive the
/// size filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MinMaskSize {
    /// Minimum number of rows.
    pub height: u32,
    /// Minimum number of columns.
    pub width: u32,
}

/// Configuration for the grouping pipeline.
///
/// All parameters have defaults; call [`validate`](Self::validate) (or
/// any entry point, which validates first) to check ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Masks whose inclusive extent is smaller than this in either
    /// dimension are dropped.
    pub min_mask_size: MinMaskSize,

    /// Border band thickness as a percentage of each image dimension.
    /// Masks with on pixels in all four bands are dropped.
    pub border_threshold_percent: f64,

    /// Side of the square structuring element used for the opening.
    /// Must be odd.
    pub morph_kernel_size: u32,

    /// Number of erosion (then dilation) passes.
    pub morph_iterations: u32,

    /// Minimum SSIM for two regions to be grouped. Range `[-1, 1]`.
    pub min_ssim: f64,

    /// Minimum size similarity for two regions to be grouped, and the
    /// gate for computing SSIM when short-circuiting. Range `[0, 1]`.
    pub size_similarity_threshold: f64,

    /// Skip SSIM for pairs below `size_similarity_threshold`.
    pub short_circuit_ssim: bool,

    /// SSIM window side. Must be odd and at least 3.
    pub ssim_window: u32,

    /// Compute SSIM on luma instead of averaging R, G, B channel scores.
    pub grayscale: bool,

    /// Upper bound on the number of regions compared pairwise.
    pub max_regions: Option<usize>,
}

impl PipelineConfig {
    /// Default minimum mask size (15 x 15).
    pub const DEFAULT_MIN_MASK_SIZE: MinMaskSize = MinMaskSize {
        height: 15,
        width: 15,
    };
    /// Default border band, in percent.
    pub const DEFAULT_BORDER_THRESHOLD_PERCENT: f64 = 5.0;
    /// Default structuring element side.
    pub const DEFAULT_MORPH_KERNEL_SIZE: u32 = 3;
    /// Default opening iterations.
    pub const DEFAULT_MORPH_ITERATIONS: u32 = 5;
    /// Default minimum SSIM.
    pub const DEFAULT_MIN_SSIM: f64 = 0.9;
    /// Default minimum size similarity.
    pub const DEFAULT_SIZE_SIMILARITY_THRESHOLD: f64 = 0.9;
    /// Default SSIM window side.
    pub const DEFAULT_SSIM_WINDOW: u32 = 7;

    /// Check every parameter range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.refine().validate()?;
        self.similarity().validate()
    }

    /// The mask refinement view of this configuration.
    #[must_use]
    pub const fn refine(&self) -> RefineConfig {
        RefineConfig {
            border_threshold_percent: self.border_threshold_percent,
            morph_kernel_size: self.morph_kernel_size,
            morph_iterations: self.morph_iterations,
            min_mask_size: self.min_mask_size,
        }
    }

    /// The similarity engine view of this configuration.
    #[must_use]
    pub const fn similarity(&self) -> SimilarityConfig {
        SimilarityConfig {
            min_ssim: self.min_ssim,
            size_similarity_threshold: self.size_similarity_threshold,
            short_circuit: self.short_circuit_ssim,
            win_size: self.ssim_window,
            mode: if self.grayscale {
                SsimMode::Grayscale
            } else {
                SsimMode::Color
            },
            max_regions: self.max_regions,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_mask_size: Self::DEFAULT_MIN_MASK_SIZE,
            border_threshold_percent: Self::DEFAULT_BORDER_THRESHOLD_PERCENT,
            morph_kernel_size: Self::DEFAULT_MORPH_KERNEL_SIZE,
            morph_iterations: Self::DEFAULT_MORPH_ITERATIONS,
            min_ssim: Self::DEFAULT_MIN_SSIM,
            size_similarity_threshold: Self::DEFAULT_SIZE_SIMILARITY_THRESHOLD,
            short_circuit_ssim: true,
            ssim_window: Self::DEFAULT_SSIM_WINDOW,
            grayscale: false,
            max_regions: None,
        }
    }
}

/// Result of running the full grouping pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Refined masks, in extraction order.
    pub masks: Vec<Mask>,
    /// One region per refined mask, index-aligned with `masks`.
    pub regions: Vec<Region>,
    /// Groups, ungrouped indices, and similarity matrices over `regions`.
    pub grouping: GroupingResult,
    /// Dimensions of the source images in pixels.
    pub dimensions: Dimensions,
}

/// Errors that can occur during pipeline processing.
///
/// Uses custom `Serialize`/`Deserialize` because `image::ImageError`
/// does not implement serde traits. The `ImageDecode` variant is
/// serialized as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// An image or mask is malformed (zero-sized or mismatched dimensions).
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// A mask with no on pixels reached region cropping.
    #[error("mask {index} has no on pixels")]
    EmptyMask {
        /// Position of the offending mask in the input list.
        index: usize,
    },
}

/// Serde-compatible proxy for `PipelineError`.
///
/// `image::ImageError` does not implement serde, so the `ImageDecode`
/// variant stores its `Display` string instead.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    ImageDecode(String),
    EmptyInput,
    InvalidImage(String),
    InvalidConfig(String),
    EmptyMask { index: usize },
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::ImageDecode(e) => PipelineErrorProxy::ImageDecode(e.to_string()),
            Self::EmptyInput => PipelineErrorProxy::EmptyInput,
            Self::InvalidImage(s) => PipelineErrorProxy::InvalidImage(s.clone()),
            Self::InvalidConfig(s) => PipelineErrorProxy::InvalidConfig(s.clone()),
            Self::EmptyMask { index } => PipelineErrorProxy::EmptyMask { index: *index },
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            // The original image::ImageError cannot be reconstructed.
            PipelineErrorProxy::ImageDecode(msg) => {
                Self::InvalidImage(format!("image decode error: {msg}"))
            }
            PipelineErrorProxy::EmptyInput => Self::EmptyInput,
            PipelineErrorProxy::InvalidImage(s) => Self::InvalidImage(s),
            PipelineErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            PipelineErrorProxy::EmptyMask { index } => Self::EmptyMask { index },
        })
    }
}
