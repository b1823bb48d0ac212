//! Region extraction: bounding boxes, centroids, and masked crops.
//!
//! Each refined mask selects one region of the original screenshot. The
//! region image is the original cropped to the mask's on-pixel extent,
//! with every pixel outside the mask set to zero (all four channels, no
//! blending).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{BoundingBox, Dimensions, Mask, PipelineError, Point, RgbaImage};

/// A masked crop of the original image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Cropped pixels, zeroed outside the mask.
    pub image: RgbaImage,
    /// Bounding box of the mask in original-image coordinates.
    pub bounding_box: BoundingBox,
    /// Index of the mask this region was cut from.
    pub mask_index: usize,
}

impl Region {
    /// Center of the region's bounding box.
    #[must_use]
    pub fn centroid(&self) -> Point {
        self.bounding_box.centroid()
    }

    /// Dimensions of the cropped image.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.image.width(),
            height: self.image.height(),
        }
    }
}

/// Serde-compatible proxy for `Region`.
///
/// The crop is represented as a `(width, height, raw_pixel_bytes)` tuple
/// since `image::ImageBuffer` does not implement serde traits.
#[derive(Serialize, Deserialize)]
struct RegionProxy {
    image: (u32, u32, Vec<u8>),
    bounding_box: BoundingBox,
    mask_index: usize,
}

impl Serialize for Region {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RegionProxy {
            image: (
                self.image.width(),
                self.image.height(),
                self.image.as_raw().clone(),
            ),
            bounding_box: self.bounding_box,
            mask_index: self.mask_index,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Region {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = RegionProxy::deserialize(deserializer)?;
        let image = RgbaImage::from_raw(proxy.image.0, proxy.image.1, proxy.image.2)
            .ok_or_else(|| serde::de::Error::custom("invalid region image dimensions"))?;
        Ok(Self {
            image,
            bounding_box: proxy.bounding_box,
            mask_index: proxy.mask_index,
        })
    }
}

/// Bounding box of the on pixels of `mask`, or `None` if it is empty.
///
/// `height`/`width` follow the `max - min` convention documented on
/// [`BoundingBox`].
#[must_use]
pub fn bounding_box(mask: &Mask) -> Option<BoundingBox> {
    let mut pixels = mask.on_pixels();
    let (x0, y0) = pixels.next()?;
    // Row-major order: the first on pixel has the smallest row and y
    // never decreases.
    let min_y = y0;
    let (mut min_x, mut max_x, mut max_y) = (x0, x0, y0);
    for (x, y) in pixels {
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        max_y = y;
    }
    Some(BoundingBox {
        top: min_y,
        left: min_x,
        height: max_y - min_y,
        width: max_x - min_x,
    })
}

/// Bounding box and centroid of every mask, index-aligned with `masks`.
///
/// Empty masks produce `None` and a NaN centroid rather than an error;
/// callers that need a box must check for it.
#[must_use]
pub fn bounding_boxes_and_centroids(masks: &[Mask]) -> Vec<(Option<BoundingBox>, Point)> {
    masks
        .iter()
        .map(|mask| {
            let bbox = bounding_box(mask);
            let centroid = bbox.as_ref().map_or_else(Point::nan, BoundingBox::centroid);
            (bbox, centroid)
        })
        .collect()
}

/// Crop `original` to each mask's extent, zeroing pixels outside the mask.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidImage`] if a mask's dimensions differ
/// from `original`'s. Returns [`PipelineError::EmptyMask`] if a mask has
/// no on pixels, since there is no extent to crop to.
pub fn extract_regions(original: &RgbaImage, masks: &[Mask]) -> Result<Vec<Region>, PipelineError> {
    let expected = Dimensions {
        width: original.width(),
        height: original.height(),
    };

    let regions = masks
        .iter()
        .enumerate()
        .map(|(index, mask)| {
            if mask.dimensions() != expected {
                return Err(PipelineError::InvalidImage(format!(
                    "mask {index} is {}x{}, original image is {}x{}",
                    mask.width(),
                    mask.height(),
                    expected.width,
                    expected.height,
                )));
            }
            let bbox = bounding_box(mask).ok_or(PipelineError::EmptyMask { index })?;
            let image = RgbaImage::from_fn(bbox.pixel_width(), bbox.pixel_height(), |x, y| {
                let (sx, sy) = (bbox.left + x, bbox.top + y);
                if mask.get(sx, sy) {
                    *original.get_pixel(sx, sy)
                } else {
                    image::Rgba([0, 0, 0, 0])
                }
            });
            Ok(Region {
                image,
                bounding_box: bbox,
                mask_index: index,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!(masks = masks.len(), regions = regions.len(), "extracted regions");
    Ok(regions)
}
