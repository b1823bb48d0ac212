//! Integration test: run a synthetic app screenshot through the full
//! pipeline and check the refinement and grouping invariants.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_truncation)]

use image::{DynamicImage, Rgba, RgbaImage};
use masksim_pipeline::region::bounding_boxes_and_centroids;
use masksim_pipeline::similarity::find_similar_regions;
use masksim_pipeline::{
    Mask, MinMaskSize, PipelineCache, PipelineConfig, ProcessResult, SimilarityConfig, decode,
    extract, refine, region,
};

const CARDS: [(u32, u32); 4] = [(20, 40), (70, 40), (120, 40), (20, 95)];
const CARD_SIZE: (u32, u32) = (40, 30);

fn in_rect(x: u32, y: u32, (x0, y0): (u32, u32), (w, h): (u32, u32)) -> bool {
    (x0..x0 + w).contains(&x) && (y0..y0 + h).contains(&y)
}

fn encode_png(img: &RgbaImage) -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        img.as_raw(),
        img.width(),
        img.height(),
        image::ExtendedColorType::Rgba8,
    )
    .unwrap();
    buf
}

/// A 200x150 screen: a header inset from the side edges, four identical cards (the first
/// with a small badge painted over it in the segmentation only), a thin
/// divider, and a tall sidebar widget. The page background reaches
/// every edge so the border filter removes it.
fn screen() -> (RgbaImage, RgbaImage) {
    let segmented = RgbaImage::from_fn(200, 150, |x, y| {
        if y < 20 && (5..195).contains(&x) {
            return Rgba([20, 20, 20, 255]);
        }
        for (i, &origin) in CARDS.iter().enumerate() {
            if in_rect(x, y, origin, CARD_SIZE) {
                if i == 0 && in_rect(x, y, (35, 52), (10, 6)) {
                    return Rgba([255, 200, 0, 255]);
                }
                return Rgba([0, 100 + i as u8, 200, 255]);
            }
        }
        if y == 85 && (20..160).contains(&x) {
            Rgba([128, 128, 128, 255])
        } else if in_rect(x, y, (170, 40), (20, 60)) {
            Rgba([0, 180, 90, 255])
        } else {
            Rgba([245, 245, 245, 255])
        }
    });
    let original = RgbaImage::from_fn(200, 150, |x, y| {
        for &(cx, cy) in &CARDS {
            if in_rect(x, y, (cx, cy), CARD_SIZE) {
                let (dx, dy) = (x - cx, y - cy);
                return Rgba([(dx * 6) as u8, (dy * 8) as u8, ((dx ^ dy) * 4) as u8, 255]);
            }
        }
        Rgba([(x % 64) as u8 * 4, (y % 32) as u8 * 8, 100, 255])
    });
    (segmented, original)
}

fn run(config: &PipelineConfig) -> ProcessResult {
    let (segmented, original) = screen();
    let segmented = decode::decode(&encode_png(&segmented)).unwrap();
    let original = decode::decode(&encode_png(&original)).unwrap();
    masksim_pipeline::process(&segmented, &original, config).expect("pipeline should succeed")
}

#[test]
fn cards_are_grouped_and_everything_else_is_not() {
    let result = run(&PipelineConfig::default());
    eprintln!(
        "{} masks, groups {:?}, ungrouped {:?}",
        result.masks.len(),
        result.grouping.groups,
        result.grouping.ungrouped,
    );

    // Header, four cards, sidebar. Badge and divider are filtered out.
    assert_eq!(result.masks.len(), 6);
    let cards: Vec<usize> = result
        .regions
        .iter()
        .enumerate()
        .filter(|(_, r)| r.image.dimensions() == CARD_SIZE)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(cards.len(), 4);
    assert_eq!(result.grouping.groups, vec![cards.clone()]);
    assert_eq!(result.grouping.ungrouped.len(), 2);
    assert!(result.grouping.ungrouped.iter().all(|i| !cards.contains(i)));
}

#[test]
fn badge_hole_is_filled_in_first_card() {
    let result = run(&PipelineConfig::default());
    let first = result
        .masks
        .iter()
        .find(|m| m.get(20, 40))
        .expect("first card mask");
    assert_eq!(first.count_on(), 40 * 30);
}

#[test]
fn refined_masks_satisfy_invariants() {
    let config = PipelineConfig::default();
    let result = run(&config);
    let masks = &result.masks;

    for (i, a) in masks.iter().enumerate() {
        assert!(!a.is_empty(), "mask {i} is empty");
        assert!(
            !refine::is_close_to_all_borders(a, config.border_threshold_percent),
            "mask {i} touches all borders"
        );
        for (j, b) in masks.iter().enumerate() {
            if i != j {
                assert!(!a.is_subset_of(b), "mask {i} is inside mask {j}");
            }
        }
    }

    for (bbox, _) in bounding_boxes_and_centroids(masks) {
        let bbox = bbox.unwrap();
        assert!(bbox.pixel_height() >= config.min_mask_size.height);
        assert!(bbox.pixel_width() >= config.min_mask_size.width);
    }
}

#[test]
fn regions_align_with_masks() {
    let result = run(&PipelineConfig::default());
    let boxes = bounding_boxes_and_centroids(&result.masks);
    assert_eq!(result.regions.len(), result.masks.len());
    for (i, (region, (bbox, centroid))) in result.regions.iter().zip(&boxes).enumerate() {
        let bbox = bbox.unwrap();
        assert_eq!(region.mask_index, i);
        assert_eq!(region.bounding_box, bbox);
        assert_eq!(region.centroid(), *centroid);
        assert_eq!(
            region.image.dimensions(),
            (bbox.pixel_width(), bbox.pixel_height())
        );
    }
}

#[test]
fn grouping_partitions_regions_and_matrices_are_symmetric() {
    for short_circuit_ssim in [true, false] {
        let result = run(&PipelineConfig {
            short_circuit_ssim,
            ..PipelineConfig::default()
        });
        let n = result.regions.len();
        let grouping = &result.grouping;

        let mut seen: Vec<usize> = grouping
            .groups
            .iter()
            .flatten()
            .chain(&grouping.ungrouped)
            .copied()
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
        assert!(grouping.groups.iter().all(|g| g.len() >= 2));

        for i in 0..n {
            assert!((grouping.ssim.get(i, i) - 1.0).abs() < f64::EPSILON);
            assert!((grouping.size_similarity.get(i, i) - 1.0).abs() < f64::EPSILON);
            for j in 0..n {
                assert_eq!(
                    grouping.ssim.get(i, j).to_bits(),
                    grouping.ssim.get(j, i).to_bits()
                );
                assert_eq!(
                    grouping.size_similarity.get(i, j).to_bits(),
                    grouping.size_similarity.get(j, i).to_bits()
                );
            }
        }

        if !short_circuit_ssim {
            assert_eq!(grouping.ssim.nan_pairs(), 0);
        }
    }
}

#[test]
fn cache_returns_identical_result() {
    let (segmented, original) = screen();
    let segmented = DynamicImage::ImageRgba8(segmented);
    let original = DynamicImage::ImageRgba8(original);
    let config = PipelineConfig::default();

    let mut cache = PipelineCache::default();
    let cached = cache.get_or_process(&segmented, &original, &config).unwrap();
    let again = cache.get_or_process(&segmented, &original, &config).unwrap();
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cached.grouping, again.grouping);

    let direct = masksim_pipeline::process(&segmented, &original, &config).unwrap();
    assert_eq!(cached.grouping, direct.grouping);
    assert_eq!(cached.masks, direct.masks);
}

#[test]
fn disjoint_same_color_patches_form_one_mask() {
    let img = RgbaImage::from_fn(64, 64, |x, y| {
        if (x < 8 && y < 8) || ((50..58).contains(&x) && (50..58).contains(&y)) {
            Rgba([200, 0, 0, 255])
        } else {
            Rgba([0, 0, 200, 255])
        }
    });
    let masks = extract::extract_masks(&img).unwrap();
    assert_eq!(masks.len(), 2);
    assert!(masks.iter().any(|m| m.count_on() == 128 && m.get(0, 0) && m.get(57, 57)));
}

#[test]
fn identical_pair_grouped_small_crop_left_out() {
    let tile = RgbaImage::from_fn(20, 20, |x, y| Rgba([(x * 12) as u8, (y * 12) as u8, 7, 255]));
    let small = RgbaImage::from_fn(5, 5, |x, y| Rgba([(x * 40) as u8, 0, (y * 40) as u8, 255]));
    let config = SimilarityConfig {
        min_ssim: 0.95,
        size_similarity_threshold: 0.9,
        ..SimilarityConfig::default()
    };
    let grouping = find_similar_regions(&[&tile, &tile.clone(), &small], &config).unwrap();
    assert_eq!(grouping.groups, vec![vec![0, 1]]);
    assert_eq!(grouping.ungrouped, vec![2]);
}

#[test]
fn short_mask_is_filtered_by_size() {
    let mask = Mask::from_fn(50, 50, |x, y| (5..25).contains(&x) && (5..15).contains(&y));
    let kept = refine::filter_masks_by_size(
        vec![mask],
        MinMaskSize {
            height: 15,
            width: 15,
        },
    );
    assert!(kept.is_empty());
}

#[test]
fn no_masks_means_no_regions() {
    let original = RgbaImage::new(10, 10);
    assert!(region::extract_regions(&original, &[]).unwrap().is_empty());
}
