//! Similarity engine: pairwise scores and greedy grouping of regions.
//!
//! Two scores are computed for every unordered pair of region images:
//!
//! - **size similarity**, the mean of the width and height ratios, which
//!   is cheap and always computed;
//! - **SSIM** (structural similarity) on copies of both images resized to
//!   a common size, which is expensive and skipped (recorded as NaN) when
//!   short-circuiting is enabled and the size similarity is already below
//!   the threshold.
//!
//! Grouping is a single greedy pass over the finished matrices: each
//! not-yet-assigned region becomes a seed and collects every later
//! unassigned region similar to *it*. Members of a group are therefore
//! similar to the seed, not necessarily to each other, and the result
//! depends on region order. This is deliberate and is not a transitive
//! closure of the similarity graph.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{Dimensions, PipelineConfig, PipelineError, RgbaImage};

/// SSIM stabilization constant for the luminance term.
const K1: f64 = 0.01;
/// SSIM stabilization constant for the contrast/structure term.
const K2: f64 = 0.03;
/// Floor for the common comparison size, independent of window size.
const MIN_COMPARE_SIDE: u32 = 7;
/// Largest accepted SSIM window. The comparison size grows with the
/// window, so this also bounds the resized copies at 511x511 per side.
pub const MAX_WIN_SIZE: u32 = 255;

/// Which channels SSIM is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SsimMode {
    /// Mean of the R, G, and B channel scores.
    #[default]
    Color,
    /// Single score over luma.
    Grayscale,
}

/// Parameters for the similarity engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Minimum SSIM for two regions to be grouped.
    pub min_ssim: f64,
    /// Minimum size similarity for two regions to be grouped.
    pub size_similarity_threshold: f64,
    /// Skip SSIM for pairs below `size_similarity_threshold`.
    pub short_circuit: bool,
    /// SSIM window side.
    pub win_size: u32,
    /// Channels to compare.
    pub mode: SsimMode,
    /// Upper bound on the number of regions.
    pub max_regions: Option<usize>,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        PipelineConfig::default().similarity()
    }
}

impl SimilarityConfig {
    /// Check threshold and window ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `min_ssim` is outside
    /// `[-1, 1]`, `size_similarity_threshold` is outside `[0, 1]`, or
    /// `win_size` is even or smaller than 3.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(-1.0..=1.0).contains(&self.min_ssim) {
            return Err(PipelineError::InvalidConfig(format!(
                "min_ssim must be in [-1, 1], got {}",
                self.min_ssim,
            )));
        }
        if !(0.0..=1.0).contains(&self.size_similarity_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "size_similarity_threshold must be in [0, 1], got {}",
                self.size_similarity_threshold,
            )));
        }
        validate_win_size(self.win_size)
    }

    fn check_region_count(&self, count: usize) -> Result<(), PipelineError> {
        match self.max_regions {
            Some(max) if count > max => Err(PipelineError::InvalidConfig(format!(
                "{count} regions exceeds max_regions = {max}"
            ))),
            _ => Ok(()),
        }
    }
}

fn validate_win_size(win_size: u32) -> Result<(), PipelineError> {
    if !(3..=MAX_WIN_SIZE).contains(&win_size) || win_size % 2 == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "SSIM window must be odd and in [3, {MAX_WIN_SIZE}], got {win_size}"
        )));
    }
    Ok(())
}

/// Square, symmetric matrix of pairwise scores.
///
/// Equality compares bit patterns, so two matrices holding NaN in the
/// same cells are equal. Serialized with NaN cells as `null`.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    size: usize,
    values: Vec<f64>,
}

impl SimilarityMatrix {
    /// An `n x n` matrix with `1.0` on the diagonal and `0.0` elsewhere.
    #[must_use]
    pub fn identity(n: usize) -> Self {
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
        }
        Self { size: n, values }
    }

    /// Number of rows (and columns).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` for a `0 x 0` matrix.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Score at row `i`, column `j`.
    ///
    /// # Panics
    ///
    /// Panics if `i` or `j` is out of range.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.size + j]
    }

    /// Set both `(i, j)` and `(j, i)`.
    pub fn set_symmetric(&mut self, i: usize, j: usize, value: f64) {
        self.values[i * self.size + j] = value;
        self.values[j * self.size + i] = value;
    }

    /// Number of off-diagonal unordered pairs holding NaN.
    #[must_use]
    pub fn nan_pairs(&self) -> usize {
        (0..self.size)
            .map(|i| {
                (i + 1..self.size)
                    .filter(|&j| self.get(i, j).is_nan())
                    .count()
            })
            .sum()
    }
}

impl PartialEq for SimilarityMatrix {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Serde-compatible proxy for `SimilarityMatrix`.
///
/// JSON has no NaN, so "not computed" cells are written as `null`.
#[derive(Serialize, Deserialize)]
struct SimilarityMatrixProxy {
    size: usize,
    values: Vec<Option<f64>>,
}

impl Serialize for SimilarityMatrix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SimilarityMatrixProxy {
            size: self.size,
            values: self
                .values
                .iter()
                .map(|&v| (!v.is_nan()).then_some(v))
                .collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SimilarityMatrix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = SimilarityMatrixProxy::deserialize(deserializer)?;
        if proxy.size.checked_mul(proxy.size) != Some(proxy.values.len()) {
            return Err(serde::de::Error::custom(
                "similarity matrix values do not match its size",
            ));
        }
        Ok(Self {
            size: proxy.size,
            values: proxy
                .values
                .into_iter()
                .map(|v| v.unwrap_or(f64::NAN))
                .collect(),
        })
    }
}

/// Output of [`find_similar_regions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingResult {
    /// Groups of two or more region indices, seed first, then ascending.
    pub groups: Vec<Vec<usize>>,
    /// Indices in no group, ascending.
    pub ungrouped: Vec<usize>,
    /// Pairwise SSIM. NaN where short-circuited.
    pub ssim: SimilarityMatrix,
    /// Pairwise size similarity.
    pub size_similarity: SimilarityMatrix,
}

impl GroupingResult {
    /// A result over zero regions.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            groups: Vec::new(),
            ungrouped: Vec::new(),
            ssim: SimilarityMatrix::identity(0),
            size_similarity: SimilarityMatrix::identity(0),
        }
    }
}

/// Size similarity of two images: the mean of the smaller-over-larger
/// ratio of their widths and of their heights.
///
/// Symmetric, in `[0, 1]`, and `1.0` iff the dimensions are identical.
#[must_use]
pub fn size_similarity(a: Dimensions, b: Dimensions) -> f64 {
    f64::midpoint(side_ratio(a.width, b.width), side_ratio(a.height, b.height))
}

fn side_ratio(a: u32, b: u32) -> f64 {
    if a == b {
        1.0
    } else {
        f64::from(a.min(b)) / f64::from(a.max(b))
    }
}

/// The common size both images are resized to before SSIM.
///
/// Each image is scaled up (never down) so both sides are at least
/// `max(2 * win_size + 1, 7)`, keeping its aspect ratio; the target is
/// the per-axis maximum of the two scaled sizes.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn comparison_size(a: Dimensions, b: Dimensions, win_size: u32) -> Dimensions {
    let min_side = f64::from(
        win_size
            .saturating_mul(2)
            .saturating_add(1)
            .max(MIN_COMPARE_SIDE),
    );
    let scaled = |d: Dimensions| {
        let scale = (min_side / f64::from(d.width))
            .max(min_side / f64::from(d.height))
            .max(1.0);
        (
            (f64::from(d.width) * scale).floor() as u32,
            (f64::from(d.height) * scale).floor() as u32,
        )
    };
    let (aw, ah) = scaled(a);
    let (bw, bh) = scaled(b);
    Dimensions {
        width: aw.max(bw),
        height: ah.max(bh),
    }
}

/// Structural similarity of two images.
///
/// Both images are resized (Lanczos3) to [`comparison_size`], then SSIM
/// is computed with a uniform `win_size` window, sample covariance, and a
/// per-channel data range taken from the two images. In
/// [`SsimMode::Color`] the R, G, and B scores are averaged.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidImage`] if either image has zero area.
/// Returns [`PipelineError::InvalidConfig`] if `win_size` is even, below
/// 3, or larger than the smaller side of the common size.
pub fn image_similarity(
    a: &RgbaImage,
    b: &RgbaImage,
    mode: SsimMode,
    win_size: u32,
) -> Result<f64, PipelineError> {
    validate_win_size(win_size)?;
    let (da, db) = (dims(a), dims(b));
    if da.is_empty() || db.is_empty() {
        return Err(PipelineError::InvalidImage(
            "cannot compare an image with zero area".to_string(),
        ));
    }

    let target = comparison_size(da, db, win_size);
    if win_size > target.width.min(target.height) {
        return Err(PipelineError::InvalidConfig(format!(
            "SSIM window {win_size} exceeds comparison size {}x{}",
            target.width, target.height,
        )));
    }

    let ra = image::imageops::resize(a, target.width, target.height, FilterType::Lanczos3);
    let rb = image::imageops::resize(b, target.width, target.height, FilterType::Lanczos3);
    let (w, h, win) = (
        target.width as usize,
        target.height as usize,
        win_size as usize,
    );

    let score = match mode {
        SsimMode::Grayscale => {
            ssim_channel(&luma(&ra), &luma(&rb), w, h, win)
        }
        SsimMode::Color => {
            let total: f64 = (0..3)
                .map(|c| ssim_channel(&channel(&ra, c), &channel(&rb, c), w, h, win))
                .sum();
            total / 3.0
        }
    };
    Ok(score)
}

fn dims(image: &RgbaImage) -> Dimensions {
    Dimensions {
        width: image.width(),
        height: image.height(),
    }
}

/// ITU-R 601 luma in 16-bit fixed point, rounded, so grayscale scores
/// match the usual `L` conversion of screenshot tooling.
fn luma(image: &RgbaImage) -> Vec<f64> {
    image
        .pixels()
        .map(|p| {
            let [r, g, b, _] = p.0;
            let l = (u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471 + 0x8000)
                >> 16;
            f64::from(l)
        })
        .collect()
}

fn channel(image: &RgbaImage, c: usize) -> Vec<f64> {
    image.pixels().map(|p| f64::from(p.0[c])).collect()
}

/// Summed-area tables for the five moments SSIM needs.
struct Moments {
    stride: usize,
    // [a, b, a*a, b*b, a*b], (width + 1) x (height + 1), zero first row/column.
    table: Vec<[f64; 5]>,
}

impl Moments {
    fn new(a: &[f64], b: &[f64], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut table = vec![[0.0; 5]; stride * (height + 1)];
        for y in 0..height {
            let mut row = [0.0; 5];
            for x in 0..width {
                let (va, vb) = (a[y * width + x], b[y * width + x]);
                let cell = [va, vb, va * va, vb * vb, va * vb];
                for (r, v) in row.iter_mut().zip(cell) {
                    *r += v;
                }
                let above = table[y * stride + x + 1];
                let out = &mut table[(y + 1) * stride + x + 1];
                for k in 0..5 {
                    out[k] = above[k] + row[k];
                }
            }
        }
        Self { stride, table }
    }

    /// Sums over the `win x win` window with top-left corner `(x, y)`.
    fn window(&self, x: usize, y: usize, win: usize) -> [f64; 5] {
        let at = |xx: usize, yy: usize| self.table[yy * self.stride + xx];
        let (br, tr, bl, tl) = (at(x + win, y + win), at(x + win, y), at(x, y + win), at(x, y));
        std::array::from_fn(|k| br[k] - tr[k] - bl[k] + tl[k])
    }
}

/// Mean SSIM over all `win x win` windows fully inside a single channel.
#[allow(clippy::cast_precision_loss)]
fn ssim_channel(a: &[f64], b: &[f64], width: usize, height: usize, win: usize) -> f64 {
    let (lo, hi) = a
        .iter()
        .chain(b)
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let data_range = hi - lo;
    // Both channels are the same constant.
    if data_range == 0.0 {
        return 1.0;
    }

    let c1 = (K1 * data_range).powi(2);
    let c2 = (K2 * data_range).powi(2);
    let np = (win * win) as f64;
    let cov_norm = np / (np - 1.0);
    let moments = Moments::new(a, b, width, height);

    let mut total = 0.0;
    let mut count = 0usize;
    for y in 0..=height - win {
        for x in 0..=width - win {
            let [sa, sb, saa, sbb, sab] = moments.window(x, y, win);
            let (ux, uy) = (sa / np, sb / np);
            let vx = cov_norm * (saa / np - ux * ux);
            let vy = cov_norm * (sbb / np - uy * uy);
            let vxy = cov_norm * (sab / np - ux * uy);
            let num = (2.0 * ux).mul_add(uy, c1) * 2.0f64.mul_add(vxy, c2);
            let den = (ux.mul_add(ux, uy * uy) + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }
    total / count as f64
}

/// Scores for one unordered pair of images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    /// Size similarity.
    pub size_similarity: f64,
    /// SSIM, or NaN if short-circuited.
    pub ssim: f64,
}

/// Score one pair, skipping SSIM when short-circuiting allows it.
///
/// Independent of every other pair, so callers may evaluate pairs in
/// any order or in parallel.
///
/// # Errors
///
/// Propagates errors from [`image_similarity`].
pub fn compare_pair(
    a: &RgbaImage,
    b: &RgbaImage,
    config: &SimilarityConfig,
) -> Result<PairScore, PipelineError> {
    let size_sim = size_similarity(dims(a), dims(b));
    let ssim = if !config.short_circuit || size_sim >= config.size_similarity_threshold {
        image_similarity(a, b, config.mode, config.win_size)?
    } else {
        f64::NAN
    };
    Ok(PairScore {
        size_similarity: size_sim,
        ssim,
    })
}

/// Compute the `(ssim, size_similarity)` matrices over `images`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `config` is out of range or
/// there are more images than `config.max_regions`. Propagates errors
/// from [`image_similarity`].
pub fn compute_similarity_matrices(
    images: &[&RgbaImage],
    config: &SimilarityConfig,
) -> Result<(SimilarityMatrix, SimilarityMatrix), PipelineError> {
    config.validate()?;
    config.check_region_count(images.len())?;

    let n = images.len();
    let mut ssim = SimilarityMatrix::identity(n);
    let mut size = SimilarityMatrix::identity(n);
    for i in 0..n {
        for j in i + 1..n {
            let score = compare_pair(images[i], images[j], config)?;
            trace!(
                i,
                j,
                size_similarity = score.size_similarity,
                ssim = score.ssim,
                "scored pair"
            );
            size.set_symmetric(i, j, score.size_similarity);
            ssim.set_symmetric(i, j, score.ssim);
        }
    }
    Ok((ssim, size))
}

/// Greedy star grouping over finished similarity matrices.
///
/// For each index `i` in order that is not yet assigned, open a group
/// `[i]` and add every later unassigned `j` with
/// `ssim[i][j] >= min_ssim` and `size[i][j] >= size_similarity_threshold`
/// (NaN never passes). Groups of one are discarded; `i` is marked
/// assigned either way. Returns `(groups, ungrouped)`, where `ungrouped`
/// lists, ascending, every index that is in no group.
#[must_use]
pub fn group_by_similarity(
    ssim: &SimilarityMatrix,
    size: &SimilarityMatrix,
    min_ssim: f64,
    size_similarity_threshold: f64,
) -> (Vec<Vec<usize>>, Vec<usize>) {
    debug_assert_eq!(ssim.len(), size.len(), "matrix sizes differ");
    let n = ssim.len().min(size.len());
    let mut assigned = vec![false; n];
    let mut in_group = vec![false; n];
    let mut groups = Vec::new();

    for i in 0..n {
        if assigned[i] {
            continue;
        }
        let mut group = vec![i];
        for j in i + 1..n {
            if !assigned[j]
                && ssim.get(i, j) >= min_ssim
                && size.get(i, j) >= size_similarity_threshold
            {
                group.push(j);
                assigned[j] = true;
            }
        }
        if group.len() > 1 {
            for &member in &group {
                in_group[member] = true;
            }
            groups.push(group);
        }
        assigned[i] = true;
    }

    let ungrouped = (0..n).filter(|&i| !in_group[i]).collect();
    (groups, ungrouped)
}

/// Score every pair of `images` and group the similar ones.
///
/// # Errors
///
/// See [`compute_similarity_matrices`].
pub fn find_similar_regions(
    images: &[&RgbaImage],
    config: &SimilarityConfig,
) -> Result<GroupingResult, PipelineError> {
    let (ssim, size_similarity) = compute_similarity_matrices(images, config)?;
    let (groups, ungrouped) = group_by_similarity(
        &ssim,
        &size_similarity,
        config.min_ssim,
        config.size_similarity_threshold,
    );
    debug!(
        regions = images.len(),
        groups = groups.len(),
        ungrouped = ungrouped.len(),
        short_circuited = ssim.nan_pairs(),
        "grouped similar regions"
    );
    Ok(GroupingResult {
        groups,
        ungrouped,
        ssim,
        size_similarity,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
mod tests {
    use super::*;

    fn d(width: u32, height: u32) -> Dimensions {
        Dimensions { width, height }
    }

    /// A textured image so SSIM has structure to compare.
    fn pattern(w: u32, h: u32, seed: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            let v = (x * 37 + y * 91 + seed * 53) % 256;
            image::Rgba([v as u8, (255 - v) as u8, ((x * y + seed) % 256) as u8, 255])
        })
    }

    fn checkerboard(w: u32, h: u32, cell: u32, invert: bool) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            let v = if on != invert { 255 } else { 0 };
            image::Rgba([v, v, v, 255])
        })
    }

    fn matrix_from(rows: &[&[f64]]) -> SimilarityMatrix {
        let n = rows.len();
        let mut m = SimilarityMatrix::identity(n);
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if i < j {
                    m.set_symmetric(i, j, v);
                }
            }
        }
        m
    }

    // --- size similarity ---

    #[test]
    fn size_similarity_identical_is_one() {
        assert!((size_similarity(d(20, 30), d(20, 30)) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn size_similarity_is_mean_of_ratios() {
        // Widths 10/20 = 0.5, heights 30/30 = 1.0.
        assert!((size_similarity(d(10, 30), d(20, 30)) - 0.75).abs() < 1e-12);
        assert!((size_similarity(d(20, 20), d(5, 5)) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn size_similarity_is_symmetric() {
        let (a, b) = (d(13, 47), d(29, 8));
        assert_eq!(
            size_similarity(a, b).to_bits(),
            size_similarity(b, a).to_bits()
        );
    }

    // --- comparison size ---

    #[test]
    fn comparison_size_upscales_small_images() {
        assert_eq!(comparison_size(d(20, 20), d(5, 5), 7), d(20, 20));
        assert_eq!(comparison_size(d(5, 5), d(5, 5), 7), d(15, 15));
    }

    #[test]
    fn comparison_size_keeps_aspect_ratio() {
        // 10x40 needs a 1.5x upscale for its width to reach 15.
        assert_eq!(comparison_size(d(10, 40), d(30, 30), 7), d(30, 60));
    }

    #[test]
    fn comparison_size_has_absolute_floor() {
        assert_eq!(comparison_size(d(2, 2), d(2, 2), 3), d(7, 7));
    }

    // --- SSIM ---

    #[test]
    fn identical_images_score_one() {
        let img = pattern(20, 20, 1);
        for mode in [SsimMode::Color, SsimMode::Grayscale] {
            let s = image_similarity(&img, &img, mode, 7).unwrap();
            assert!((s - 1.0).abs() < 1e-12, "{mode:?}: {s}");
        }
    }

    #[test]
    fn identical_constant_images_score_one() {
        let img = RgbaImage::from_pixel(10, 10, image::Rgba([40, 40, 40, 255]));
        let s = image_similarity(&img, &img, SsimMode::Color, 7).unwrap();
        assert!((s - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn inverted_checkerboard_scores_negative() {
        let a = checkerboard(32, 32, 4, false);
        let b = checkerboard(32, 32, 4, true);
        let s = image_similarity(&a, &b, SsimMode::Grayscale, 7).unwrap();
        assert!(s < 0.0, "expected anti-correlated score, got {s}");
    }

    #[test]
    fn different_textures_score_below_identical() {
        let a = pattern(24, 24, 1);
        let b = pattern(24, 24, 2);
        let s = image_similarity(&a, &b, SsimMode::Color, 7).unwrap();
        assert!(s < 0.99, "expected dissimilar textures, got {s}");
        assert!((-1.0..=1.0).contains(&s));
    }

    #[test]
    fn ssim_is_symmetric() {
        let a = pattern(18, 25, 3);
        let b = checkerboard(30, 22, 3, false);
        let ab = image_similarity(&a, &b, SsimMode::Color, 7).unwrap();
        let ba = image_similarity(&b, &a, SsimMode::Color, 7).unwrap();
        assert_eq!(ab.to_bits(), ba.to_bits());
    }

    #[test]
    fn even_window_is_rejected() {
        let img = pattern(20, 20, 0);
        let result = image_similarity(&img, &img, SsimMode::Color, 6);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn tiny_window_is_rejected() {
        let img = pattern(20, 20, 0);
        let result = image_similarity(&img, &img, SsimMode::Color, 1);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn huge_window_is_rejected_without_overflow() {
        let img = pattern(20, 20, 0);
        for win in [MAX_WIN_SIZE + 2, (1 << 31) + 1, u32::MAX] {
            let result = image_similarity(&img, &img, SsimMode::Color, win);
            assert!(matches!(result, Err(PipelineError::InvalidConfig(_))), "{win}");
        }
        let size = comparison_size(d(20, 20), d(20, 20), u32::MAX);
        assert!(size.width >= 20 && size.height >= 20);
    }

    #[test]
    fn largest_window_is_accepted() {
        let img = pattern(20, 20, 0);
        let s = image_similarity(&img, &img, SsimMode::Grayscale, MAX_WIN_SIZE).unwrap();
        assert!((s - 1.0).abs() < 1e-12);
    }

    #[test]
    fn luma_uses_601_weights() {
        let img = RgbaImage::from_fn(4, 1, |x, _| match x {
            0 => image::Rgba([255, 0, 0, 255]),
            1 => image::Rgba([0, 255, 0, 255]),
            2 => image::Rgba([0, 0, 255, 255]),
            _ => image::Rgba([255, 255, 255, 0]),
        });
        assert_eq!(luma(&img), vec![76.0, 150.0, 29.0, 255.0]);
    }

    #[test]
    fn zero_area_image_is_rejected() {
        let img = pattern(20, 20, 0);
        let empty = RgbaImage::new(0, 4);
        let result = image_similarity(&img, &empty, SsimMode::Color, 7);
        assert!(matches!(result, Err(PipelineError::InvalidImage(_))));
    }

    // --- matrices ---

    #[test]
    fn short_circuit_marks_skipped_pairs_nan() {
        let big = pattern(20, 20, 0);
        let small = pattern(5, 5, 0);
        let config = SimilarityConfig::default();
        let (ssim, size) = compute_similarity_matrices(&[&big, &small], &config).unwrap();
        assert!(ssim.get(0, 1).is_nan());
        assert!(ssim.get(1, 0).is_nan());
        assert!((size.get(0, 1) - 0.25).abs() < 1e-12);
        assert_eq!(ssim.nan_pairs(), 1);
    }

    #[test]
    fn disabling_short_circuit_computes_every_pair() {
        let big = pattern(20, 20, 0);
        let small = pattern(5, 5, 0);
        let config = SimilarityConfig {
            short_circuit: false,
            ..SimilarityConfig::default()
        };
        let (ssim, _) = compute_similarity_matrices(&[&big, &small], &config).unwrap();
        assert!(!ssim.get(0, 1).is_nan());
        assert_eq!(ssim.nan_pairs(), 0);
    }

    #[test]
    fn matrices_are_symmetric_with_unit_diagonal() {
        let images = [
            pattern(20, 20, 0),
            pattern(20, 22, 1),
            pattern(21, 20, 2),
            pattern(6, 40, 3),
        ];
        let refs: Vec<&RgbaImage> = images.iter().collect();
        let (ssim, size) =
            compute_similarity_matrices(&refs, &SimilarityConfig::default()).unwrap();
        for i in 0..4 {
            assert_eq!(ssim.get(i, i).to_bits(), 1.0f64.to_bits());
            assert_eq!(size.get(i, i).to_bits(), 1.0f64.to_bits());
            for j in 0..4 {
                assert_eq!(ssim.get(i, j).to_bits(), ssim.get(j, i).to_bits());
                assert_eq!(size.get(i, j).to_bits(), size.get(j, i).to_bits());
            }
        }
    }

    #[test]
    fn too_many_regions_is_rejected() {
        let img = pattern(10, 10, 0);
        let config = SimilarityConfig {
            max_regions: Some(2),
            ..SimilarityConfig::default()
        };
        let result = compute_similarity_matrices(&[&img, &img, &img], &config);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn out_of_range_thresholds_are_rejected() {
        for config in [
            SimilarityConfig {
                min_ssim: -1.5,
                ..SimilarityConfig::default()
            },
            SimilarityConfig {
                size_similarity_threshold: 1.1,
                ..SimilarityConfig::default()
            },
            SimilarityConfig {
                min_ssim: f64::NAN,
                ..SimilarityConfig::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
    }

    // --- grouping ---

    #[test]
    fn two_identical_and_one_small() {
        let a = pattern(20, 20, 4);
        let small = pattern(5, 5, 4);
        let config = SimilarityConfig {
            min_ssim: 0.95,
            size_similarity_threshold: 0.9,
            ..SimilarityConfig::default()
        };
        let result = find_similar_regions(&[&a, &a, &small], &config).unwrap();
        assert_eq!(result.groups, vec![vec![0, 1]]);
        assert_eq!(result.ungrouped, vec![2]);
    }

    #[test]
    fn grouping_is_a_star_around_the_seed() {
        // 1 and 2 are each similar to 0 but not to each other.
        let ssim = matrix_from(&[&[1.0, 0.95, 0.95], &[0.95, 1.0, 0.1], &[0.95, 0.1, 1.0]]);
        let size = matrix_from(&[&[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0]]);
        let (groups, ungrouped) = group_by_similarity(&ssim, &size, 0.9, 0.9);
        assert_eq!(groups, vec![vec![0, 1, 2]]);
        assert!(ungrouped.is_empty());
    }

    #[test]
    fn grouping_is_not_transitive() {
        // Chain 0~1, 1~2, but 0 and 2 dissimilar: 2 stays ungrouped
        // because 1 was consumed by seed 0.
        let ssim = matrix_from(&[&[1.0, 0.95, 0.1], &[0.95, 1.0, 0.95], &[0.1, 0.95, 1.0]]);
        let size = matrix_from(&[&[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0]]);
        let (groups, ungrouped) = group_by_similarity(&ssim, &size, 0.9, 0.9);
        assert_eq!(groups, vec![vec![0, 1]]);
        assert_eq!(ungrouped, vec![2]);
    }

    #[test]
    fn grouping_requires_both_thresholds() {
        let ssim = matrix_from(&[&[1.0, 0.99], &[0.99, 1.0]]);
        let size = matrix_from(&[&[1.0, 0.5], &[0.5, 1.0]]);
        let (groups, ungrouped) = group_by_similarity(&ssim, &size, 0.9, 0.9);
        assert!(groups.is_empty());
        assert_eq!(ungrouped, vec![0, 1]);
    }

    #[test]
    fn nan_never_groups() {
        let ssim = matrix_from(&[&[1.0, f64::NAN], &[f64::NAN, 1.0]]);
        let size = matrix_from(&[&[1.0, 1.0], &[1.0, 1.0]]);
        let (groups, _) = group_by_similarity(&ssim, &size, -1.0, 0.0);
        assert!(groups.is_empty());
    }

    #[test]
    fn every_index_in_exactly_one_place() {
        let ssim = matrix_from(&[
            &[1.0, 0.95, 0.2, 0.97, 0.1],
            &[0.95, 1.0, 0.3, 0.2, 0.1],
            &[0.2, 0.3, 1.0, 0.1, 0.96],
            &[0.97, 0.2, 0.1, 1.0, 0.1],
            &[0.1, 0.1, 0.96, 0.1, 1.0],
        ]);
        let size = SimilarityMatrix {
            size: 5,
            values: vec![1.0; 25],
        };
        let (groups, ungrouped) = group_by_similarity(&ssim, &size, 0.9, 0.9);
        assert_eq!(groups, vec![vec![0, 1, 3], vec![2, 4]]);
        let mut seen: Vec<usize> = groups.iter().flatten().chain(&ungrouped).copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn zero_regions_group_to_nothing() {
        let result = find_similar_regions(&[], &SimilarityConfig::default()).unwrap();
        assert_eq!(result, GroupingResult::empty());
    }

    // --- serde ---

    #[test]
    fn matrix_serializes_nan_as_null() {
        let mut m = SimilarityMatrix::identity(2);
        m.set_symmetric(0, 1, f64::NAN);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"size":2,"values":[1.0,null,null,1.0]}"#);
        let back: SimilarityMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn matrix_rejects_mismatched_length() {
        let result: Result<SimilarityMatrix, _> =
            serde_json::from_str(r#"{"size":2,"values":[1.0]}"#);
        assert!(result.is_err());
    }
}
