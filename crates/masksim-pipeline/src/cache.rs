//! Memoization of full pipeline runs.
//!
//! Screenshots of the same screen are often processed repeatedly while
//! tuning thresholds. [`PipelineCache`] keeps the most recent results in
//! a bounded LRU, keyed on a 128-bit SipHash of both images (dimensions,
//! pixel layout, and raw bytes) and every configuration field.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use image::DynamicImage;
use lru::LruCache;
use siphasher::sip128::{Hasher128, SipHasher13};
use tracing::trace;

use crate::types::{PipelineConfig, PipelineError, ProcessResult};

/// Identity of one `(segmented, original, config)` input triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u128);

impl CacheKey {
    /// Hash both images and the configuration.
    #[must_use]
    pub fn new(segmented: &DynamicImage, original: &DynamicImage, config: &PipelineConfig) -> Self {
        let mut hasher = SipHasher13::new();
        hash_image(segmented, &mut hasher);
        hash_image(original, &mut hasher);
        hash_config(config, &mut hasher);
        Self(hasher.finish128().as_u128())
    }
}

fn hash_image(image: &DynamicImage, hasher: &mut impl Hasher) {
    image.width().hash(hasher);
    image.height().hash(hasher);
    let color = image.color();
    color.bytes_per_pixel().hash(hasher);
    color.channel_count().hash(hasher);
    image.as_bytes().hash(hasher);
}

fn hash_config(config: &PipelineConfig, hasher: &mut impl Hasher) {
    let PipelineConfig {
        min_mask_size,
        border_threshold_percent,
        morph_kernel_size,
        morph_iterations,
        min_ssim,
        size_similarity_threshold,
        short_circuit_ssim,
        ssim_window,
        grayscale,
        max_regions,
    } = config;
    min_mask_size.height.hash(hasher);
    min_mask_size.width.hash(hasher);
    border_threshold_percent.to_bits().hash(hasher);
    morph_kernel_size.hash(hasher);
    morph_iterations.hash(hasher);
    min_ssim.to_bits().hash(hasher);
    size_similarity_threshold.to_bits().hash(hasher);
    short_circuit_ssim.hash(hasher);
    ssim_window.hash(hasher);
    grayscale.hash(hasher);
    max_regions.hash(hasher);
}

/// Hit and miss counters for a [`PipelineCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that ran the pipeline.
    pub misses: u64,
}

/// Bounded LRU cache of [`ProcessResult`]s.
///
/// Errors are never cached; a failing input is re-run on every call.
pub struct PipelineCache {
    entries: LruCache<CacheKey, Arc<ProcessResult>>,
    stats: CacheStats,
}

impl PipelineCache {
    /// Default number of results kept (16).
    pub const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(15);

    /// An empty cache holding at most `capacity` results.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Return the cached result for these inputs, running
    /// [`crate::process`] on a miss.
    ///
    /// # Errors
    ///
    /// See [`crate::process`].
    pub fn get_or_process(
        &mut self,
        segmented: &DynamicImage,
        original: &DynamicImage,
        config: &PipelineConfig,
    ) -> Result<Arc<ProcessResult>, PipelineError> {
        let key = CacheKey::new(segmented, original, config);
        if let Some(hit) = self.entries.get(&key) {
            self.stats.hits += 1;
            trace!(?key, "pipeline cache hit");
            return Ok(Arc::clone(hit));
        }

        self.stats.misses += 1;
        trace!(?key, "pipeline cache miss");
        let result = Arc::new(crate::process(segmented, original, config)?);
        self.entries.put(key, Arc::clone(&result));
        Ok(result)
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit and miss counts since creation or the last [`clear`](Self::clear).
    #[must_use]
    pub const fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drop every cached result and reset the counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.stats = CacheStats::default();
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
