//! Tunables for preview sampling, full apply and density jobs.

use crate::{Error, Result};
use cytocomp_core::density::{DEFAULT_BINS, MAX_BINS, MIN_BINS};
use cytocomp_core::DensityQuery;
use cytocomp_fcs::PREVIEW_CAP;

/// Events decoded between progress reports during a full apply.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Configuration for a [`crate::Session`] and its background worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Largest preview sample decoded at load time.
    pub preview_cap: usize,
    /// Events per progress/cancellation chunk while applying.
    pub chunk_size: usize,
    /// Default density grid width.
    pub grid_width: usize,
    /// Default density grid height.
    pub grid_height: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preview_cap: PREVIEW_CAP,
            chunk_size: DEFAULT_CHUNK_SIZE,
            grid_width: DEFAULT_BINS,
            grid_height: DEFAULT_BINS,
        }
    }
}

impl PipelineConfig {
    /// Set the preview sample cap.
    ///
    /// Values less than 1 are clamped to 1.
    #[must_use]
    pub fn with_preview_cap(mut self, cap: usize) -> Self {
        self.preview_cap = cap.max(1);
        self
    }

    /// Set the apply chunk size.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_chunk_size`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_chunk_size(mut self, events: usize) -> Self {
        self.chunk_size = events.max(1);
        self
    }

    /// Fallible variant of [`Self::with_chunk_size`].
    ///
    /// # Errors
    /// Returns an error if `events` is 0.
    pub fn try_with_chunk_size(mut self, events: usize) -> Result<Self> {
        if events == 0 {
            return Err(Error::InvalidConfig(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        self.chunk_size = events;
        Ok(self)
    }

    /// Set the default density grid, clamped to `[MIN_BINS, MAX_BINS]` per axis.
    #[must_use]
    pub fn with_grid(mut self, width: usize, height: usize) -> Self {
        self.grid_width = width.clamp(MIN_BINS, MAX_BINS);
        self.grid_height = height.clamp(MIN_BINS, MAX_BINS);
        self
    }

    /// A density query over a channel pair using the configured grid.
    #[must_use]
    pub fn density_query(&self, x_param: usize, y_param: usize) -> DensityQuery {
        DensityQuery::new(x_param, y_param).with_grid(self.grid_width, self.grid_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.preview_cap, 10_000);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!((config.grid_width, config.grid_height), (128, 128));
    }

    #[test]
    fn test_builders_clamp() {
        let config = PipelineConfig::default()
            .with_preview_cap(0)
            .with_chunk_size(0)
            .with_grid(2, 4096);
        assert_eq!(config.preview_cap, 1);
        assert_eq!(config.chunk_size, 1);
        assert_eq!((config.grid_width, config.grid_height), (8, 512));
        let q = config.density_query(0, 1);
        assert_eq!((q.width, q.height), (8, 512));
    }

    #[test]
    fn test_try_with_chunk_size() {
        assert!(PipelineConfig::default().try_with_chunk_size(0).is_err());
        let config = PipelineConfig::default().try_with_chunk_size(64).unwrap();
        assert_eq!(config.chunk_size, 64);
    }
}
