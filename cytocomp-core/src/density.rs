//! 2D density aggregation over compensated events.
//!
//! Each event that passes the gate chain is transformed on both axes,
//! normalized into `[0, 1]` by the axis range, and counted into a
//! `width × height` grid. Row 0 is the top of the plot, i.e. the high end
//! of the y range.

use crate::gate::GateRect;
use crate::soa::ChannelTable;
use crate::transform::Transform;
use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Smallest grid dimension.
pub const MIN_BINS: usize = 8;
/// Largest grid dimension.
pub const MAX_BINS: usize = 512;
/// Grid dimension used when none is given.
pub const DEFAULT_BINS: usize = 128;

/// Events per parallel work unit.
const AGGREGATION_CHUNK: usize = 64 * 1024;

/// Raw-space axis bounds of a plot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisRanges {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Default for AxisRanges {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: 1.0,
            y_min: 0.0,
            y_max: 1.0,
        }
    }
}

/// Everything a density result depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DensityQuery {
    pub x_param: usize,
    pub y_param: usize,
    pub transform: Transform,
    pub ranges: AxisRanges,
    pub gates: Vec<GateRect>,
    pub width: usize,
    pub height: usize,
}

impl DensityQuery {
    /// Query over a channel pair with default transform, ranges and grid.
    #[must_use]
    pub fn new(x_param: usize, y_param: usize) -> Self {
        Self {
            x_param,
            y_param,
            transform: Transform::Linear,
            ranges: AxisRanges::default(),
            gates: Vec::new(),
            width: DEFAULT_BINS,
            height: DEFAULT_BINS,
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn with_ranges(mut self, ranges: AxisRanges) -> Self {
        self.ranges = ranges;
        self
    }

    #[must_use]
    pub fn with_gates(mut self, gates: Vec<GateRect>) -> Self {
        self.gates = gates;
        self
    }

    /// Sets the grid size; each dimension is clamped to `[MIN_BINS, MAX_BINS]`.
    #[must_use]
    pub fn with_grid(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self.clamp_grid()
    }

    #[must_use]
    fn clamp_grid(mut self) -> Self {
        self.width = self.width.clamp(MIN_BINS, MAX_BINS);
        self.height = self.height.clamp(MIN_BINS, MAX_BINS);
        self
    }

    /// Canonical identity string of this query, used as a cache key.
    #[must_use]
    pub fn key(&self) -> String {
        serde_json::to_string(&self.clone().clamp_grid()).unwrap_or_default()
    }

    fn check_channels(&self, n_channels: usize) -> Result<()> {
        let max = self
            .gates
            .iter()
            .map(GateRect::max_param)
            .chain([self.x_param, self.y_param])
            .max()
            .unwrap_or(0);
        if max >= n_channels {
            return Err(Error::ChannelOutOfRange {
                index: max,
                n_channels,
            });
        }
        Ok(())
    }
}

/// A counts grid and its summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DensityGrid {
    pub width: usize,
    pub height: usize,
    /// Row-major, row 0 at the top.
    pub counts: Vec<u32>,
    pub max_count: u32,
    pub n_passed: u64,
    /// Events scanned.
    pub total: u64,
}

impl DensityGrid {
    /// Count at column `x`, row `y`.
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> u32 {
        self.counts[y * self.width + x]
    }
}

/// Linear map from a transformed axis range onto `[0, 1]`.
#[derive(Clone, Copy)]
struct AxisScale {
    min_t: f64,
    span: f64,
}

impl AxisScale {
    fn new(transform: &Transform, min: f64, max: f64) -> Self {
        let min_t = transform.apply(min);
        let span = transform.apply(max) - min_t;
        Self {
            min_t,
            span: if span == 0.0 || span.is_nan() { 1.0 } else { span },
        }
    }

    #[inline]
    fn normalize(&self, transformed: f64) -> f64 {
        (transformed - self.min_t) / self.span
    }
}

/// Maps a normalized coordinate in `[0, 1]` to a bin in `[0, bins)`.
#[inline]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn bin_of(normalized: f64, bins: usize) -> usize {
    ((normalized * bins as f64).floor() as usize).min(bins - 1)
}

struct Partial {
    counts: Vec<u32>,
    n_passed: u64,
}

impl Partial {
    fn empty(cells: usize) -> Self {
        Self {
            counts: vec![0; cells],
            n_passed: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.counts.iter_mut().zip(other.counts) {
            *a += b;
        }
        self.n_passed += other.n_passed;
        self
    }
}

/// Bins every event of `table` (already compensated) for `query`.
///
/// Events that fail the gate chain, or whose normalized coordinates are
/// non-finite or outside `[0, 1]`, are excluded from every counter.
///
/// # Errors
/// Returns [`Error::ChannelOutOfRange`] if the query names a channel the
/// table does not have.
pub fn aggregate(table: &ChannelTable, query: &DensityQuery) -> Result<DensityGrid> {
    query.check_channels(table.n_channels())?;
    let query = query.clone().clamp_grid();
    let (width, height) = (query.width, query.height);
    let cells = width * height;

    let xs = &table.columns()[query.x_param];
    let ys = &table.columns()[query.y_param];
    let sx = AxisScale::new(&query.transform, query.ranges.x_min, query.ranges.x_max);
    let sy = AxisScale::new(&query.transform, query.ranges.y_min, query.ranges.y_max);
    let gate_columns: Vec<(&[f32], &[f32], &GateRect)> = query
        .gates
        .iter()
        .map(|g| {
            (
                table.columns()[g.x_param].as_slice(),
                table.columns()[g.y_param].as_slice(),
                g,
            )
        })
        .collect();

    let n_events = table.len();
    let n_chunks = n_events.div_ceil(AGGREGATION_CHUNK);

    let partial = (0..n_chunks)
        .into_par_iter()
        .fold(
            || Partial::empty(cells),
            |mut acc, chunk| {
                let start = chunk * AGGREGATION_CHUNK;
                let end = (start + AGGREGATION_CHUNK).min(n_events);
                for e in start..end {
                    let passes = gate_columns.iter().all(|(gx, gy, g)| {
                        g.contains(f64::from(gx[e]), f64::from(gy[e]))
                    });
                    if !passes {
                        continue;
                    }
                    let nx = sx.normalize(query.transform.apply(f64::from(xs[e])));
                    let ny = sy.normalize(query.transform.apply(f64::from(ys[e])));
                    if !(0.0..=1.0).contains(&nx) || !(0.0..=1.0).contains(&ny) {
                        continue;
                    }
                    let bx = bin_of(nx, width);
                    let by = height - 1 - bin_of(ny, height);
                    acc.counts[by * width + bx] += 1;
                    acc.n_passed += 1;
                }
                acc
            },
        )
        .reduce(|| Partial::empty(cells), Partial::merge);

    let max_count = partial.counts.iter().copied().max().unwrap_or(0);
    log::debug!(
        "density {}x{} over {n_events} events: {} passed, max {max_count}",
        width,
        height,
        partial.n_passed
    );

    Ok(DensityGrid {
        width,
        height,
        counts: partial.counts,
        max_count,
        n_passed: partial.n_passed,
        total: n_events as u64,
    })
}
