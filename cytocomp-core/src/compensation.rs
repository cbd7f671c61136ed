//! Spillover compensation.
//!
//! Coefficients are stored row-major by target channel: `coeffs[to * n + from]`
//! is the fraction of channel `from` that leaks into channel `to`. Correction
//! subtracts those leaks from each target:
//!
//! ```text
//! corrected[to] = raw[to] - Σ coeff(from -> to) * raw[from]
//! ```
//!
//! The diagonal is always zero and every coefficient lies in
//! `[-MAX_ABS_COEFF, MAX_ABS_COEFF]`.

use crate::gate::GateRect;
use crate::soa::{ChannelTable, RawEvent};
use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Magnitude limit for any coefficient.
pub const MAX_ABS_COEFF: f64 = 10.0;

/// Coefficients with a smaller magnitude are treated as absent.
pub const EDGE_EPSILON: f64 = 1e-12;

/// Version tag of the persisted compensation format.
pub const COMPENSATION_FORMAT_VERSION: u32 = 1;

/// Clamps a coefficient into range; non-finite input becomes 0.
#[must_use]
#[inline]
pub fn clamp_coeff(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(-MAX_ABS_COEFF, MAX_ABS_COEFF)
    } else {
        0.0
    }
}

#[inline]
fn idx(n: usize, from: usize, to: usize) -> usize {
    to * n + from
}

/// One incoming cross-talk edge of a target channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub from: usize,
    pub coeff: f64,
}

/// A directed cross-talk pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpillPair {
    pub from: usize,
    pub to: usize,
    pub coeff: f64,
}

/// Sparse view of a coefficient matrix: the non-zero incoming edges of each
/// target channel.
///
/// Per-event correction cost is proportional to the number of edges, not `n²`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Adjacency {
    by_to: Vec<Vec<Edge>>,
}

impl Adjacency {
    /// Builds the edge lists from a dense `n * n` matrix.
    #[must_use]
    pub fn build(n: usize, coeffs: &[f64]) -> Self {
        let by_to = (0..n)
            .map(|to| {
                (0..n)
                    .filter(|&from| from != to)
                    .filter_map(|from| {
                        let coeff = coeffs[idx(n, from, to)];
                        (coeff.abs() > EDGE_EPSILON).then_some(Edge { from, coeff })
                    })
                    .collect()
            })
            .collect();
        Self { by_to }
    }

    /// Number of channels.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.by_to.len()
    }

    /// Incoming edges of `to`.
    #[must_use]
    pub fn edges(&self, to: usize) -> &[Edge] {
        &self.by_to[to]
    }

    /// Total number of non-zero edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.by_to.iter().map(Vec::len).sum()
    }

    /// Corrected value of channel `to` for one event.
    #[must_use]
    #[inline]
    pub fn apply<R: RawEvent + ?Sized>(&self, to: usize, raw: &R) -> f64 {
        self.by_to[to]
            .iter()
            .fold(raw.raw(to), |v, e| v - e.coeff * raw.raw(e.from))
    }

    /// Corrects a whole event into `out`.
    ///
    /// `raw` and `out` must both have one entry per channel.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn correct_event(&self, raw: &[f64], out: &mut [f32]) {
        for (to, slot) in out.iter_mut().enumerate() {
            *slot = self.apply(to, raw) as f32;
        }
    }
}

/// Immutable copy of the coefficients handed to background jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct CoeffSnapshot {
    pub n: usize,
    pub coeffs: Vec<f64>,
}

impl CoeffSnapshot {
    /// Sparse edges for this snapshot.
    #[must_use]
    pub fn adjacency(&self) -> Adjacency {
        Adjacency::build(self.n, &self.coeffs)
    }
}

/// Persisted compensation matrix: `{"version": 1, "nParams": n, "coeffs": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationFile {
    pub version: u32,
    pub n_params: usize,
    pub coeffs: Vec<f64>,
}

/// Editable spillover matrix for one open dataset.
#[derive(Debug, Clone)]
pub struct CompensationMatrix {
    n: usize,
    coeffs: Vec<f64>,
    original: Vec<f64>,
    dirty: bool,
    revision: u64,
    adjacency: Adjacency,
}

impl CompensationMatrix {
    /// An all-zero matrix for `n` channels.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self::with_seed(n, None)
    }

    /// A matrix seeded from a dense `n * n` spillover block.
    ///
    /// A seed of the wrong length is ignored. Seed values are clamped and the
    /// diagonal is zeroed; the result is also the reset baseline.
    #[must_use]
    pub fn with_seed(n: usize, seed: Option<&[f64]>) -> Self {
        let mut coeffs = vec![0.0; n * n];
        if let Some(seed) = seed.filter(|s| s.len() == n * n) {
            for (dst, &src) in coeffs.iter_mut().zip(seed) {
                *dst = clamp_coeff(src);
            }
            for i in 0..n {
                coeffs[idx(n, i, i)] = 0.0;
            }
        }
        let adjacency = Adjacency::build(n, &coeffs);
        Self {
            n,
            original: coeffs.clone(),
            coeffs,
            dirty: false,
            revision: 0,
            adjacency,
        }
    }

    /// Number of channels.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.n
    }

    /// True when any coefficient differs from the baseline.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Edit counter, bumped by every mutating call.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Dense coefficients, `coeffs[to * n + from]`.
    #[must_use]
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// Current sparse edges.
    #[must_use]
    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    fn check_pair(&self, from: usize, to: usize) -> Result<()> {
        for index in [from, to] {
            if index >= self.n {
                return Err(Error::ChannelOutOfRange {
                    index,
                    n_channels: self.n,
                });
            }
        }
        Ok(())
    }

    fn refresh(&mut self) {
        self.dirty = self.coeffs != self.original;
        self.adjacency = Adjacency::build(self.n, &self.coeffs);
        self.revision += 1;
    }

    /// Coefficient of `from -> to`; always 0 on the diagonal or out of range.
    #[must_use]
    pub fn coeff(&self, from: usize, to: usize) -> f64 {
        if from == to || from >= self.n || to >= self.n {
            return 0.0;
        }
        self.coeffs[idx(self.n, from, to)]
    }

    /// Sets `from -> to`, clamped. Diagonal writes are ignored.
    ///
    /// # Errors
    /// Returns [`Error::ChannelOutOfRange`] for an unknown channel.
    pub fn set_coeff(&mut self, from: usize, to: usize, v: f64) -> Result<()> {
        self.check_pair(from, to)?;
        if from == to {
            return Ok(());
        }
        self.coeffs[idx(self.n, from, to)] = clamp_coeff(v);
        self.refresh();
        Ok(())
    }

    /// Restores `from -> to` from the baseline.
    ///
    /// # Errors
    /// Returns [`Error::ChannelOutOfRange`] for an unknown channel.
    pub fn reset_pair(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_pair(from, to)?;
        if from == to {
            return Ok(());
        }
        let i = idx(self.n, from, to);
        self.coeffs[i] = self.original[i];
        self.refresh();
        Ok(())
    }

    /// Restores every coefficient from the baseline.
    pub fn reset_all(&mut self) {
        self.coeffs.clone_from(&self.original);
        self.refresh();
    }

    /// Corrected value of channel `to` for one event.
    #[must_use]
    #[inline]
    pub fn apply_value<R: RawEvent + ?Sized>(&self, to: usize, raw: &R) -> f64 {
        self.adjacency.apply(to, raw)
    }

    /// True iff the corrected event lies inside every rectangle of `chain`.
    ///
    /// An empty chain always passes.
    #[must_use]
    pub fn gate_passes<R: RawEvent + ?Sized>(&self, raw: &R, chain: &[GateRect]) -> bool {
        chain.iter().all(|g| {
            let x = self.apply_value(g.x_param, raw);
            let y = self.apply_value(g.y_param, raw);
            g.contains(x, y)
        })
    }

    /// [`Self::gate_passes`] for row `index` of a raw table.
    #[must_use]
    pub fn gate_passes_at(&self, index: usize, raw: &ChannelTable, chain: &[GateRect]) -> bool {
        self.gate_passes(&raw.event(index), chain)
    }

    /// Corrects every row of `raw` into a new table.
    ///
    /// # Errors
    /// Returns [`Error::ChannelOutOfRange`] if `raw` has a different channel count.
    pub fn correct_table(&self, raw: &ChannelTable) -> Result<ChannelTable> {
        if raw.n_channels() != self.n {
            return Err(Error::ChannelOutOfRange {
                index: raw.n_channels(),
                n_channels: self.n,
            });
        }
        let columns = (0..self.n)
            .into_par_iter()
            .map(|to| {
                (0..raw.len())
                    .map(|k| {
                        #[allow(clippy::cast_possible_truncation)]
                        let v = self.apply_value(to, &raw.event(k)) as f32;
                        v
                    })
                    .collect()
            })
            .collect();
        Ok(ChannelTable::from_columns(columns))
    }

    /// Non-zero edges sorted by descending magnitude.
    ///
    /// Ties keep discovery order: target ascending, then source ascending.
    #[must_use]
    pub fn worst_pairs(&self) -> Vec<SpillPair> {
        let mut pairs: Vec<SpillPair> = (0..self.n)
            .flat_map(|to| {
                self.adjacency.edges(to).iter().map(move |e| SpillPair {
                    from: e.from,
                    to,
                    coeff: e.coeff,
                })
            })
            .collect();
        pairs.sort_by(|a, b| b.coeff.abs().total_cmp(&a.coeff.abs()));
        pairs
    }

    /// Copy of the coefficients for a background job.
    #[must_use]
    pub fn snapshot(&self) -> CoeffSnapshot {
        CoeffSnapshot {
            n: self.n,
            coeffs: self.coeffs.clone(),
        }
    }

    /// Serializable form of the current coefficients.
    #[must_use]
    pub fn to_file(&self) -> CompensationFile {
        CompensationFile {
            version: COMPENSATION_FORMAT_VERSION,
            n_params: self.n,
            coeffs: self.coeffs.clone(),
        }
    }

    /// Replaces the coefficients and baseline from a persisted matrix.
    ///
    /// Values are clamped and the diagonal zeroed. On error the matrix is
    /// left untouched.
    ///
    /// # Errors
    /// Returns [`Error::CoeffShapeMismatch`] on a version, size or length mismatch.
    pub fn load_file(&mut self, file: &CompensationFile) -> Result<()> {
        if file.version != COMPENSATION_FORMAT_VERSION {
            return Err(Error::CoeffShapeMismatch(format!(
                "unsupported version {} (expected {COMPENSATION_FORMAT_VERSION})",
                file.version
            )));
        }
        if file.n_params != self.n {
            return Err(Error::CoeffShapeMismatch(format!(
                "nParams {} does not match dataset ({})",
                file.n_params, self.n
            )));
        }
        if file.coeffs.len() != self.n * self.n {
            return Err(Error::CoeffShapeMismatch(format!(
                "expected {} coefficients, got {}",
                self.n * self.n,
                file.coeffs.len()
            )));
        }
        let mut coeffs: Vec<f64> = file.coeffs.iter().copied().map(clamp_coeff).collect();
        for i in 0..self.n {
            coeffs[idx(self.n, i, i)] = 0.0;
        }
        self.original.clone_from(&coeffs);
        self.coeffs = coeffs;
        self.refresh();
        Ok(())
    }

    /// Parses and loads a JSON document in the persisted format.
    ///
    /// # Errors
    /// Returns [`Error::Json`] for malformed JSON and
    /// [`Error::CoeffShapeMismatch`] for a matrix of the wrong shape.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let file: CompensationFile = serde_json::from_str(json)?;
        self.load_file(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_diagonal_is_never_stored() {
        let mut m = CompensationMatrix::new(3);
        m.set_coeff(1, 1, 0.7).unwrap();
        assert_eq!(m.coeff(1, 1), 0.0);
        assert!(!m.is_dirty());
        assert_eq!(m.adjacency().edge_count(), 0);
    }

    #[test]
    fn test_set_coeff_clamps_and_tracks_dirty() {
        let mut m = CompensationMatrix::new(3);
        m.set_coeff(0, 2, 25.0).unwrap();
        assert_eq!(m.coeff(0, 2), MAX_ABS_COEFF);
        m.set_coeff(2, 0, f64::NAN).unwrap();
        assert_eq!(m.coeff(2, 0), 0.0);
        assert!(m.is_dirty());

        m.set_coeff(0, 2, 0.0).unwrap();
        assert!(!m.is_dirty());
        assert!(m.set_coeff(0, 3, 1.0).is_err());
    }

    #[test]
    fn test_reset_pair_and_all_restore_baseline() {
        let mut seed = vec![0.0; 4];
        seed[idx(2, 0, 1)] = 0.25;
        let mut m = CompensationMatrix::with_seed(2, Some(&seed));
        assert_eq!(m.coeff(0, 1), 0.25);

        m.set_coeff(0, 1, 0.5).unwrap();
        m.set_coeff(1, 0, 0.1).unwrap();
        m.reset_pair(0, 1).unwrap();
        assert_eq!(m.coeff(0, 1), 0.25);
        assert!(m.is_dirty());

        m.reset_all();
        assert_eq!(m.coeff(1, 0), 0.0);
        assert!(!m.is_dirty());
    }

    #[test]
    fn test_seed_is_sanitized() {
        let seed = [0.9, 12.0, f64::INFINITY, 0.3];
        let m = CompensationMatrix::with_seed(2, Some(&seed));
        assert_eq!(m.coeffs(), &[0.0, 10.0, 0.0, 0.0]);
        assert!(!m.is_dirty());

        let wrong = CompensationMatrix::with_seed(2, Some(&[1.0]));
        assert_eq!(wrong.coeffs(), &[0.0; 4]);
    }

    #[test]
    fn test_revision_counts_edits() {
        let mut m = CompensationMatrix::new(2);
        assert_eq!(m.revision(), 0);
        m.set_coeff(0, 1, 0.1).unwrap();
        m.reset_pair(0, 1).unwrap();
        m.reset_all();
        assert_eq!(m.revision(), 3);
        m.set_coeff(0, 0, 0.1).unwrap();
        assert_eq!(m.revision(), 3);
    }

    #[test]
    fn test_gate_passes_on_corrected_values() {
        let mut m = CompensationMatrix::new(2);
        m.set_coeff(0, 1, 0.5).unwrap();
        let raw = [100.0f64, 120.0];
        // corrected y = 120 - 0.5 * 100 = 70
        let inside = GateRect::new(0, 1, (0.0, 200.0), (60.0, 80.0));
        let outside = GateRect::new(0, 1, (0.0, 200.0), (100.0, 130.0));
        assert!(m.gate_passes(raw.as_slice(), &[]));
        assert!(m.gate_passes(raw.as_slice(), &[inside]));
        assert!(!m.gate_passes(raw.as_slice(), &[inside, outside]));
    }

    #[test]
    fn test_correct_table() {
        let mut m = CompensationMatrix::new(2);
        m.set_coeff(1, 0, 0.2).unwrap();
        let raw = ChannelTable::from_columns(vec![vec![100.0, 50.0], vec![10.0, 20.0]]);
        let corrected = m.correct_table(&raw).unwrap();
        assert_abs_diff_eq!(corrected.column(0).unwrap()[0], 98.0, epsilon = 1e-4);
        assert_abs_diff_eq!(corrected.column(0).unwrap()[1], 46.0, epsilon = 1e-4);
        assert_eq!(corrected.column(1).unwrap(), &[10.0, 20.0]);

        let other = ChannelTable::zeroed(3, 1);
        assert!(m.correct_table(&other).is_err());
    }

    #[test]
    fn test_load_file_rejects_bad_shape_without_mutation() {
        let mut m = CompensationMatrix::new(2);
        m.set_coeff(0, 1, 0.3).unwrap();
        let before = m.coeffs().to_vec();

        for bad in [
            CompensationFile { version: 2, n_params: 2, coeffs: vec![0.0; 4] },
            CompensationFile { version: 1, n_params: 3, coeffs: vec![0.0; 9] },
            CompensationFile { version: 1, n_params: 2, coeffs: vec![0.0; 3] },
        ] {
            assert!(matches!(m.load_file(&bad), Err(Error::CoeffShapeMismatch(_))));
        }
        assert!(matches!(m.load_json("{not json"), Err(Error::Json(_))));
        assert_eq!(m.coeffs(), before.as_slice());
        assert!(m.is_dirty());
    }

    #[test]
    fn test_load_json_becomes_baseline() {
        let mut m = CompensationMatrix::new(2);
        m.load_json(r#"{"version":1,"nParams":2,"coeffs":[5.0,-40.0,0.15,1.0]}"#)
            .unwrap();
        assert_eq!(m.coeffs(), &[0.0, -10.0, 0.15, 0.0]);
        assert!(!m.is_dirty());

        m.set_coeff(0, 1, 0.0).unwrap();
        m.reset_all();
        assert_eq!(m.coeff(0, 1), 0.15);

        let json = serde_json::to_string(&m.to_file()).unwrap();
        assert!(json.contains("\"nParams\":2"));
    }
}
