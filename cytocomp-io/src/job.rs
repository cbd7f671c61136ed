//! Full-dataset decode-and-correct jobs.
//!
//! A job runs the phases `reading → parsing → applying → finalizing` in
//! order. Cancellation is cooperative: the token is polled between phases
//! and before every event while applying, so a cancelled job stops within
//! one event and never produces a result.

use crate::reader::EventSource;
use crate::{Error, Result};
use cytocomp_core::{aggregate, ChannelTable, CoeffSnapshot, DensityGrid, DensityQuery};
use cytocomp_fcs::{DatasetMeta, EventReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of the apply job tracked by the interactive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyStatus {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
    Error,
}

impl ApplyStatus {
    /// True for `Done`, `Cancelled` and `Error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }
}

/// Ordered phases of a running apply job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApplyPhase {
    Reading,
    Parsing,
    Applying,
    Finalizing,
}

impl ApplyPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Parsing => "parsing",
            Self::Applying => "applying",
            Self::Finalizing => "finalizing",
        }
    }
}

/// Progress report. `total == 0` means indeterminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub phase: ApplyPhase,
    pub done: u64,
    pub total: u64,
}

impl Progress {
    fn indeterminate(phase: ApplyPhase) -> Self {
        Self {
            phase,
            done: 0,
            total: 0,
        }
    }

    /// Completed fraction, `None` when indeterminate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| self.done as f64 / self.total as f64)
    }
}

/// Cooperative cancellation flag shared between a job and its requester.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Every event of a file, corrected with one coefficient snapshot.
#[derive(Debug, Clone)]
pub struct FullDataset {
    pub meta: DatasetMeta,
    /// Corrected values, one column per parameter.
    pub table: ChannelTable,
    /// Matrix revision the coefficients were taken at.
    pub revision: u64,
}

impl FullDataset {
    #[must_use]
    pub fn n_events(&self) -> usize {
        self.table.len()
    }

    /// Density over the corrected events.
    ///
    /// # Errors
    /// Returns an error if the query names a channel this dataset lacks.
    pub fn density(&self, query: &DensityQuery) -> Result<DensityGrid> {
        Ok(aggregate(&self.table, query)?)
    }
}

/// How a job ended when it did not fail.
#[derive(Debug)]
pub enum ApplyOutcome {
    Completed(FullDataset),
    Cancelled,
}

/// Density over an optional full dataset.
///
/// # Errors
/// Returns [`Error::NoFullData`] if no apply has completed, or a core error
/// for channels out of range.
pub fn compute_density(full: Option<&FullDataset>, query: &DensityQuery) -> Result<DensityGrid> {
    full.ok_or(Error::NoFullData)?.density(query)
}

fn check_snapshot(snapshot: &CoeffSnapshot, n_params: usize) -> Result<()> {
    if snapshot.n != n_params || snapshot.coeffs.len() != n_params * n_params {
        return Err(cytocomp_core::Error::CoeffShapeMismatch(format!(
            "coefficient snapshot has {} values for {} parameters (expected {})",
            snapshot.coeffs.len(),
            n_params,
            n_params * n_params
        ))
        .into());
    }
    Ok(())
}

/// Decodes and corrects every event of `source`.
///
/// `on_progress` is called at each phase start and after every `chunk`
/// events while applying; `done` never decreases.
///
/// # Errors
/// Any read or decode error, or a snapshot that does not fit the file.
/// Cancellation is not an error: it yields [`ApplyOutcome::Cancelled`].
pub fn run_apply<F>(
    source: &EventSource,
    snapshot: &CoeffSnapshot,
    revision: u64,
    cancel: &CancelToken,
    chunk: usize,
    mut on_progress: F,
) -> Result<ApplyOutcome>
where
    F: FnMut(Progress),
{
    let start = Instant::now();
    let chunk = chunk.max(1);

    if cancel.is_cancelled() {
        return Ok(ApplyOutcome::Cancelled);
    }
    on_progress(Progress::indeterminate(ApplyPhase::Reading));
    let bytes = source.load()?;
    if cancel.is_cancelled() {
        return Ok(ApplyOutcome::Cancelled);
    }

    on_progress(Progress::indeterminate(ApplyPhase::Parsing));
    let (meta, _text) = DatasetMeta::decode(bytes.as_ref())?;
    check_snapshot(snapshot, meta.n_params())?;
    let reader = EventReader::new(bytes.as_ref(), &meta)?;
    if cancel.is_cancelled() {
        return Ok(ApplyOutcome::Cancelled);
    }

    let n_events = reader.n_events();
    let n_params = reader.n_params();
    let total = n_events as u64;
    on_progress(Progress {
        phase: ApplyPhase::Applying,
        done: 0,
        total,
    });

    let adjacency = snapshot.adjacency();
    let mut columns: Vec<Vec<f32>> = (0..n_params).map(|_| Vec::with_capacity(n_events)).collect();
    let mut raw = vec![0.0f64; n_params];
    let mut corrected = vec![0.0f32; n_params];
    for i in 0..n_events {
        if cancel.is_cancelled() {
            log::info!("apply cancelled after {i} of {n_events} events");
            return Ok(ApplyOutcome::Cancelled);
        }
        reader.read_event_into(i, &mut raw);
        adjacency.correct_event(&raw, &mut corrected);
        for (column, &v) in columns.iter_mut().zip(&corrected) {
            column.push(v);
        }
        let done = i + 1;
        if done % chunk == 0 || done == n_events {
            on_progress(Progress {
                phase: ApplyPhase::Applying,
                done: done as u64,
                total,
            });
        }
    }

    on_progress(Progress {
        phase: ApplyPhase::Finalizing,
        done: total,
        total,
    });
    let full = FullDataset {
        table: ChannelTable::from_columns(columns),
        meta,
        revision,
    };
    log::info!(
        "applied {} edges to {n_events} events x {n_params} params in {:.2?}",
        adjacency.edge_count(),
        start.elapsed()
    );
    Ok(ApplyOutcome::Completed(full))
}
