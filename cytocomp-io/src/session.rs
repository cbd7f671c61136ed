//! Interactive-side state for one open dataset.
//!
//! The session owns the decoded preview, the compensation matrix, the gate
//! tree, the apply-job tracker and the per-slot density cache. It never
//! blocks on decoding or aggregation of the full event set: those run on the
//! [`BackgroundWorker`], and their responses are folded back in by
//! [`Session::poll`] or the `wait_*` helpers.
//!
//! Staleness is checked optimistically. An apply result carries the matrix
//! revision it started from, and a density response is only kept if its
//! request id is still the one pending for its slot.

use crate::config::PipelineConfig;
use crate::job::{ApplyPhase, ApplyStatus};
use crate::reader::{EventSource, FcsFileReader};
use crate::worker::{BackgroundWorker, Response};
use crate::{Error, Result};
use cytocomp_core::{
    aggregate, ChannelTable, CompensationMatrix, DensityGrid, DensityQuery, GateRect, GateTree,
};
use cytocomp_fcs::{parse_fcs_with_preview, FcsFile};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// Tracker for the most recent apply job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyJob {
    pub status: ApplyStatus,
    pub phase: Option<ApplyPhase>,
    pub done: u64,
    pub total: u64,
    /// Matrix revision the job started from.
    pub applied_revision: Option<u64>,
    pub error: Option<String>,
    job_id: Option<u64>,
}

impl ApplyJob {
    fn running(job_id: u64, revision: u64) -> Self {
        Self {
            status: ApplyStatus::Running,
            applied_revision: Some(revision),
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    fn is_current(&self, job_id: u64) -> bool {
        self.job_id == Some(job_id)
    }

    fn fail(&mut self, message: String) {
        self.status = ApplyStatus::Error;
        self.error = Some(message);
    }
}

#[derive(Debug, Clone)]
struct PendingDensity {
    request_id: u64,
    key: String,
}

/// A density grid and the query key it was computed for.
#[derive(Debug, Clone)]
pub struct CachedDensity {
    pub key: String,
    pub grid: DensityGrid,
}

#[derive(Debug, Default)]
struct DensitySlot {
    pending: Option<PendingDensity>,
    cached: Option<CachedDensity>,
    error: Option<String>,
}

/// The open dataset and where its bytes come from.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub file: FcsFile,
    pub source: EventSource,
}

/// Interactive session over at most one open dataset.
pub struct Session {
    config: PipelineConfig,
    worker: BackgroundWorker,
    dataset: Option<Dataset>,
    matrix: CompensationMatrix,
    gates: GateTree,
    apply: ApplyJob,
    full_revision: Option<u64>,
    slots: HashMap<usize, DensitySlot>,
    next_request_id: u64,
}

impl Session {
    /// Creates an empty session and starts its worker.
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let worker = BackgroundWorker::spawn(config.clone())?;
        Ok(Self {
            config,
            worker,
            dataset: None,
            matrix: CompensationMatrix::new(0),
            gates: GateTree::default(),
            apply: ApplyJob::default(),
            full_revision: None,
            slots: HashMap::new(),
            next_request_id: 1,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Decodes an in-memory file and makes it the open dataset.
    ///
    /// On failure the previous dataset stays open.
    ///
    /// # Errors
    /// Any decode error, or a stopped worker.
    pub fn load_bytes(&mut self, bytes: Vec<u8>) -> Result<&Dataset> {
        let file = parse_fcs_with_preview(&bytes, self.config.preview_cap)?;
        self.install(Dataset {
            file,
            source: EventSource::from(bytes),
        })
    }

    /// Maps and decodes a file on disk and makes it the open dataset.
    ///
    /// On failure the previous dataset stays open.
    ///
    /// # Errors
    /// Any I/O or decode error, or a stopped worker.
    pub fn load_path<P: AsRef<Path>>(&mut self, path: P) -> Result<&Dataset> {
        let reader = FcsFileReader::open_with_preview(&path, self.config.preview_cap)?;
        let source = EventSource::File(reader.path().to_path_buf());
        self.install(Dataset {
            file: reader.into_file(),
            source,
        })
    }

    fn install(&mut self, dataset: Dataset) -> Result<&Dataset> {
        self.clear_full()?;
        let n = dataset.file.meta.n_params();
        self.matrix = CompensationMatrix::with_seed(n, dataset.file.spillover());
        self.gates.clear();
        log::info!(
            "opened dataset: {} events, {n} parameters, spillover {}",
            dataset.file.meta.n_events,
            if dataset.file.spillover().is_some() { "embedded" } else { "absent" }
        );
        Ok(self.dataset.insert(dataset))
    }

    #[must_use]
    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    #[must_use]
    pub fn matrix(&self) -> &CompensationMatrix {
        &self.matrix
    }

    /// Mutable matrix access. Every edit bumps the matrix revision, which
    /// marks any completed full result as out of date.
    pub fn matrix_mut(&mut self) -> &mut CompensationMatrix {
        &mut self.matrix
    }

    #[must_use]
    pub fn gates(&self) -> &GateTree {
        &self.gates
    }

    pub fn gates_mut(&mut self) -> &mut GateTree {
        &mut self.gates
    }

    /// Gate chain of the selected gate.
    #[must_use]
    pub fn selected_chain(&self) -> Vec<GateRect> {
        self.gates.selected_chain()
    }

    /// Preview events corrected with the current matrix.
    ///
    /// # Errors
    /// Returns [`Error::NoDataset`] when nothing is open.
    pub fn preview_corrected(&self) -> Result<ChannelTable> {
        let dataset = self.dataset.as_ref().ok_or(Error::NoDataset)?;
        Ok(self.matrix.correct_table(&dataset.file.preview.table)?)
    }

    /// Density over the corrected preview, computed synchronously.
    ///
    /// # Errors
    /// Returns [`Error::NoDataset`] when nothing is open, or a core error for
    /// channels out of range.
    pub fn preview_density(&self, query: &DensityQuery) -> Result<DensityGrid> {
        Ok(aggregate(&self.preview_corrected()?, query)?)
    }

    /// Starts a full apply with the current coefficients. Returns the job id.
    ///
    /// A running job is superseded.
    ///
    /// # Errors
    /// Returns [`Error::NoDataset`] when nothing is open, or a stopped worker.
    pub fn start_apply(&mut self) -> Result<u64> {
        let source = self.dataset.as_ref().ok_or(Error::NoDataset)?.source.clone();
        let revision = self.matrix.revision();
        let job_id = self.worker.apply(source, self.matrix.snapshot(), revision)?;
        self.apply = ApplyJob::running(job_id, revision);
        Ok(job_id)
    }

    /// Requests cancellation of the running apply.
    ///
    /// # Errors
    /// Returns an error if the worker has stopped.
    pub fn cancel_apply(&mut self) -> Result<()> {
        self.worker.cancel()
    }

    /// Cancels any apply and drops the full dataset and density cache.
    ///
    /// # Errors
    /// Returns an error if the worker has stopped.
    pub fn clear_full(&mut self) -> Result<()> {
        self.worker.clear()?;
        self.apply = ApplyJob::default();
        self.full_revision = None;
        self.slots.clear();
        Ok(())
    }

    #[must_use]
    pub fn apply_job(&self) -> &ApplyJob {
        &self.apply
    }

    /// Revision of the full result the worker holds, if any.
    #[must_use]
    pub fn full_revision(&self) -> Option<u64> {
        self.full_revision
    }

    /// True iff the last apply finished and no edit happened since it started.
    #[must_use]
    pub fn is_full_up_to_date(&self) -> bool {
        self.apply.status == ApplyStatus::Done
            && self.apply.applied_revision == Some(self.matrix.revision())
    }

    /// Requests a full-resolution density for `slot`.
    ///
    /// Returns the new request id, or `None` when the slot already holds or
    /// awaits a result for the same query.
    ///
    /// # Errors
    /// Returns an error if the worker has stopped.
    pub fn request_density(&mut self, slot: usize, query: DensityQuery) -> Result<Option<u64>> {
        let key = query.key();
        let entry = self.slots.entry(slot).or_default();
        let cached = entry.cached.as_ref().is_some_and(|c| c.key == key);
        let pending = entry.pending.as_ref().is_some_and(|p| p.key == key);
        if cached || pending {
            return Ok(None);
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        entry.pending = Some(PendingDensity { request_id, key });
        entry.error = None;
        self.worker.request_density(slot, request_id, query)?;
        Ok(Some(request_id))
    }

    /// Cached density for `slot`, if it was computed for exactly `query`.
    #[must_use]
    pub fn density(&self, slot: usize, query: &DensityQuery) -> Option<&DensityGrid> {
        let cached = self.slots.get(&slot)?.cached.as_ref()?;
        (cached.key == query.key()).then_some(&cached.grid)
    }

    /// Most recent cached density for `slot`, whatever its query.
    #[must_use]
    pub fn cached_density(&self, slot: usize) -> Option<&CachedDensity> {
        self.slots.get(&slot)?.cached.as_ref()
    }

    #[must_use]
    pub fn density_pending(&self, slot: usize) -> bool {
        self.slots.get(&slot).is_some_and(|s| s.pending.is_some())
    }

    /// Error from the last accepted density response for `slot`.
    #[must_use]
    pub fn density_error(&self, slot: usize) -> Option<&str> {
        self.slots.get(&slot)?.error.as_deref()
    }

    /// Folds one worker response into the session state.
    ///
    /// Responses for superseded jobs or requests are dropped.
    pub fn handle_response(&mut self, response: Response) {
        match response {
            Response::Progress { job_id, progress } => {
                if self.apply.is_current(job_id) && self.apply.status == ApplyStatus::Running {
                    if self.apply.phase != Some(progress.phase) {
                        self.apply.done = 0;
                    }
                    self.apply.phase = Some(progress.phase);
                    self.apply.done = self.apply.done.max(progress.done);
                    self.apply.total = progress.total;
                }
            }
            Response::ApplyDone {
                job_id, revision, ..
            } => {
                if self.apply.is_current(job_id) {
                    self.apply.status = ApplyStatus::Done;
                    self.apply.applied_revision = Some(revision);
                    self.full_revision = Some(revision);
                    // Densities of the previous full result no longer apply.
                    for slot in self.slots.values_mut() {
                        slot.cached = None;
                    }
                }
            }
            Response::ApplyCancelled { job_id } => {
                // The worker drops its full dataset on any cancel.
                self.full_revision = None;
                for slot in self.slots.values_mut() {
                    slot.cached = None;
                }
                if self.apply.is_current(job_id) {
                    self.apply.status = ApplyStatus::Cancelled;
                }
            }
            Response::ApplyError { job_id, message } => {
                if self.apply.is_current(job_id) {
                    self.apply.fail(message);
                }
            }
            Response::DensityResult {
                slot,
                request_id,
                key,
                grid,
            } => match self.slots.get_mut(&slot) {
                Some(entry) if entry.pending.as_ref().is_some_and(|p| p.request_id == request_id) => {
                    entry.pending = None;
                    entry.cached = Some(CachedDensity { key, grid: *grid });
                }
                _ => log::debug!("dropping stale density response {request_id} for slot {slot}"),
            },
            Response::DensityError {
                slot,
                request_id,
                message,
            } => match self.slots.get_mut(&slot) {
                Some(entry) if entry.pending.as_ref().is_some_and(|p| p.request_id == request_id) => {
                    entry.pending = None;
                    entry.error = Some(message);
                }
                _ => log::debug!("dropping stale density error {request_id} for slot {slot}"),
            },
            Response::Cleared => log::debug!("worker cleared its full dataset"),
            Response::Fault { message } => {
                if self.apply.status == ApplyStatus::Running {
                    self.apply.fail(Error::WorkerFault(message.clone()).to_string());
                }
                for slot in self.slots.values_mut() {
                    if slot.pending.take().is_some() {
                        slot.error = Some(message.clone());
                    }
                }
            }
        }
    }

    /// Handles every response already waiting. Returns how many were handled.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn poll(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(response) = self.worker.try_recv()? {
            self.handle_response(response);
            handled += 1;
        }
        Ok(handled)
    }

    /// Waits up to `timeout` for one response and handles it.
    /// Returns false on timeout.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn poll_timeout(&mut self, timeout: Duration) -> Result<bool> {
        match self.worker.recv_timeout(timeout)? {
            Some(response) => {
                self.handle_response(response);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handles responses until the apply job leaves `Running` or `timeout`
    /// elapses. Returns the status at that point.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn wait_for_apply(&mut self, timeout: Duration) -> Result<ApplyStatus> {
        let deadline = Instant::now() + timeout;
        while self.apply.status == ApplyStatus::Running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.poll_timeout(remaining)? {
                break;
            }
        }
        Ok(self.apply.status)
    }

    /// Handles responses until `slot` has no pending request or `timeout`
    /// elapses. Returns the cached grid, if any.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn wait_for_density(&mut self, slot: usize, timeout: Duration) -> Result<Option<&DensityGrid>> {
        let deadline = Instant::now() + timeout;
        while self.density_pending(slot) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.poll_timeout(remaining)? {
                break;
            }
        }
        Ok(self.cached_density(slot).map(|c| &c.grid))
    }
}
