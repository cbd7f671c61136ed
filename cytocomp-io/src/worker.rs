//! Background compute worker.
//!
//! One long-lived thread owns the last completed [`FullDataset`] and runs
//! apply and density jobs in the order they arrive. Any cancelled apply
//! drops that dataset. The interactive side talks
//! to it only through [`Request`] and [`Response`] messages; the single shared
//! piece of state is the per-job [`CancelToken`].
//!
//! Before running anything the worker drains its queue and coalesces it: only
//! the newest apply survives, and only the newest density request per slot.

use crate::config::PipelineConfig;
use crate::job::{compute_density, run_apply, ApplyOutcome, CancelToken, FullDataset, Progress};
use crate::reader::EventSource;
use crate::{Error, Result};
use cytocomp_core::{CoeffSnapshot, DensityGrid, DensityQuery};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Messages sent to the worker thread.
#[derive(Debug)]
pub enum Request {
    /// Decode and correct the whole file.
    Apply {
        job_id: u64,
        source: EventSource,
        snapshot: CoeffSnapshot,
        revision: u64,
        cancel: CancelToken,
    },
    /// Aggregate the last completed full dataset.
    Density {
        slot: usize,
        request_id: u64,
        query: DensityQuery,
    },
    /// Cancel any queued apply. A running one is stopped through its token.
    Cancel,
    /// Cancel and drop the full dataset.
    Clear,
    Shutdown,
}

/// Messages sent back from the worker thread.
#[derive(Debug)]
pub enum Response {
    Progress {
        job_id: u64,
        progress: Progress,
    },
    ApplyDone {
        job_id: u64,
        n_events: usize,
        n_params: usize,
        revision: u64,
    },
    ApplyCancelled {
        job_id: u64,
    },
    ApplyError {
        job_id: u64,
        message: String,
    },
    DensityResult {
        slot: usize,
        request_id: u64,
        key: String,
        grid: Box<DensityGrid>,
    },
    DensityError {
        slot: usize,
        request_id: u64,
        message: String,
    },
    Cleared,
    /// A job panicked; the worker keeps running.
    Fault {
        message: String,
    },
}

/// Drops superseded requests from a drained batch.
///
/// Returns the requests to run plus the ids of applies dropped by a later
/// cancel or clear, which still owe their requester a terminal response.
fn coalesce(batch: Vec<Request>) -> (Vec<Request>, Vec<u64>) {
    let mut kept: Vec<Request> = Vec::with_capacity(batch.len());
    let mut cancelled = Vec::new();
    for request in batch {
        match &request {
            Request::Apply { .. } => kept.retain(|r| !matches!(r, Request::Apply { .. })),
            Request::Density { slot, .. } => {
                let slot = *slot;
                kept.retain(|r| !matches!(r, Request::Density { slot: s, .. } if *s == slot));
            }
            Request::Cancel | Request::Clear => {
                kept.retain(|r| match r {
                    Request::Apply { job_id, .. } => {
                        cancelled.push(*job_id);
                        false
                    }
                    _ => true,
                });
            }
            Request::Shutdown => {}
        }
        kept.push(request);
    }
    (kept, cancelled)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

struct WorkerState {
    config: PipelineConfig,
    full: Option<FullDataset>,
    tx: Sender<Response>,
}

impl WorkerState {
    fn send(&self, response: Response) {
        // The handle may already be gone during shutdown.
        let _ = self.tx.send(response);
    }

    /// Returns false on shutdown.
    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::Apply {
                job_id,
                source,
                snapshot,
                revision,
                cancel,
            } => self.apply(job_id, &source, &snapshot, revision, &cancel),
            Request::Density {
                slot,
                request_id,
                query,
            } => self.density(slot, request_id, &query),
            Request::Cancel => {}
            Request::Clear => {
                self.full = None;
                self.send(Response::Cleared);
            }
            Request::Shutdown => return false,
        }
        true
    }

    fn apply(
        &mut self,
        job_id: u64,
        source: &EventSource,
        snapshot: &CoeffSnapshot,
        revision: u64,
        cancel: &CancelToken,
    ) {
        log::info!("apply job {job_id} started at revision {revision}");
        let tx = self.tx.clone();
        let result = run_apply(source, snapshot, revision, cancel, self.config.chunk_size, |progress| {
            let _ = tx.send(Response::Progress { job_id, progress });
        });
        match result {
            Ok(ApplyOutcome::Completed(full)) => {
                let (n_events, n_params) = (full.n_events(), full.meta.n_params());
                self.full = Some(full);
                self.send(Response::ApplyDone {
                    job_id,
                    n_events,
                    n_params,
                    revision,
                });
            }
            Ok(ApplyOutcome::Cancelled) => {
                log::info!("apply job {job_id} cancelled");
                self.full = None;
                self.send(Response::ApplyCancelled { job_id });
            }
            Err(e) => {
                log::warn!("apply job {job_id} failed: {e}");
                self.send(Response::ApplyError {
                    job_id,
                    message: e.to_string(),
                });
            }
        }
    }

    fn density(&self, slot: usize, request_id: u64, query: &DensityQuery) {
        match compute_density(self.full.as_ref(), query) {
            Ok(grid) => self.send(Response::DensityResult {
                slot,
                request_id,
                key: query.key(),
                grid: Box::new(grid),
            }),
            Err(e) => self.send(Response::DensityError {
                slot,
                request_id,
                message: e.to_string(),
            }),
        }
    }
}

fn worker_loop(config: PipelineConfig, rx: &Receiver<Request>, tx: Sender<Response>) {
    let mut state = WorkerState {
        config,
        full: None,
        tx,
    };
    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        let (requests, cancelled) = coalesce(batch);
        if !cancelled.is_empty() {
            state.full = None;
        }
        for job_id in cancelled {
            state.send(Response::ApplyCancelled { job_id });
        }
        for request in requests {
            let outcome = catch_unwind(AssertUnwindSafe(|| state.handle(request)));
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("worker shutting down");
                    return;
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    log::error!("worker job panicked: {message}");
                    state.send(Response::Fault { message });
                }
            }
        }
    }
}

/// Handle to the background worker thread.
///
/// Dropping the handle cancels any running job and joins the thread.
pub struct BackgroundWorker {
    tx: Sender<Request>,
    rx: Receiver<Response>,
    thread: Option<JoinHandle<()>>,
    cancel: Option<CancelToken>,
    next_job_id: u64,
}

impl BackgroundWorker {
    /// Starts the worker thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(config: PipelineConfig) -> Result<Self> {
        let (req_tx, req_rx) = channel();
        let (resp_tx, resp_rx) = channel();
        let thread = thread::Builder::new()
            .name("cytocomp-worker".to_string())
            .spawn(move || worker_loop(config, &req_rx, resp_tx))?;
        Ok(Self {
            tx: req_tx,
            rx: resp_rx,
            thread: Some(thread),
            cancel: None,
            next_job_id: 1,
        })
    }

    fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| Error::WorkerFault("worker thread has stopped".to_string()))
    }

    fn cancel_running(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    /// Starts a full apply, superseding any previous one. Returns its job id.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn apply(
        &mut self,
        source: EventSource,
        snapshot: CoeffSnapshot,
        revision: u64,
    ) -> Result<u64> {
        self.cancel_running();
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        let cancel = CancelToken::new();
        self.cancel = Some(cancel.clone());
        self.send(Request::Apply {
            job_id,
            source,
            snapshot,
            revision,
            cancel,
        })?;
        Ok(job_id)
    }

    /// Cancels the current apply, queued or running.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn cancel(&mut self) -> Result<()> {
        self.cancel_running();
        self.send(Request::Cancel)
    }

    /// Cancels the current apply and drops the worker's full dataset.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn clear(&mut self) -> Result<()> {
        self.cancel_running();
        self.send(Request::Clear)
    }

    /// Queues a density computation for `slot`.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn request_density(&self, slot: usize, request_id: u64, query: DensityQuery) -> Result<()> {
        self.send(Request::Density {
            slot,
            request_id,
            query,
        })
    }

    /// Next response, if one is waiting.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn try_recv(&self) -> Result<Option<Response>> {
        match self.rx.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(Error::WorkerFault("worker thread has stopped".to_string()))
            }
        }
    }

    /// Waits up to `timeout` for the next response.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFault`] if the worker has stopped.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Response>> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => Ok(Some(response)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::WorkerFault("worker thread has stopped".to_string()))
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.cancel_running();
        let _ = self.tx.send(Request::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
