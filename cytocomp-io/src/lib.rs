//! cytocomp-io: File access and background jobs for cytocomp.
//!
//! This crate maps FCS files into memory, reads and writes compensation
//! files, and runs full-dataset apply and density jobs on a background
//! worker thread. [`Session`] is the interactive-side owner of one open
//! dataset and drives the worker through messages.
//!

pub mod config;
mod error;
pub mod job;
mod reader;
pub mod session;
pub mod worker;
mod writer;

pub use config::{PipelineConfig, DEFAULT_CHUNK_SIZE};
pub use error::{Error, Result};
pub use job::{
    compute_density, run_apply, ApplyOutcome, ApplyPhase, ApplyStatus, CancelToken, FullDataset,
    Progress,
};
pub use reader::{EventSource, FcsFileReader, MappedFileReader, SourceBytes};
pub use session::{ApplyJob, CachedDensity, Dataset, Session};
pub use worker::{BackgroundWorker, Request, Response};
pub use writer::{load_compensation, read_compensation, save_compensation};
