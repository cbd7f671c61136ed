//! cytocomp-core: Compensation, gating and density aggregation for cytometry events.
//!
//! This crate holds the I/O-free engines: the spillover matrix and its sparse
//! per-event correction, rectangular gates and the gate hierarchy, axis
//! transforms, per-channel column storage, and 2D density binning.
//!

pub mod compensation;
pub mod density;
pub mod error;
pub mod gate;
pub mod soa;
pub mod transform;

pub use compensation::{
    clamp_coeff, Adjacency, CoeffSnapshot, CompensationFile, CompensationMatrix, Edge, SpillPair,
};
pub use density::{aggregate, AxisRanges, DensityGrid, DensityQuery};
pub use error::{Error, Result};
pub use gate::{Gate, GateRect, GateTree, ROOT_GATE_ID};
pub use soa::{ChannelTable, EventView, RawEvent};
pub use transform::Transform;
