//! Multi-device block grid runtime core.
//!
//! [`domain`] partitions a sparse block grid along Z and classifies every
//! block of a partition as internal or boundary. [`engine`] holds the
//! containers whose field accesses are discovered by a parse pass, and the
//! [`Sequencer`](engine::Sequencer) that orders them and inserts halo
//! updates.

pub mod domain;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use domain::{
    Backend, BlockGrid, BlockGridConfig, ByDirection, ByDomain, ByPartition, DataView, Index3d, SetIdx,
    SpanClassifier, Stencil, ZDecomposition,
};
pub use engine::{
    AccessType, Container, Field, Loader, Occ, Sequencer, SequencerOptions, StencilSemantic, Token, TransferMode,
};
pub use error::{GridError, Result};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module definition
#[cfg(feature = "python")]
#[pymodule]
fn xgrid_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    telemetry::init_tracing(&telemetry::TracingConfig::default());
    m.add_class::<engine::controller::SpanReport>()?;
    Ok(())
}
